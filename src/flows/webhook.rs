// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Outbound HTTP calls made by `function` nodes.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;

use crate::flows::definition::WebhookCall;
use crate::flows::interpolate::{interpolate, interpolate_value, lookup_path};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("webhook returned HTTP {status}")]
    Status { status: u16 },
}

/// Result of one successful webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    /// Parsed JSON body, `Null` for an empty or non-JSON body.
    pub body: Value,
    /// Variables extracted through `responseMapping`.
    pub variables: HashMap<String, Value>,
}

/// Executes templated webhook requests with a per-request timeout.
#[derive(Debug, Clone, Default)]
pub struct WebhookClient {
    client: reqwest::Client,
}

impl WebhookClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Render `call` against `variables`, send it, and map the response.
    pub async fn call(
        &self,
        call: &WebhookCall,
        variables: &HashMap<String, Value>,
    ) -> Result<WebhookResponse, WebhookError> {
        let url = interpolate(&call.url, variables);
        let method = Method::from_bytes(call.method.trim().to_uppercase().as_bytes())
            .map_err(|_| WebhookError::InvalidRequest(format!("bad method '{}'", call.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &call.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| WebhookError::InvalidRequest(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(&interpolate(value, variables))
                .map_err(|e| WebhookError::InvalidRequest(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }

        let mut request = self
            .client
            .request(method.clone(), &url)
            .headers(headers)
            .timeout(Duration::from_millis(call.timeout_ms));
        if let Some(body) = &call.body {
            if method != Method::GET {
                request = request.json(&interpolate_value(body, variables));
            }
        }

        tracing::debug!(method = %method, url = %url, "webhook: sending");
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                WebhookError::Timeout(call.timeout_ms)
            } else {
                WebhookError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status {
                status: status.as_u16(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| WebhookError::Transport(e.to_string()))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        let variables = map_response(&call.response_mapping, &body);
        Ok(WebhookResponse {
            status: status.as_u16(),
            body,
            variables,
        })
    }
}

/// Pick `variable -> path` entries out of a JSON response. Paths that do not
/// resolve are skipped.
pub fn map_response(mapping: &HashMap<String, String>, body: &Value) -> HashMap<String, Value> {
    mapping
        .iter()
        .filter_map(|(var, path)| {
            let found = lookup_path(body, path);
            if found.is_none() {
                tracing::debug!(variable = %var, path = %path, "webhook: mapping path not found");
            }
            found.map(|v| (var.clone(), v.clone()))
        })
        .collect()
}
