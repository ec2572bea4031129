// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! OpenAI chat-completion client.
//!
//! [`OpenAILlmClient`] performs one-shot, non-streaming calls against
//! `/v1/chat/completions` (or any compatible endpoint). Flow nodes use it for
//! generated replies and intent classification; the pipeline mode uses it for
//! each caller turn.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::services::{ChatMessage, LlmClient, ServiceError};

/// Body sent to `/v1/chat/completions`.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI chat-completion client.
#[derive(Clone)]
pub struct OpenAILlmClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
    temperature: Option<f64>,
    max_tokens: Option<u64>,
}

impl OpenAILlmClient {
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    /// Pass an empty `model` to use [`Self::DEFAULT_MODEL`].
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let model = if model.is_empty() {
            Self::DEFAULT_MODEL.to_string()
        } else {
            model
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("OpenAILlmClient: falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self {
            api_key: api_key.into(),
            model,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            client,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Builder method: set the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builder method: set a custom base URL (local proxies, compatible APIs).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request<'a>(&'a self, messages: &'a [ChatMessage]) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.model,
            messages,
            stream: false,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

impl fmt::Debug for OpenAILlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAILlmClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl LlmClient for OpenAILlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(messages))
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "chat completion request failed");
                ServiceError::Http(e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body_text, "chat completion API error");
            return Err(ServiceError::Http(format!("{status}: {body_text}")));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Protocol(format!("invalid completion response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| ServiceError::Protocol("completion has no content".into()))?;
        debug!(model = %self.model, chars = content.len(), "chat completion done");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_client_defaults_and_builder() {
        let llm = OpenAILlmClient::new("sk-test", "");
        assert_eq!(llm.model(), OpenAILlmClient::DEFAULT_MODEL);

        let llm = OpenAILlmClient::new("sk-test", "gpt-4o")
            .with_base_url("https://proxy.example.test/")
            .with_temperature(0.2)
            .with_max_tokens(64);
        assert_eq!(llm.base_url, "https://proxy.example.test");
        assert_eq!(llm.temperature, Some(0.2));
        assert_eq!(llm.max_tokens, Some(64));
    }

    #[test]
    fn test_request_body_shape() {
        let llm = OpenAILlmClient::new("sk", "gpt-4o");
        let messages = [ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let body = serde_json::to_value(llm.build_request(&messages)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][1]["role"], "user");
        assert!(body.get("temperature").is_none());
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "billing"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let llm = OpenAILlmClient::new("sk-test", "").with_base_url(server.uri());
        let out = llm.complete(&[ChatMessage::user("my bill")]).await.unwrap();
        assert_eq!(out, "billing");
    }

    #[tokio::test]
    async fn test_complete_maps_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let llm = OpenAILlmClient::new("sk", "").with_base_url(server.uri());
        let err = llm.complete(&[ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Http(ref m) if m.contains("429")));
    }

    #[tokio::test]
    async fn test_complete_without_content_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let llm = OpenAILlmClient::new("sk", "").with_base_url(server.uri());
        let err = llm.complete(&[ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Protocol(_)));
    }
}
