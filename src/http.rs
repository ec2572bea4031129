// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Registration API.
//!
//! The call orchestrator posts an [`AgentConfig`] for a session id before it
//! points the channel driver at the AudioSocket port.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::BridgeError;
use crate::session::BridgeContext;

/// Error body returned by the registration API.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unprocessable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::Unprocessable(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_config", msg)
            }
        };
        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(e) => Self::Unprocessable(e.body_text()),
            other => Self::BadRequest(other.body_text()),
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Validation(msg) => Self::Unprocessable(msg),
            other => Self::BadRequest(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub session_id: String,
    pub agent_id: String,
    pub mode: String,
    pub replaced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<String>,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Build the registration router over the shared bridge context.
pub fn router(ctx: Arc<BridgeContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route(
            "/sessions/:id",
            post(register_session).delete(withdraw_session),
        )
        .with_state(ctx)
}

fn parse_session_id(raw: &str) -> Result<String, ApiError> {
    Uuid::parse_str(raw)
        .map(|id| id.to_string())
        .map_err(|_| ApiError::BadRequest(format!("'{raw}' is not a valid session id")))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_sessions(State(ctx): State<Arc<BridgeContext>>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: ctx.sessions.ids(),
        pending: ctx.pending.len(),
    })
}

async fn register_session(
    State(ctx): State<Arc<BridgeContext>>,
    Path(raw_id): Path<String>,
    body: Result<Json<AgentConfig>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let session_id = parse_session_id(&raw_id)?;
    let Json(config) = body?;
    let agent_id = config.agent_id.clone();
    let mode = config.mode.name().to_string();
    let replaced = ctx.register(&session_id, config)?;

    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(RegisterResponse {
            session_id,
            agent_id,
            mode,
            replaced,
        }),
    ))
}

async fn withdraw_session(
    State(ctx): State<Arc<BridgeContext>>,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session_id = parse_session_id(&raw_id)?;
    if ctx.pending.remove(&session_id) {
        tracing::info!(session_id = %session_id, "http: registration withdrawn");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "no pending registration for {session_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_is_normalized() {
        let id = parse_session_id("4F0C6E3A-1B2C-4D5E-8F90-A1B2C3D4E5F6").unwrap();
        assert_eq!(id, "4f0c6e3a-1b2c-4d5e-8f90-a1b2c3d4e5f6");
        assert!(matches!(
            parse_session_id("not-a-uuid"),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_validation_error_is_unprocessable() {
        let err: ApiError = BridgeError::Validation("no start node".into()).into();
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
