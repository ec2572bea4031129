// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Crate-level error taxonomy.
//!
//! Each subsystem owns a narrow error type ([`ProtocolError`],
//! [`ServiceError`], [`FlowError`], [`ConfigError`]); [`BridgeError`] folds
//! them together for the server and binary entry points.

pub use crate::config::ConfigError;
pub use crate::flows::FlowError;
pub use crate::serializers::ProtocolError;
pub use crate::services::ServiceError;

/// Top-level error for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Malformed or unknown frame on the AudioSocket connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Provider connect failure or handshake timeout.
    #[error("connection error: {0}")]
    Connection(String),
    /// The remote provider closed its side of the session.
    #[error("provider disconnected: {0}")]
    ProviderDisconnect(String),
    /// A flow node failed without a recoverable route.
    #[error("flow error: {0}")]
    Flow(FlowError),
    /// Flow definition or agent configuration rejected before use.
    #[error("validation error: {0}")]
    Validation(String),
    /// Process configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ServiceError> for BridgeError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Disconnected(reason) => Self::ProviderDisconnect(reason),
            other => Self::Connection(other.to_string()),
        }
    }
}

impl From<FlowError> for BridgeError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Validation(msg) => Self::Validation(msg),
            other => Self::Flow(other),
        }
    }
}

/// Convenience alias used by the server and session layers.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
