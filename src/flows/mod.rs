// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Conversation flows: a versioned node/edge graph walked by [`FlowEngine`].
//!
//! The engine executes node handlers, selects branch routes, and emits
//! per-conversation [`FlowEvent`]s that the call session turns into speech,
//! listening windows, transfers, and hangups.

pub mod branch;
pub mod definition;
pub mod engine;
pub mod events;
pub mod executors;
pub mod interpolate;
pub mod state;
pub mod store;
pub mod webhook;

pub use definition::{FlowDefinition, FlowEdge, FlowNode, NodeKind};
pub use engine::{FlowEngine, Transition};
pub use events::{FlowAction, FlowEvent, FlowEventHub, FlowEventKind, FlowSubscription};
pub use state::{BranchDecision, FlowLifecycle, FlowState};
pub use store::{FlowStateStore, InMemoryFlowStateStore, StoreError};

/// Errors raised by the flow engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// The definition breaks a structural rule (start node count, unknown
    /// node type, dangling edge).
    #[error("invalid flow: {0}")]
    Validation(String),
    #[error("node '{0}' not found")]
    NodeNotFound(String),
    /// No live, non-terminal flow for the conversation.
    #[error("no active flow for conversation '{0}'")]
    NotActive(String),
    #[error("conversation '{0}' already has an active flow")]
    AlreadyActive(String),
    #[error("flow exceeded {0} steps without waiting for input")]
    StepLimit(usize),
    #[error("node '{node_id}' failed: {message}")]
    Execution { node_id: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}
