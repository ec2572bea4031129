// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Runtime state of one conversation's flow.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowLifecycle {
    Active,
    Paused,
    WaitingInput,
    Completed,
    Error,
}

impl FlowLifecycle {
    /// `completed` and `error` admit no further execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::WaitingInput => "waiting_input",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FlowLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a route chosen by a branch node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchDecision {
    pub node_id: String,
    /// Human-readable description of what matched.
    pub condition: String,
    pub selected_output: String,
    pub timestamp: DateTime<Utc>,
}

impl BranchDecision {
    pub fn new(
        node_id: impl Into<String>,
        condition: impl Into<String>,
        selected_output: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            condition: condition.into(),
            selected_output: selected_output.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Snapshot of a flow run.
///
/// `visited_nodes` and `branch_decisions` only ever grow. The engine owns the
/// authoritative copy; callers receive clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub id: Uuid,
    pub conversation_id: String,
    pub agent_id: String,
    pub current_node_id: String,
    pub variables: HashMap<String, Value>,
    pub visited_nodes: Vec<String>,
    pub branch_decisions: Vec<BranchDecision>,
    pub state: FlowLifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FlowState {
    pub fn new(
        conversation_id: impl Into<String>,
        agent_id: impl Into<String>,
        start_node_id: impl Into<String>,
        variables: HashMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            agent_id: agent_id.into(),
            current_node_id: start_node_id.into(),
            variables,
            visited_nodes: Vec::new(),
            branch_decisions: Vec::new(),
            state: FlowLifecycle::Active,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Move to `lifecycle`, stamping `completed_at` on completion.
    ///
    /// Returns the previous lifecycle.
    pub(crate) fn set_lifecycle(&mut self, lifecycle: FlowLifecycle) -> FlowLifecycle {
        let previous = self.state;
        self.state = lifecycle;
        self.updated_at = Utc::now();
        if lifecycle == FlowLifecycle::Completed && self.completed_at.is_none() {
            self.completed_at = Some(self.updated_at);
        }
        previous
    }

    pub(crate) fn enter_node(&mut self, node_id: &str) {
        node_id.clone_into(&mut self.current_node_id);
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_visited(&mut self, node_id: &str) {
        self.visited_nodes.push(node_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_active() {
        let state = FlowState::new("conv", "agent", "start", HashMap::new());
        assert_eq!(state.state, FlowLifecycle::Active);
        assert_eq!(state.current_node_id, "start");
        assert!(state.visited_nodes.is_empty());
        assert!(state.completed_at.is_none());
    }

    #[test]
    fn test_completion_stamps_time() {
        let mut state = FlowState::new("conv", "agent", "start", HashMap::new());
        let prev = state.set_lifecycle(FlowLifecycle::Completed);
        assert_eq!(prev, FlowLifecycle::Active);
        assert!(state.completed_at.is_some());
        assert!(state.state.is_terminal());
    }

    #[test]
    fn test_lifecycle_serializes_snake_case() {
        let json = serde_json::to_string(&FlowLifecycle::WaitingInput).unwrap();
        assert_eq!(json, "\"waiting_input\"");
        assert_eq!(FlowLifecycle::Paused.to_string(), "paused");
    }
}
