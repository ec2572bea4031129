// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Persistence of flow state.
//!
//! The engine keeps an in-memory working copy of every live flow and mirrors
//! each mutation here. The store is the restart source for
//! [`FlowEngine::resume_flow`](crate::flows::FlowEngine::resume_flow).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::flows::state::{BranchDecision, FlowLifecycle, FlowState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("flow state {0} not found")]
    NotFound(Uuid),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistent record of flow runs.
#[async_trait]
pub trait FlowStateStore: Send + Sync {
    async fn create(&self, state: &FlowState) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<FlowState>, StoreError>;

    /// Most recent run for a conversation.
    async fn find_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<FlowState>, StoreError>;

    /// Set the current node and append it to the visited list.
    async fn update_current_node(&self, id: Uuid, node_id: &str) -> Result<(), StoreError>;

    async fn update_state(
        &self,
        id: Uuid,
        state: FlowLifecycle,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn set_variable(&self, id: Uuid, name: &str, value: &Value) -> Result<(), StoreError>;

    async fn set_variables(
        &self,
        id: Uuid,
        variables: &HashMap<String, Value>,
    ) -> Result<(), StoreError>;

    async fn append_branch_decision(
        &self,
        id: Uuid,
        decision: &BranchDecision,
    ) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Delete runs last updated before `cutoff`; returns how many.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryFlowStateStore {
    states: RwLock<HashMap<Uuid, FlowState>>,
}

impl InMemoryFlowStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    async fn with_state<F>(&self, id: Uuid, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut FlowState) + Send,
    {
        let mut states = self.states.write().await;
        let state = states.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        f(state);
        state.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl FlowStateStore for InMemoryFlowStateStore {
    async fn create(&self, state: &FlowState) -> Result<(), StoreError> {
        self.states.write().await.insert(state.id, state.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<FlowState>, StoreError> {
        Ok(self.states.read().await.get(&id).cloned())
    }

    async fn find_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<FlowState>, StoreError> {
        Ok(self
            .states
            .read()
            .await
            .values()
            .filter(|s| s.conversation_id == conversation_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn update_current_node(&self, id: Uuid, node_id: &str) -> Result<(), StoreError> {
        self.with_state(id, |s| {
            s.current_node_id = node_id.to_string();
            s.visited_nodes.push(node_id.to_string());
        })
        .await
    }

    async fn update_state(
        &self,
        id: Uuid,
        state: FlowLifecycle,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let error = error.map(str::to_string);
        self.with_state(id, move |s| {
            s.set_lifecycle(state);
            if error.is_some() {
                s.error_message = error;
            }
        })
        .await
    }

    async fn set_variable(&self, id: Uuid, name: &str, value: &Value) -> Result<(), StoreError> {
        self.with_state(id, |s| {
            s.variables.insert(name.to_string(), value.clone());
        })
        .await
    }

    async fn set_variables(
        &self,
        id: Uuid,
        variables: &HashMap<String, Value>,
    ) -> Result<(), StoreError> {
        self.with_state(id, |s| {
            s.variables
                .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        })
        .await
    }

    async fn append_branch_decision(
        &self,
        id: Uuid,
        decision: &BranchDecision,
    ) -> Result<(), StoreError> {
        self.with_state(id, |s| s.branch_decisions.push(decision.clone()))
            .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.states.write().await.remove(&id).is_some())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, s| s.updated_at >= cutoff);
        Ok(before - states.len())
    }
}
