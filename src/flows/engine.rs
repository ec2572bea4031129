// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Graph walker for conversation flows.
//!
//! The engine keeps a working copy of each live conversation's
//! [`FlowState`] in memory and mirrors every mutation to the
//! [`FlowStateStore`]. Store failures are logged and do not interrupt the
//! call; the in-memory copy stays authoritative while the call is up.
//!
//! Executors may await (LLM, webhooks). After every await the engine checks
//! that the conversation is still live and belongs to the same run; if the
//! session released it in the meantime the result is dropped without
//! emitting anything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::flows::branch;
use crate::flows::definition::{FlowDefinition, NodeKind};
use crate::flows::events::{FlowAction, FlowEventHub, FlowEventKind, FlowSubscription};
use crate::flows::executors::{self, ExecContext, NodeResult, COLLECT_INDEX_VAR, LAST_INPUT_VAR};
use crate::flows::state::{BranchDecision, FlowLifecycle, FlowState};
use crate::flows::store::FlowStateStore;
use crate::flows::webhook::WebhookClient;
use crate::flows::FlowError;
use crate::services::LlmClient;
use crate::utils::helpers::value_to_text;

/// Nodes one advance may execute before it must wait for input.
pub const DEFAULT_MAX_STEPS: usize = 64;

/// Where a transition landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Moved(String),
    /// No edge resolved; the flow finished normally.
    Completed,
}

struct LiveFlow {
    definition: Arc<FlowDefinition>,
    state: FlowState,
}

/// Executes flows for any number of concurrent conversations.
pub struct FlowEngine {
    store: Arc<dyn FlowStateStore>,
    hub: FlowEventHub,
    llm: Option<Arc<dyn LlmClient>>,
    webhooks: WebhookClient,
    max_steps: usize,
    live: Mutex<HashMap<String, LiveFlow>>,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("live", &self.lock().len())
            .field("llm", &self.llm.is_some())
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

impl FlowEngine {
    pub fn new(store: Arc<dyn FlowStateStore>) -> Self {
        Self {
            store,
            hub: FlowEventHub::new(),
            llm: None,
            webhooks: WebhookClient::new(),
            max_steps: DEFAULT_MAX_STEPS,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Builder method: LLM used by aiResponse nodes and intent branches.
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Builder method: share an existing event hub.
    pub fn with_event_hub(mut self, hub: FlowEventHub) -> Self {
        self.hub = hub;
        self
    }

    pub fn with_webhook_client(mut self, webhooks: WebhookClient) -> Self {
        self.webhooks = webhooks;
        self
    }

    /// Backing store the working set is mirrored to.
    pub fn store(&self) -> &Arc<dyn FlowStateStore> {
        &self.store
    }

    pub fn event_hub(&self) -> &FlowEventHub {
        &self.hub
    }

    /// Receive this conversation's events. Dropping the handle unsubscribes.
    pub fn subscribe(&self, conversation_id: &str) -> FlowSubscription {
        self.hub.subscribe(conversation_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LiveFlow>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, conversation_id: &str) -> Result<(Arc<FlowDefinition>, FlowState), FlowError> {
        self.lock()
            .get(conversation_id)
            .map(|l| (Arc::clone(&l.definition), l.state.clone()))
            .ok_or_else(|| FlowError::NotActive(conversation_id.to_string()))
    }

    fn is_live(&self, conversation_id: &str, run_id: Uuid) -> bool {
        self.lock()
            .get(conversation_id)
            .is_some_and(|l| l.state.id == run_id && !l.state.state.is_terminal())
    }

    /// Run `f` on the live state if it still belongs to `run_id`.
    fn update<R>(
        &self,
        conversation_id: &str,
        run_id: Uuid,
        f: impl FnOnce(&mut FlowState) -> R,
    ) -> Option<R> {
        let mut live = self.lock();
        let flow = live
            .get_mut(conversation_id)
            .filter(|l| l.state.id == run_id)?;
        Some(f(&mut flow.state))
    }

    pub fn get_state(&self, conversation_id: &str) -> Option<FlowState> {
        self.lock().get(conversation_id).map(|l| l.state.clone())
    }

    /// Validate `definition` and create a run positioned at its start node.
    ///
    /// A definition that fails validation creates no state anywhere.
    pub async fn initialize_flow(
        &self,
        definition: Arc<FlowDefinition>,
        conversation_id: &str,
        agent_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<FlowState, FlowError> {
        let start = definition.validate()?;
        let mut state = FlowState::new(conversation_id, agent_id, start.id.as_str(), variables);
        state.mark_visited(&start.id);

        {
            let mut live = self.lock();
            if live
                .get(conversation_id)
                .is_some_and(|l| !l.state.state.is_terminal())
            {
                return Err(FlowError::AlreadyActive(conversation_id.to_string()));
            }
            live.insert(
                conversation_id.to_string(),
                LiveFlow {
                    definition: Arc::clone(&definition),
                    state: state.clone(),
                },
            );
        }

        if let Err(e) = self.store.create(&state).await {
            tracing::warn!(conversation_id, error = %e, "flow: failed to persist new state");
        }
        tracing::info!(
            conversation_id,
            flow_id = ?definition.id,
            version = definition.version,
            start = %start.id,
            "flow: initialized"
        );
        Ok(state)
    }

    /// Initialize and run until the flow waits for input or finishes.
    pub async fn start_flow(
        &self,
        definition: Arc<FlowDefinition>,
        conversation_id: &str,
        agent_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<FlowState, FlowError> {
        self.initialize_flow(definition, conversation_id, agent_id, variables)
            .await?;
        self.advance(conversation_id).await
    }

    /// Execute and transition until a node waits, the flow ends, or the step
    /// limit trips.
    async fn advance(&self, conversation_id: &str) -> Result<FlowState, FlowError> {
        for _ in 0..self.max_steps {
            let result = self.execute_current_node(conversation_id).await?;
            if result.wait_for_input || result.complete {
                return self.current(conversation_id);
            }
            let transition = match result.goto.as_deref() {
                Some(target) => self.jump_to(conversation_id, target).await?,
                None => {
                    self.transition_to_next(conversation_id, result.output.as_deref())
                        .await?
                }
            };
            if transition == Transition::Completed {
                return self.current(conversation_id);
            }
        }

        let err = FlowError::StepLimit(self.max_steps);
        if let Ok((_, state)) = self.snapshot(conversation_id) {
            self.fail(conversation_id, state.id, &err.to_string()).await;
        }
        Err(err)
    }

    fn current(&self, conversation_id: &str) -> Result<FlowState, FlowError> {
        self.snapshot(conversation_id).map(|(_, state)| state)
    }

    /// Run the handler of the current node and apply its result.
    pub async fn execute_current_node(
        &self,
        conversation_id: &str,
    ) -> Result<NodeResult, FlowError> {
        let (definition, state) = self.snapshot(conversation_id)?;
        if state.state.is_terminal() {
            return Err(FlowError::NotActive(conversation_id.to_string()));
        }
        let Some(node) = definition.node(&state.current_node_id) else {
            let err = FlowError::NodeNotFound(state.current_node_id.clone());
            self.fail(conversation_id, state.id, &err.to_string()).await;
            return Err(err);
        };

        self.hub.emit(
            conversation_id,
            FlowEventKind::NodeEntered {
                node_id: node.id.clone(),
                node_type: node.kind.type_name(),
            },
        );
        tracing::debug!(conversation_id, node_id = %node.id, node_type = node.kind.type_name(), "flow: executing node");

        let ctx = ExecContext {
            node_id: &node.id,
            variables: &state.variables,
            llm: self.llm.as_deref(),
            webhooks: &self.webhooks,
            now: Utc::now(),
        };
        let result = executors::execute(&node.kind, &ctx).await;

        if !self.is_live(conversation_id, state.id) {
            tracing::debug!(conversation_id, node_id = %node.id, "flow: released during execution, discarding result");
            return Err(FlowError::NotActive(conversation_id.to_string()));
        }

        self.apply_variables(conversation_id, state.id, &result.variables)
            .await;

        if !result.success {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "node failed".to_string());
            self.hub.emit(
                conversation_id,
                FlowEventKind::NodeCompleted {
                    node_id: node.id.clone(),
                    success: false,
                },
            );
            self.fail(conversation_id, state.id, &message).await;
            return Err(FlowError::Execution {
                node_id: node.id.clone(),
                message,
            });
        }

        if let Some(action) = result.action.clone() {
            self.hub.emit(conversation_id, action.into());
        }
        self.hub.emit(
            conversation_id,
            FlowEventKind::NodeCompleted {
                node_id: node.id.clone(),
                success: true,
            },
        );

        if result.complete {
            self.set_lifecycle(conversation_id, state.id, FlowLifecycle::Completed, None)
                .await;
        } else if result.wait_for_input {
            self.set_lifecycle(conversation_id, state.id, FlowLifecycle::WaitingInput, None)
                .await;
        }
        Ok(result)
    }

    /// Leave the current node.
    ///
    /// Branch nodes pick their output from the latest user input and the
    /// variables, recording a [`BranchDecision`]. Other nodes follow the edge
    /// tagged with `handle`, or the first untagged edge. When nothing
    /// resolves, the flow completes with outcome `completed`.
    pub async fn transition_to_next(
        &self,
        conversation_id: &str,
        handle: Option<&str>,
    ) -> Result<Transition, FlowError> {
        let (definition, state) = self.snapshot(conversation_id)?;
        if state.state.is_terminal() {
            return Err(FlowError::NotActive(conversation_id.to_string()));
        }
        let node = definition
            .node(&state.current_node_id)
            .ok_or_else(|| FlowError::NodeNotFound(state.current_node_id.clone()))?;

        let handle = match &node.kind {
            NodeKind::Branch(branch_node) => {
                let input = state
                    .variables
                    .get(LAST_INPUT_VAR)
                    .map(value_to_text)
                    .unwrap_or_default();
                let outcome =
                    branch::evaluate(branch_node, &input, &state.variables, self.llm.as_deref())
                        .await;
                if !self.is_live(conversation_id, state.id) {
                    return Err(FlowError::NotActive(conversation_id.to_string()));
                }

                let decision = BranchDecision::new(
                    node.id.clone(),
                    outcome.condition.clone(),
                    outcome.output.clone(),
                );
                self.update(conversation_id, state.id, |s| {
                    s.branch_decisions.push(decision.clone());
                });
                if let Err(e) = self.store.append_branch_decision(state.id, &decision).await {
                    tracing::warn!(conversation_id, error = %e, "flow: failed to persist branch decision");
                }
                tracing::info!(
                    conversation_id,
                    node_id = %node.id,
                    output = %outcome.output,
                    condition = %outcome.condition,
                    "flow: branch decided"
                );
                Some(outcome.output)
            }
            _ => handle.map(str::to_string),
        };

        match definition.next_edge(&node.id, handle.as_deref()) {
            Some(edge) => {
                self.enter(conversation_id, state.id, &edge.target).await;
                Ok(Transition::Moved(edge.target.clone()))
            }
            None => {
                tracing::info!(conversation_id, node_id = %node.id, "flow: no outgoing edge, completing");
                self.set_lifecycle(conversation_id, state.id, FlowLifecycle::Completed, None)
                    .await;
                self.hub.emit(
                    conversation_id,
                    FlowAction::End {
                        outcome: "completed".to_string(),
                        message: None,
                    }
                    .into(),
                );
                Ok(Transition::Completed)
            }
        }
    }

    async fn jump_to(&self, conversation_id: &str, target: &str) -> Result<Transition, FlowError> {
        let (definition, state) = self.snapshot(conversation_id)?;
        if definition.node(target).is_none() {
            let err = FlowError::NodeNotFound(target.to_string());
            self.fail(conversation_id, state.id, &err.to_string()).await;
            return Err(err);
        }
        self.enter(conversation_id, state.id, target).await;
        Ok(Transition::Moved(target.to_string()))
    }

    async fn enter(&self, conversation_id: &str, run_id: Uuid, node_id: &str) {
        let entered = self.update(conversation_id, run_id, |s| {
            s.enter_node(node_id);
            s.mark_visited(node_id);
        });
        if entered.is_none() {
            return;
        }
        if let Err(e) = self.store.update_current_node(run_id, node_id).await {
            tracing::warn!(conversation_id, error = %e, "flow: failed to persist current node");
        }
    }

    async fn apply_variables(
        &self,
        conversation_id: &str,
        run_id: Uuid,
        variables: &HashMap<String, Value>,
    ) {
        if variables.is_empty() {
            return;
        }
        let applied = self.update(conversation_id, run_id, |s| {
            s.variables
                .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
            s.updated_at = Utc::now();
        });
        if applied.is_none() {
            return;
        }
        for (name, value) in variables {
            self.hub.emit(
                conversation_id,
                FlowEventKind::VariableSet {
                    name: name.clone(),
                    value: value.clone(),
                },
            );
        }
        if let Err(e) = self.store.set_variables(run_id, variables).await {
            tracing::warn!(conversation_id, error = %e, "flow: failed to persist variables");
        }
    }

    async fn set_lifecycle(
        &self,
        conversation_id: &str,
        run_id: Uuid,
        lifecycle: FlowLifecycle,
        error: Option<&str>,
    ) {
        let previous = self.update(conversation_id, run_id, |s| {
            if let Some(error) = error {
                s.error_message = Some(error.to_string());
            }
            s.set_lifecycle(lifecycle)
        });
        let Some(previous) = previous else {
            return;
        };
        if previous != lifecycle {
            self.hub.emit(
                conversation_id,
                FlowEventKind::StateChanged {
                    from: previous,
                    to: lifecycle,
                },
            );
        }
        if let Err(e) = self.store.update_state(run_id, lifecycle, error).await {
            tracing::warn!(conversation_id, error = %e, "flow: failed to persist lifecycle");
        }
    }

    async fn fail(&self, conversation_id: &str, run_id: Uuid, message: &str) {
        tracing::error!(conversation_id, error = %message, "flow: run failed");
        self.set_lifecycle(conversation_id, run_id, FlowLifecycle::Error, Some(message))
            .await;
        self.hub.emit(
            conversation_id,
            FlowEventKind::Error {
                message: message.to_string(),
            },
        );
    }

    /// Feed a caller utterance.
    ///
    /// While a listen node waits, the text is stored under its `storeAs`
    /// name and the flow moves on. A collectInfo node stores it under the
    /// current field and asks for the next one. Input that arrives while
    /// nothing waits is only recorded as the latest input.
    pub async fn handle_user_input(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<FlowState, FlowError> {
        let text = text.trim();
        let (definition, state) = self.snapshot(conversation_id)?;
        if state.state.is_terminal() {
            return Err(FlowError::NotActive(conversation_id.to_string()));
        }

        let mut variables = HashMap::from([(LAST_INPUT_VAR.to_string(), json!(text))]);
        if state.state != FlowLifecycle::WaitingInput {
            tracing::debug!(conversation_id, "flow: input while not waiting, recording only");
            self.apply_variables(conversation_id, state.id, &variables)
                .await;
            return self.current(conversation_id);
        }

        let node = definition
            .node(&state.current_node_id)
            .ok_or_else(|| FlowError::NodeNotFound(state.current_node_id.clone()))?;
        let rerun_current = match &node.kind {
            NodeKind::Listen(listen) => {
                variables.insert(listen.store_as.clone(), json!(text));
                false
            }
            NodeKind::CollectInfo(collect) => {
                let index = state
                    .variables
                    .get(COLLECT_INDEX_VAR)
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                if let Some(field) = collect.fields.get(index as usize) {
                    variables.insert(field.name.clone(), json!(text));
                }
                variables.insert(COLLECT_INDEX_VAR.to_string(), json!(index + 1));
                true
            }
            _ => false,
        };

        tracing::info!(conversation_id, node_id = %node.id, "flow: user input received");
        self.apply_variables(conversation_id, state.id, &variables)
            .await;
        self.set_lifecycle(conversation_id, state.id, FlowLifecycle::Active, None)
            .await;

        if !rerun_current
            && self.transition_to_next(conversation_id, None).await? == Transition::Completed
        {
            return self.current(conversation_id);
        }
        self.advance(conversation_id).await
    }

    /// A listening window on `node_id` expired without input.
    ///
    /// Follows the node's `timeout` edge if it has one, otherwise its
    /// untagged edge. Stale timers (the flow already moved on) are ignored.
    pub async fn handle_listen_timeout(
        &self,
        conversation_id: &str,
        node_id: &str,
    ) -> Result<FlowState, FlowError> {
        let (definition, state) = self.snapshot(conversation_id)?;
        if state.state != FlowLifecycle::WaitingInput || state.current_node_id != node_id {
            return Ok(state);
        }
        tracing::info!(conversation_id, node_id, "flow: listen timed out");

        if matches!(
            definition.node(node_id).map(|n| &n.kind),
            Some(NodeKind::CollectInfo(_))
        ) {
            let reset = HashMap::from([(COLLECT_INDEX_VAR.to_string(), json!(0))]);
            self.apply_variables(conversation_id, state.id, &reset).await;
        }
        self.set_lifecycle(conversation_id, state.id, FlowLifecycle::Active, None)
            .await;

        let handle = definition.has_handle(node_id, "timeout").then_some("timeout");
        if self.transition_to_next(conversation_id, handle).await? == Transition::Completed {
            return self.current(conversation_id);
        }
        self.advance(conversation_id).await
    }

    /// Reload a persisted, unfinished run and continue it from its current
    /// node.
    pub async fn resume_flow(
        &self,
        conversation_id: &str,
        definition: Arc<FlowDefinition>,
    ) -> Result<FlowState, FlowError> {
        if let Some(state) = self.get_state(conversation_id) {
            if !state.state.is_terminal() {
                return Ok(state);
            }
        }

        let stored = self
            .store
            .find_by_conversation(conversation_id)
            .await?
            .ok_or_else(|| FlowError::NotActive(conversation_id.to_string()))?;
        if stored.state.is_terminal() {
            return Err(FlowError::NotActive(conversation_id.to_string()));
        }
        if definition.node(&stored.current_node_id).is_none() {
            return Err(FlowError::NodeNotFound(stored.current_node_id));
        }

        let run_id = stored.id;
        tracing::info!(conversation_id, node_id = %stored.current_node_id, "flow: resuming");
        self.lock().insert(
            conversation_id.to_string(),
            LiveFlow {
                definition,
                state: stored,
            },
        );
        self.set_lifecycle(conversation_id, run_id, FlowLifecycle::Active, None)
            .await;
        self.advance(conversation_id).await
    }

    /// Finish the run from outside the graph (for example, caller hangup).
    pub async fn end_flow(
        &self,
        conversation_id: &str,
        outcome: &str,
    ) -> Result<FlowState, FlowError> {
        let (_, state) = self.snapshot(conversation_id)?;
        if state.state.is_terminal() {
            return Ok(state);
        }
        let outcome = HashMap::from([("outcome".to_string(), json!(outcome))]);
        self.apply_variables(conversation_id, state.id, &outcome).await;
        self.set_lifecycle(conversation_id, state.id, FlowLifecycle::Completed, None)
            .await;
        self.current(conversation_id)
    }

    /// Drop the working copy. An unfinished run is marked paused in the
    /// store so it can be resumed later.
    pub async fn release(&self, conversation_id: &str) -> Option<FlowState> {
        let mut state = self.lock().remove(conversation_id)?.state;
        if !state.state.is_terminal() {
            let previous = state.set_lifecycle(FlowLifecycle::Paused);
            tracing::info!(conversation_id, from = %previous, "flow: paused on release");
            if let Err(e) = self
                .store
                .update_state(state.id, FlowLifecycle::Paused, None)
                .await
            {
                tracing::warn!(conversation_id, error = %e, "flow: failed to persist pause");
            }
        }
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::definition::{FlowEdge, FlowNode};
    use crate::flows::store::InMemoryFlowStateStore;
    use crate::services::{ChatMessage, ServiceError};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    fn def(value: Value) -> Arc<FlowDefinition> {
        Arc::new(FlowDefinition::from_json(value).unwrap())
    }

    fn engine() -> (FlowEngine, Arc<InMemoryFlowStateStore>) {
        let store = Arc::new(InMemoryFlowStateStore::new());
        (FlowEngine::new(store.clone()), store)
    }

    fn actions(sub: &mut FlowSubscription) -> Vec<FlowEventKind> {
        sub.drain()
            .into_iter()
            .map(|e| e.kind)
            .filter(|k| {
                matches!(
                    k,
                    FlowEventKind::Speak { .. }
                        | FlowEventKind::Listen { .. }
                        | FlowEventKind::Transfer { .. }
                        | FlowEventKind::End { .. }
                        | FlowEventKind::PlayUrl { .. }
                        | FlowEventKind::Error { .. }
                )
            })
            .collect()
    }

    fn end_completed() -> FlowEventKind {
        FlowEventKind::End {
            outcome: "completed".into(),
            message: None,
        }
    }

    #[tokio::test]
    async fn test_dead_end_completes_normally() {
        let (engine, _) = engine();
        let flow = def(json!({
            "nodes": [
                {"id": "s", "type": "start", "data": {"greeting": "Hi"}},
                {"id": "a", "type": "aiResponse", "data": {"text": "Bye for now"}}
            ],
            "edges": [{"source": "s", "target": "a"}]
        }));
        let mut sub = engine.subscribe("c1");
        let state = engine.start_flow(flow, "c1", "agent", HashMap::new()).await.unwrap();
        assert_eq!(state.state, FlowLifecycle::Completed);
        assert!(state.completed_at.is_some());
        assert_eq!(state.visited_nodes, vec!["s", "a"]);
        assert_eq!(
            actions(&mut sub),
            vec![
                FlowEventKind::Speak { text: "Hi".into() },
                FlowEventKind::Speak {
                    text: "Bye for now".into()
                },
                end_completed(),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_start_count_creates_no_state() {
        let (engine, store) = engine();
        let none = def(json!({"nodes": [{"id": "e", "type": "end"}]}));
        let err = engine
            .initialize_flow(none, "c1", "agent", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));

        let two = def(json!({"nodes": [
            {"id": "s1", "type": "start"},
            {"id": "s2", "type": "start"}
        ]}));
        let err = engine
            .start_flow(two, "c1", "agent", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));

        assert!(engine.get_state("c1").is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_listen_stores_input_and_completes() {
        let (engine, store) = engine();
        let flow = def(json!({
            "nodes": [
                {"id": "s", "type": "start", "data": {"greeting": "What's your name?"}},
                {"id": "l", "type": "listen", "data": {"storeAs": "name", "timeout": 5000}},
                {"id": "e", "type": "end", "data": {"message": "Thanks {{name}}"}}
            ],
            "edges": [
                {"source": "s", "target": "l"},
                {"source": "l", "target": "e"}
            ]
        }));
        let mut sub = engine.subscribe("c1");
        let state = engine.start_flow(flow, "c1", "agent", HashMap::new()).await.unwrap();
        assert_eq!(state.state, FlowLifecycle::WaitingInput);
        assert_eq!(state.current_node_id, "l");

        let state = engine.handle_user_input("c1", " Alice ").await.unwrap();
        assert_eq!(state.state, FlowLifecycle::Completed);
        assert_eq!(state.variable("name"), Some(&json!("Alice")));
        assert_eq!(
            actions(&mut sub),
            vec![
                FlowEventKind::Speak {
                    text: "What's your name?".into()
                },
                FlowEventKind::Listen {
                    prompt: None,
                    timeout_ms: 5000,
                    store_as: "name".into(),
                },
                FlowEventKind::End {
                    outcome: "completed".into(),
                    message: Some("Thanks Alice".into()),
                },
            ]
        );

        let stored = store.find_by_id(state.id).await.unwrap().unwrap();
        assert_eq!(stored.state, FlowLifecycle::Completed);
        assert_eq!(stored.variable("name"), Some(&json!("Alice")));
        assert_eq!(stored.visited_nodes, vec!["s", "l", "e"]);
    }

    fn billing_flow() -> Arc<FlowDefinition> {
        def(json!({
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "l", "type": "listen"},
                {"id": "b", "type": "branch", "data": {
                    "conditionType": "keyword",
                    "keywords": [{"words": ["bill", "invoice"], "output": "billing"}],
                    "defaultOutput": "general"
                }},
                {"id": "billing", "type": "end", "data": {"outcome": "billing"}},
                {"id": "general", "type": "end", "data": {"outcome": "general"}}
            ],
            "edges": [
                {"source": "s", "target": "l"},
                {"source": "l", "target": "b"},
                {"source": "b", "target": "billing", "sourceHandle": "billing"},
                {"source": "b", "target": "general", "sourceHandle": "general"}
            ]
        }))
    }

    #[tokio::test]
    async fn test_branch_routes_and_records_decision() {
        let (engine, _) = engine();
        engine
            .start_flow(billing_flow(), "c1", "agent", HashMap::new())
            .await
            .unwrap();
        let state = engine
            .handle_user_input("c1", "I have a question about my bill")
            .await
            .unwrap();
        assert_eq!(state.current_node_id, "billing");
        assert_eq!(state.branch_decisions.len(), 1);
        assert_eq!(state.branch_decisions[0].selected_output, "billing");
        assert_eq!(state.branch_decisions[0].condition, "keyword 'bill'");

        engine
            .start_flow(billing_flow(), "c2", "agent", HashMap::new())
            .await
            .unwrap();
        let state = engine.handle_user_input("c2", "hello").await.unwrap();
        assert_eq!(state.current_node_id, "general");
        assert_eq!(state.branch_decisions[0].condition, "default");
    }

    #[tokio::test]
    async fn test_listen_timeout_prefers_timeout_edge() {
        let (engine, _) = engine();
        let flow = def(json!({
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "l", "type": "listen"},
                {"id": "ok", "type": "end"},
                {"id": "late", "type": "end", "data": {"outcome": "no_input"}}
            ],
            "edges": [
                {"source": "s", "target": "l"},
                {"source": "l", "target": "ok"},
                {"source": "l", "target": "late", "sourceHandle": "timeout"}
            ]
        }));
        engine.start_flow(flow, "c1", "agent", HashMap::new()).await.unwrap();

        // A timer for a node the flow already left is ignored.
        let state = engine.handle_listen_timeout("c1", "s").await.unwrap();
        assert_eq!(state.current_node_id, "l");

        let state = engine.handle_listen_timeout("c1", "l").await.unwrap();
        assert_eq!(state.current_node_id, "late");
        assert_eq!(state.state, FlowLifecycle::Completed);
    }

    #[tokio::test]
    async fn test_collect_info_then_summary() {
        let (engine, _) = engine();
        let flow = def(json!({
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "c", "type": "collectInfo", "data": {
                    "fields": [
                        {"name": "name", "prompt": "Name?"},
                        {"name": "zip", "prompt": "Zip?"}
                    ],
                    "summaryTemplate": "{{name}} at {{zip}}"
                }}
            ],
            "edges": [{"source": "s", "target": "c"}]
        }));
        let mut sub = engine.subscribe("c1");
        engine.start_flow(flow, "c1", "agent", HashMap::new()).await.unwrap();
        let state = engine.handle_user_input("c1", "Ann").await.unwrap();
        assert_eq!(state.state, FlowLifecycle::WaitingInput);
        assert_eq!(state.current_node_id, "c");

        let state = engine.handle_user_input("c1", "02139").await.unwrap();
        assert_eq!(state.state, FlowLifecycle::Completed);
        assert_eq!(state.variable(COLLECT_INDEX_VAR), Some(&json!(0)));

        let spoken: Vec<_> = actions(&mut sub)
            .into_iter()
            .filter_map(|k| match k {
                FlowEventKind::Speak { text } => Some(text),
                FlowEventKind::Listen { prompt, .. } => prompt,
                _ => None,
            })
            .collect();
        assert_eq!(spoken, vec!["Name?", "Zip?", "Ann at 02139"]);
    }

    #[tokio::test]
    async fn test_failed_node_moves_to_error() {
        let (engine, store) = engine();
        let flow = Arc::new(FlowDefinition::new(
            vec![
                FlowNode::new("s", NodeKind::Start(Default::default())),
                FlowNode::new("t", NodeKind::Transfer(Default::default())),
            ],
            vec![FlowEdge::new("s", "t")],
        ));
        let mut sub = engine.subscribe("c1");
        let err = engine
            .start_flow(flow, "c1", "agent", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Execution { ref node_id, .. } if node_id == "t"));

        let state = engine.get_state("c1").unwrap();
        assert_eq!(state.state, FlowLifecycle::Error);
        assert!(state.error_message.is_some());
        assert!(actions(&mut sub)
            .iter()
            .any(|k| matches!(k, FlowEventKind::Error { .. })));
        let stored = store.find_by_id(state.id).await.unwrap().unwrap();
        assert_eq!(stored.state, FlowLifecycle::Error);
    }

    #[tokio::test]
    async fn test_cycle_hits_step_limit() {
        let (engine, _) = engine();
        let engine = engine.with_max_steps(8);
        let flow = Arc::new(FlowDefinition::new(
            vec![
                FlowNode::new("s", NodeKind::Start(Default::default())),
                FlowNode::new("a", NodeKind::AiResponse(Default::default())),
                FlowNode::new("b", NodeKind::AiResponse(Default::default())),
            ],
            vec![
                FlowEdge::new("s", "a"),
                FlowEdge::new("a", "b"),
                FlowEdge::new("b", "a"),
            ],
        ));
        let err = engine
            .start_flow(flow, "c1", "agent", HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, FlowError::StepLimit(8));
        assert_eq!(engine.get_state("c1").unwrap().state, FlowLifecycle::Error);
    }

    #[tokio::test]
    async fn test_release_pauses_and_resume_reprompts() {
        let (engine, store) = engine();
        let flow = billing_flow();
        engine
            .start_flow(flow.clone(), "c1", "agent", HashMap::new())
            .await
            .unwrap();

        let released = engine.release("c1").await.unwrap();
        assert_eq!(released.state, FlowLifecycle::Paused);
        assert!(engine.get_state("c1").is_none());
        let stored = store.find_by_conversation("c1").await.unwrap().unwrap();
        assert_eq!(stored.state, FlowLifecycle::Paused);

        let mut sub = engine.subscribe("c1");
        let state = engine.resume_flow("c1", flow).await.unwrap();
        assert_eq!(state.state, FlowLifecycle::WaitingInput);
        assert_eq!(state.current_node_id, "l");
        assert!(matches!(
            actions(&mut sub)[..],
            [FlowEventKind::Listen { .. }]
        ));
        assert_eq!(
            engine.handle_user_input("c1", "invoice").await.unwrap().current_node_id,
            "billing"
        );
    }

    #[tokio::test]
    async fn test_end_flow_and_inactive_errors() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.handle_user_input("nobody", "hi").await,
            Err(FlowError::NotActive(_))
        ));

        engine
            .start_flow(billing_flow(), "c1", "agent", HashMap::new())
            .await
            .unwrap();
        let err = engine
            .initialize_flow(billing_flow(), "c1", "agent", HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, FlowError::AlreadyActive("c1".into()));

        let state = engine.end_flow("c1", "caller_hangup").await.unwrap();
        assert_eq!(state.state, FlowLifecycle::Completed);
        assert_eq!(state.variable("outcome"), Some(&json!("caller_hangup")));
        assert!(matches!(
            engine.handle_user_input("c1", "hi").await,
            Err(FlowError::NotActive(_))
        ));
    }

    struct GatedLlm {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl LlmClient for GatedLlm {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ServiceError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok("too late".into())
        }
    }

    #[tokio::test]
    async fn test_result_discarded_after_release() {
        let llm = Arc::new(GatedLlm {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let store = Arc::new(InMemoryFlowStateStore::new());
        let engine = Arc::new(FlowEngine::new(store).with_llm(llm.clone()));
        let flow = def(json!({
            "nodes": [
                {"id": "s", "type": "start"},
                {"id": "a", "type": "aiResponse", "data": {"useLlm": true}}
            ],
            "edges": [{"source": "s", "target": "a"}]
        }));
        let mut sub = engine.subscribe("c1");

        let task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine.start_flow(flow, "c1", "agent", HashMap::new()).await
            })
        };
        llm.entered.notified().await;
        engine.release("c1").await;
        llm.release.notify_one();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(FlowError::NotActive(_))));
        assert!(actions(&mut sub).is_empty());
    }
}
