// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Per-node-type executors.
//!
//! An executor never touches [`FlowState`](crate::flows::FlowState)
//! directly: it reads the current variables and reports what should change
//! in a [`NodeResult`]. The engine applies the result, emits events, and
//! decides where to go next.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::flows::definition::{
    AiResponseNode, AudioSource, BuiltinCall, BuiltinName, CollectInfoNode, EndNode,
    FunctionNode, ListenNode, NodeKind, OnError, PlayAudioNode, StartNode, TransferNode,
    WebhookCall,
};
use crate::flows::events::FlowAction;
use crate::flows::interpolate::{interpolate, interpolate_value};
use crate::flows::webhook::WebhookClient;
use crate::services::{ChatMessage, LlmClient};

/// Reserved variable counting the fields a collectInfo node has gathered.
pub const COLLECT_INDEX_VAR: &str = "__collect_index";

/// Reserved variable holding the caller's most recent utterance.
pub const LAST_INPUT_VAR: &str = "last_user_input";

/// Spoken when a generated reply cannot be produced.
pub const GENERIC_ACKNOWLEDGMENT: &str = "I understand.";

const DEFAULT_INSTRUCTION: &str =
    "You are a helpful phone agent. Reply in one or two short spoken sentences.";

/// Inputs available to an executor.
pub struct ExecContext<'a> {
    pub node_id: &'a str,
    pub variables: &'a HashMap<String, Value>,
    pub llm: Option<&'a dyn LlmClient>,
    pub webhooks: &'a WebhookClient,
    /// Wall clock used by time-dependent built-ins.
    pub now: DateTime<Utc>,
}

/// What one node execution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    pub success: bool,
    /// Variables to merge into the flow state.
    pub variables: HashMap<String, Value>,
    pub action: Option<FlowAction>,
    pub error: Option<String>,
    /// Output handle to follow from this node.
    pub output: Option<String>,
    /// Jump straight to this node instead of following an edge.
    pub goto: Option<String>,
    /// Stop advancing until user input (or a listen timeout) arrives.
    pub wait_for_input: bool,
    /// The flow is finished after this node.
    pub complete: bool,
}

impl NodeResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            variables: HashMap::new(),
            action: None,
            error: None,
            output: None,
            goto: None,
            wait_for_input: false,
            complete: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::ok()
        }
    }

    fn with_action(mut self, action: FlowAction) -> Self {
        self.action = Some(action);
        self
    }

    fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    fn waiting(mut self) -> Self {
        self.wait_for_input = true;
        self
    }

    fn completing(mut self) -> Self {
        self.complete = true;
        self
    }
}

/// Run the executor for `kind`.
pub async fn execute(kind: &NodeKind, ctx: &ExecContext<'_>) -> NodeResult {
    match kind {
        NodeKind::Start(node) => start(node, ctx),
        NodeKind::AiResponse(node) => ai_response(node, ctx).await,
        NodeKind::Listen(node) => listen(node, ctx),
        // Route selection happens on transition, once input is available.
        NodeKind::Branch(_) => NodeResult::ok(),
        NodeKind::Transfer(node) => transfer(node, ctx),
        NodeKind::Function(FunctionNode::Webhook(call)) => webhook(call, ctx).await,
        NodeKind::Function(FunctionNode::Builtin(call)) => builtin(call, ctx),
        NodeKind::CollectInfo(node) => collect_info(node, ctx),
        NodeKind::PlayAudio(node) => play_audio(node, ctx),
        NodeKind::End(node) => end(node, ctx),
    }
}

fn start(node: &StartNode, ctx: &ExecContext<'_>) -> NodeResult {
    let mut result = NodeResult::ok();
    // Seeds fill gaps; values supplied by the caller win.
    for (name, template) in &node.variables {
        if !ctx.variables.contains_key(name) {
            result
                .variables
                .insert(name.clone(), interpolate_value(template, ctx.variables));
        }
    }

    if let Some(greeting) = node.greeting.as_deref().filter(|g| !g.trim().is_empty()) {
        let mut view = ctx.variables.clone();
        view.extend(result.variables.clone());
        let text = interpolate(greeting, &view);
        result = result.with_action(FlowAction::Speak { text });
    }
    result
}

async fn ai_response(node: &AiResponseNode, ctx: &ExecContext<'_>) -> NodeResult {
    let text = if node.use_llm {
        let generated = match ctx.llm {
            Some(llm) => generate_reply(node, ctx, llm).await,
            None => {
                tracing::warn!(node_id = %ctx.node_id, "aiResponse: no LLM configured, using fallback");
                None
            }
        };
        generated.unwrap_or_else(|| fallback_text(node, ctx))
    } else {
        node.text
            .as_deref()
            .map(|t| interpolate(t, ctx.variables))
            .unwrap_or_default()
    };

    if text.trim().is_empty() {
        return NodeResult::ok();
    }
    NodeResult::ok().with_action(FlowAction::Speak { text })
}

async fn generate_reply(
    node: &AiResponseNode,
    ctx: &ExecContext<'_>,
    llm: &dyn LlmClient,
) -> Option<String> {
    let instruction = node
        .instruction
        .as_deref()
        .map(|i| interpolate(i, ctx.variables))
        .unwrap_or_else(|| DEFAULT_INSTRUCTION.to_string());
    let known: serde_json::Map<String, Value> = ctx
        .variables
        .iter()
        .filter(|(k, _)| !k.starts_with("__"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut messages = vec![ChatMessage::system(format!(
        "{instruction}\n\nKnown conversation variables: {}",
        Value::Object(known)
    ))];
    if let Some(input) = ctx.variables.get(LAST_INPUT_VAR).and_then(Value::as_str) {
        messages.push(ChatMessage::user(input));
    }

    match llm.complete(&messages).await {
        Ok(reply) if !reply.trim().is_empty() => Some(reply.trim().to_string()),
        Ok(_) => {
            tracing::warn!(node_id = %ctx.node_id, "aiResponse: LLM returned an empty reply");
            None
        }
        Err(e) => {
            tracing::warn!(node_id = %ctx.node_id, error = %e, "aiResponse: LLM call failed");
            None
        }
    }
}

fn fallback_text(node: &AiResponseNode, ctx: &ExecContext<'_>) -> String {
    node.fallback_text
        .as_deref()
        .map(|t| interpolate(t, ctx.variables))
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| GENERIC_ACKNOWLEDGMENT.to_string())
}

fn listen(node: &ListenNode, ctx: &ExecContext<'_>) -> NodeResult {
    NodeResult::ok()
        .with_action(FlowAction::Listen {
            prompt: node.prompt.as_deref().map(|p| interpolate(p, ctx.variables)),
            timeout_ms: node.timeout,
            store_as: node.store_as.clone(),
        })
        .waiting()
}

fn transfer(node: &TransferNode, ctx: &ExecContext<'_>) -> NodeResult {
    let destination = interpolate(&node.destination, ctx.variables);
    if destination.trim().is_empty() {
        return NodeResult::failed("transfer node has no destination");
    }
    NodeResult::ok()
        .with_variable("transfer_destination", json!(destination))
        .with_variable("transfer_type", json!(node.transfer_type.as_str()))
        .with_action(FlowAction::Transfer {
            destination,
            transfer_type: node.transfer_type,
            message: node.message.as_deref().map(|m| interpolate(m, ctx.variables)),
        })
        .completing()
}

async fn webhook(call: &WebhookCall, ctx: &ExecContext<'_>) -> NodeResult {
    let attempts = match call.on_error {
        Some(OnError::Retry) => call.retry_count.saturating_add(1),
        _ => 1,
    };

    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match ctx.webhooks.call(call, ctx.variables).await {
            Ok(response) => {
                let mut result = NodeResult::ok()
                    .with_output("success")
                    .with_variable("webhook_status", json!(response.status));
                result.variables.extend(response.variables);
                return result;
            }
            Err(e) => {
                tracing::warn!(
                    node_id = %ctx.node_id,
                    attempt,
                    attempts,
                    error = %e,
                    "function: webhook failed"
                );
                last_error = e.to_string();
            }
        }
    }

    match call.on_error {
        Some(OnError::Continue) => NodeResult::ok()
            .with_output("error")
            .with_variable("last_error", json!(last_error)),
        Some(OnError::Goto) => {
            let mut result = NodeResult::ok().with_variable("last_error", json!(last_error));
            result.goto = call.error_node_id.clone();
            result
        }
        Some(OnError::Retry) | None => NodeResult::failed(format!("webhook failed: {last_error}")),
    }
}

fn builtin(call: &BuiltinCall, ctx: &ExecContext<'_>) -> NodeResult {
    match call.name {
        BuiltinName::BusinessHours => business_hours(&call.params, ctx.now),
        BuiltinName::EndCall => end_call(&call.params, ctx),
        BuiltinName::SetVariables => set_variables(&call.params, ctx),
    }
}

fn default_open() -> String {
    "09:00".to_string()
}

fn default_close() -> String {
    "17:00".to_string()
}

fn default_days() -> Vec<Value> {
    (1..=5).map(Value::from).collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BusinessHoursParams {
    #[serde(default = "default_open")]
    start: String,
    #[serde(default = "default_close")]
    end: String,
    /// Weekday numbers (0 = Sunday) or names (`mon`, `tuesday`, ...).
    #[serde(default = "default_days")]
    days: Vec<Value>,
    #[serde(default)]
    utc_offset_minutes: i64,
}

fn weekday_number(day: &Value) -> Option<u32> {
    match day {
        Value::Number(n) => n.as_u64().filter(|n| *n < 7).map(|n| n as u32),
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            ["sun", "mon", "tue", "wed", "thu", "fri", "sat"]
                .iter()
                .position(|d| s.starts_with(d))
                .map(|i| i as u32)
        }
        _ => None,
    }
}

/// Route through `open` or `closed` depending on the local time.
fn business_hours(params: &Value, now: DateTime<Utc>) -> NodeResult {
    let params: BusinessHoursParams = if params.is_null() {
        serde_json::from_value(json!({}))
    } else {
        serde_json::from_value(params.clone())
    }
    .map_err(|e| e.to_string())
    .unwrap_or_else(|e| {
        tracing::warn!("business_hours: invalid params ({}), using defaults", e);
        BusinessHoursParams {
            start: default_open(),
            end: default_close(),
            days: default_days(),
            utc_offset_minutes: 0,
        }
    });

    let (Ok(open), Ok(close)) = (
        NaiveTime::parse_from_str(params.start.trim(), "%H:%M"),
        NaiveTime::parse_from_str(params.end.trim(), "%H:%M"),
    ) else {
        return NodeResult::failed(format!(
            "business_hours: bad time range {}-{}",
            params.start, params.end
        ));
    };

    let local = now.naive_utc() + Duration::minutes(params.utc_offset_minutes);
    let weekday = local.weekday().num_days_from_sunday();
    let time = local.time();
    let in_window = if open <= close {
        time >= open && time < close
    } else {
        // Overnight window, e.g. 22:00-06:00.
        time >= open || time < close
    };
    let is_open = in_window && params.days.iter().filter_map(weekday_number).any(|d| d == weekday);

    NodeResult::ok()
        .with_variable("business_hours_open", json!(is_open))
        .with_output(if is_open { "open" } else { "closed" })
}

fn end_call(params: &Value, ctx: &ExecContext<'_>) -> NodeResult {
    let outcome = params
        .get("outcome")
        .and_then(Value::as_str)
        .unwrap_or("completed")
        .to_string();
    let message = params
        .get("message")
        .and_then(Value::as_str)
        .map(|m| interpolate(m, ctx.variables));
    NodeResult::ok()
        .with_variable("outcome", json!(outcome))
        .with_action(FlowAction::End { outcome, message })
        .completing()
}

fn set_variables(params: &Value, ctx: &ExecContext<'_>) -> NodeResult {
    let map = match params.get("variables").unwrap_or(params) {
        Value::Object(map) => map,
        Value::Null => return NodeResult::ok(),
        _ => return NodeResult::failed("set_variables expects an object"),
    };
    let mut result = NodeResult::ok();
    for (name, template) in map {
        result
            .variables
            .insert(name.clone(), interpolate_value(template, ctx.variables));
    }
    result
}

fn collect_info(node: &CollectInfoNode, ctx: &ExecContext<'_>) -> NodeResult {
    let index = ctx
        .variables
        .get(COLLECT_INDEX_VAR)
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;

    if let Some(field) = node.fields.get(index) {
        return NodeResult::ok()
            .with_variable(COLLECT_INDEX_VAR, json!(index))
            .with_action(FlowAction::Listen {
                prompt: Some(interpolate(&field.prompt, ctx.variables)),
                timeout_ms: node.timeout,
                store_as: field.name.clone(),
            })
            .waiting();
    }

    let result = NodeResult::ok().with_variable(COLLECT_INDEX_VAR, json!(0));
    match node.summary_template.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(template) => result.with_action(FlowAction::Speak {
            text: interpolate(template, ctx.variables),
        }),
        None => result,
    }
}

fn play_audio(node: &PlayAudioNode, ctx: &ExecContext<'_>) -> NodeResult {
    match node.source {
        AudioSource::Tts => match node.text.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(text) => NodeResult::ok().with_action(FlowAction::Speak {
                text: interpolate(text, ctx.variables),
            }),
            None => NodeResult::failed("playAudio node has no text"),
        },
        AudioSource::Url => match node.url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => NodeResult::ok().with_action(FlowAction::PlayUrl {
                url: interpolate(url, ctx.variables),
            }),
            None => NodeResult::failed("playAudio node has no url"),
        },
    }
}

fn end(node: &EndNode, ctx: &ExecContext<'_>) -> NodeResult {
    NodeResult::ok()
        .with_variable("outcome", json!(node.outcome))
        .with_action(FlowAction::End {
            outcome: node.outcome.clone(),
            message: node.message.as_deref().map(|m| interpolate(m, ctx.variables)),
        })
        .completing()
}
