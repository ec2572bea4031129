// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Versioned flow graph: nodes with typed payloads, edges with optional
//! output handles.
//!
//! On the wire a node is `{ "id", "type", "data" }` as produced by the flow
//! builder. The `type` tag is resolved into [`NodeKind`] while parsing, so a
//! node type this runtime does not know is rejected up front instead of being
//! discovered mid-call.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flows::FlowError;

fn default_version() -> u32 {
    1
}

/// A complete flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    /// Output handle on multi-output nodes (branch outputs, function
    /// `open`/`closed`, listen `timeout`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl FlowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            source_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

/// One vertex of the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct FlowNode {
    pub id: String,
    pub kind: NodeKind,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Builder wire shape of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    data: Value,
}

fn payload<T: serde::de::DeserializeOwned>(node_id: &str, data: Value) -> Result<T, String> {
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| format!("invalid payload on node '{node_id}': {e}"))
}

impl TryFrom<RawNode> for FlowNode {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let id = raw.id;
        let kind = match raw.node_type.as_str() {
            "start" => NodeKind::Start(payload(&id, raw.data)?),
            "aiResponse" => NodeKind::AiResponse(payload(&id, raw.data)?),
            "listen" => NodeKind::Listen(payload(&id, raw.data)?),
            "branch" => NodeKind::Branch(payload(&id, raw.data)?),
            "transfer" => NodeKind::Transfer(payload(&id, raw.data)?),
            "function" => {
                let mut data = raw.data;
                // Older definitions omit the discriminator on webhook nodes.
                if let Value::Object(map) = &mut data {
                    if !map.contains_key("functionType") {
                        let kind = if map.contains_key("url") { "webhook" } else { "builtin" };
                        map.insert("functionType".into(), Value::from(kind));
                    }
                }
                NodeKind::Function(payload(&id, data)?)
            }
            "collectInfo" => NodeKind::CollectInfo(payload(&id, raw.data)?),
            "playAudio" => NodeKind::PlayAudio(payload(&id, raw.data)?),
            "end" => NodeKind::End(payload(&id, raw.data)?),
            other => return Err(format!("unknown node type '{other}' on node '{id}'")),
        };
        Ok(Self { id, kind })
    }
}

impl From<FlowNode> for RawNode {
    fn from(node: FlowNode) -> Self {
        let node_type = node.kind.type_name().to_string();
        let data = match &node.kind {
            NodeKind::Start(n) => serde_json::to_value(n),
            NodeKind::AiResponse(n) => serde_json::to_value(n),
            NodeKind::Listen(n) => serde_json::to_value(n),
            NodeKind::Branch(n) => serde_json::to_value(n),
            NodeKind::Transfer(n) => serde_json::to_value(n),
            NodeKind::Function(n) => serde_json::to_value(n),
            NodeKind::CollectInfo(n) => serde_json::to_value(n),
            NodeKind::PlayAudio(n) => serde_json::to_value(n),
            NodeKind::End(n) => serde_json::to_value(n),
        }
        .unwrap_or(Value::Null);
        Self {
            id: node.id,
            node_type,
            data,
        }
    }
}

/// Node payload, one variant per node type.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Start(StartNode),
    AiResponse(AiResponseNode),
    Listen(ListenNode),
    Branch(BranchNode),
    Transfer(TransferNode),
    Function(FunctionNode),
    CollectInfo(CollectInfoNode),
    PlayAudio(PlayAudioNode),
    End(EndNode),
}

impl NodeKind {
    /// The builder's type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::AiResponse(_) => "aiResponse",
            Self::Listen(_) => "listen",
            Self::Branch(_) => "branch",
            Self::Transfer(_) => "transfer",
            Self::Function(_) => "function",
            Self::CollectInfo(_) => "collectInfo",
            Self::PlayAudio(_) => "playAudio",
            Self::End(_) => "end",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartNode {
    pub greeting: Option<String>,
    /// Variables seeded when the flow starts; string values are interpolated.
    pub variables: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiResponseNode {
    /// Fixed reply, used when `use_llm` is false.
    pub text: Option<String>,
    pub use_llm: bool,
    /// System instruction for generated replies.
    pub instruction: Option<String>,
    /// Spoken when generation fails.
    pub fallback_text: Option<String>,
}

fn default_listen_timeout() -> u64 {
    10_000
}

fn default_store_as() -> String {
    "user_input".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenNode {
    #[serde(default)]
    pub prompt: Option<String>,
    /// Milliseconds to wait for an utterance.
    #[serde(default = "default_listen_timeout")]
    pub timeout: u64,
    #[serde(default = "default_store_as")]
    pub store_as: String,
}

impl Default for ListenNode {
    fn default() -> Self {
        Self {
            prompt: None,
            timeout: default_listen_timeout(),
            store_as: default_store_as(),
        }
    }
}

/// Route-selection strategy of a branch node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    #[default]
    Keyword,
    Variable,
    Intent,
    AiClassification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordSet {
    pub words: Vec<String>,
    pub output: String,
}

/// Comparison applied to a named variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Greater,
    Less,
    Regex,
    Empty,
    NotEmpty,
}

impl ConditionOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::Contains => "contains",
            Self::Greater => "greater",
            Self::Less => "less",
            Self::Regex => "regex",
            Self::Empty => "empty",
            Self::NotEmpty => "not_empty",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableCondition {
    pub variable: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    pub output: String,
}

/// A label offered to the intent classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentOption {
    #[serde(alias = "name")]
    pub label: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Output handle; defaults to the label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl IntentOption {
    pub fn output(&self) -> &str {
        self.output.as_deref().unwrap_or(&self.label)
    }
}

fn default_output() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchNode {
    #[serde(default)]
    pub condition_type: ConditionType,
    #[serde(default)]
    pub keywords: Vec<KeywordSet>,
    #[serde(default)]
    pub conditions: Vec<VariableCondition>,
    #[serde(default)]
    pub intents: Vec<IntentOption>,
    #[serde(default = "default_output")]
    pub default_output: String,
}

impl Default for BranchNode {
    fn default() -> Self {
        Self {
            condition_type: ConditionType::default(),
            keywords: Vec::new(),
            conditions: Vec::new(),
            intents: Vec::new(),
            default_output: default_output(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    #[default]
    Blind,
    Attended,
}

impl TransferType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blind => "blind",
            Self::Attended => "attended",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferNode {
    pub destination: String,
    #[serde(default)]
    pub transfer_type: TransferType,
    #[serde(default)]
    pub message: Option<String>,
}

/// What a function node does: call out over HTTP or run a built-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "functionType", rename_all = "camelCase")]
pub enum FunctionNode {
    Webhook(WebhookCall),
    Builtin(BuiltinCall),
}

/// Failure handling for a webhook function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    Continue,
    Retry,
    Goto,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_webhook_timeout() -> u64 {
    10_000
}

fn default_retry_count() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookCall {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSON template; string leaves are interpolated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Variable name -> dot path into the JSON response.
    #[serde(default)]
    pub response_mapping: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_node_id: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_ms: u64,
}

/// Built-in function names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinName {
    BusinessHours,
    EndCall,
    SetVariables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinCall {
    pub name: BuiltinName,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectField {
    pub name: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectInfoNode {
    pub fields: Vec<CollectField>,
    #[serde(default)]
    pub summary_template: Option<String>,
    #[serde(default = "default_listen_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSource {
    #[default]
    Tts,
    Url,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayAudioNode {
    pub source: AudioSource,
    pub text: Option<String>,
    pub url: Option<String>,
}

fn default_outcome() -> String {
    "completed".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndNode {
    #[serde(default = "default_outcome")]
    pub outcome: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl Default for EndNode {
    fn default() -> Self {
        Self {
            outcome: default_outcome(),
            message: None,
        }
    }
}

impl FlowDefinition {
    pub fn new(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> Self {
        Self {
            id: None,
            version: default_version(),
            nodes,
            edges,
        }
    }

    /// Parse a definition from builder JSON.
    pub fn from_json(value: Value) -> Result<Self, FlowError> {
        serde_json::from_value(value).map_err(|e| FlowError::Validation(e.to_string()))
    }

    /// Check the structural invariants and return the unique start node.
    pub fn validate(&self) -> Result<&FlowNode, FlowError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(FlowError::Validation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut starts = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start(_)));
        let start = match (starts.next(), starts.next()) {
            (Some(start), None) => start,
            (None, _) => {
                return Err(FlowError::Validation("flow has no start node".into()));
            }
            (Some(_), Some(_)) => {
                return Err(FlowError::Validation(
                    "flow has more than one start node".into(),
                ));
            }
        };

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !seen.contains(end.as_str()) {
                    return Err(FlowError::Validation(format!(
                        "edge references unknown node '{end}'"
                    )));
                }
            }
        }

        for node in &self.nodes {
            if let NodeKind::Function(FunctionNode::Webhook(call)) = &node.kind {
                if call.on_error == Some(OnError::Goto) {
                    match &call.error_node_id {
                        Some(target) if seen.contains(target.as_str()) => {}
                        _ => {
                            return Err(FlowError::Validation(format!(
                                "function node '{}' uses goto without a valid errorNodeId",
                                node.id
                            )));
                        }
                    }
                }
            }
        }

        Ok(start)
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Resolve the outgoing edge for `source`.
    ///
    /// With a handle, the edge tagged with it wins; otherwise (or when no
    /// tagged edge exists) the first edge without a handle is taken.
    pub fn next_edge(&self, source: &str, handle: Option<&str>) -> Option<&FlowEdge> {
        let mut outgoing = self.edges.iter().filter(|e| e.source == source);
        if let Some(handle) = handle {
            if let Some(edge) = outgoing
                .clone()
                .find(|e| e.source_handle.as_deref() == Some(handle))
            {
                return Some(edge);
            }
        }
        outgoing.find(|e| e.source_handle.is_none())
    }

    /// Whether `source` has an edge tagged with `handle`.
    pub fn has_handle(&self, source: &str, handle: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.source == source && e.source_handle.as_deref() == Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builder_json() -> Value {
        json!({
            "version": 3,
            "nodes": [
                {"id": "s", "type": "start", "data": {"greeting": "Hi {{name}}"}},
                {"id": "l", "type": "listen", "data": {"storeAs": "reason", "timeout": 5000}},
                {"id": "b", "type": "branch", "data": {
                    "conditionType": "keyword",
                    "keywords": [{"words": ["bill", "invoice"], "output": "billing"}],
                    "defaultOutput": "general"
                }},
                {"id": "f", "type": "function", "data": {"url": "https://example.test/hook"}},
                {"id": "e", "type": "end"}
            ],
            "edges": [
                {"source": "s", "target": "l"},
                {"source": "l", "target": "b"},
                {"source": "b", "target": "f", "sourceHandle": "billing"},
                {"source": "b", "target": "e", "sourceHandle": "general"},
                {"source": "f", "target": "e"}
            ]
        })
    }

    #[test]
    fn test_parse_builder_json() {
        let def = FlowDefinition::from_json(builder_json()).unwrap();
        assert_eq!(def.version, 3);
        assert_eq!(def.nodes.len(), 5);
        match &def.node("l").unwrap().kind {
            NodeKind::Listen(l) => {
                assert_eq!(l.store_as, "reason");
                assert_eq!(l.timeout, 5000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            def.node("f").unwrap().kind,
            NodeKind::Function(FunctionNode::Webhook(_))
        ));
        match &def.node("e").unwrap().kind {
            NodeKind::End(e) => assert_eq!(e.outcome, "completed"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(def.validate().unwrap().id, "s");
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let err = FlowDefinition::from_json(json!({
            "nodes": [{"id": "x", "type": "teleport", "data": {}}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn test_zero_and_two_start_nodes_rejected() {
        let none = FlowDefinition::new(vec![FlowNode::new("e", NodeKind::End(EndNode::default()))], vec![]);
        assert!(matches!(none.validate(), Err(FlowError::Validation(_))));

        let two = FlowDefinition::new(
            vec![
                FlowNode::new("a", NodeKind::Start(StartNode::default())),
                FlowNode::new("b", NodeKind::Start(StartNode::default())),
            ],
            vec![],
        );
        assert!(matches!(two.validate(), Err(FlowError::Validation(_))));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let def = FlowDefinition::new(
            vec![FlowNode::new("s", NodeKind::Start(StartNode::default()))],
            vec![FlowEdge::new("s", "ghost")],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_next_edge_resolution() {
        let def = FlowDefinition::from_json(builder_json()).unwrap();
        assert_eq!(def.next_edge("s", None).unwrap().target, "l");
        assert_eq!(def.next_edge("b", Some("billing")).unwrap().target, "f");
        assert!(def.next_edge("b", None).is_none());
        assert!(def.next_edge("e", None).is_none());
        // Unknown handle falls back to an unconstrained edge.
        assert_eq!(def.next_edge("f", Some("open")).unwrap().target, "e");
        assert!(def.has_handle("b", "general"));
    }

    #[test]
    fn test_serialize_round_trip_keeps_type_tags() {
        let def = FlowDefinition::from_json(builder_json()).unwrap();
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["nodes"][2]["type"], "branch");
        assert_eq!(value["nodes"][3]["data"]["functionType"], "webhook");
        let again = FlowDefinition::from_json(value).unwrap();
        assert_eq!(again.nodes.len(), def.nodes.len());
    }
}
