// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Process configuration and per-call agent configuration.
//!
//! [`BridgeConfig`] comes from the environment (optionally seeded from a
//! `.env` file). [`AgentConfig`] is registered per call over HTTP before the
//! AudioSocket connection arrives; its [`AgentMode`] carries only the fields
//! the selected mode needs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::resampler::AudioEncoding;
use crate::error::BridgeError;
use crate::flows::definition::FlowDefinition;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

pub const DEFAULT_AUDIOSOCKET_BIND: &str = "0.0.0.0:9092";
pub const DEFAULT_HTTP_BIND: &str = "0.0.0.0:9093";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

/// Process-wide settings.
#[derive(Clone)]
pub struct BridgeConfig {
    pub audiosocket_bind: SocketAddr,
    pub http_bind: SocketAddr,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub openai_realtime_url: Option<String>,
    pub openai_realtime_model: String,
    pub openai_llm_model: String,
    pub deepgram_api_key: Option<String>,
    pub deepgram_url: Option<String>,
    pub elevenlabs_api_key: Option<String>,
    pub elevenlabs_url: Option<String>,
    /// Unconsumed registrations older than this are purged.
    pub pending_registration_ttl: Duration,
    /// A call that arrives without a registration is closed after this long.
    pub pending_session_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            audiosocket_bind: SocketAddr::from(([0, 0, 0, 0], 9092)),
            http_bind: SocketAddr::from(([0, 0, 0, 0], 9093)),
            openai_api_key: None,
            openai_base_url: None,
            openai_realtime_url: None,
            openai_realtime_model: DEFAULT_REALTIME_MODEL.to_string(),
            openai_llm_model: DEFAULT_LLM_MODEL.to_string(),
            deepgram_api_key: None,
            deepgram_url: None,
            elevenlabs_api_key: None,
            elevenlabs_url: None,
            pending_registration_ttl: Duration::from_secs(300),
            pending_session_timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("audiosocket_bind", &self.audiosocket_bind)
            .field("http_bind", &self.http_bind)
            .field("openai", &self.openai_api_key.is_some())
            .field("openai_realtime_model", &self.openai_realtime_model)
            .field("openai_llm_model", &self.openai_llm_model)
            .field("deepgram", &self.deepgram_api_key.is_some())
            .field("elevenlabs", &self.elevenlabs_api_key.is_some())
            .field("pending_registration_ttl", &self.pending_registration_ttl)
            .field("pending_session_timeout", &self.pending_session_timeout)
            .finish()
    }
}

fn parse_var<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("'{raw}': {e}"),
        }),
    }
}

impl BridgeConfig {
    /// Load `.env` (if present) and read the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("config: failed to load .env: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            audiosocket_bind: parse_var(
                "AUDIOSOCKET_BIND",
                get("AUDIOSOCKET_BIND"),
                defaults.audiosocket_bind,
            )?,
            http_bind: parse_var("HTTP_BIND", get("HTTP_BIND"), defaults.http_bind)?,
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL"),
            openai_realtime_url: get("OPENAI_REALTIME_URL"),
            openai_realtime_model: get("OPENAI_REALTIME_MODEL")
                .unwrap_or(defaults.openai_realtime_model),
            openai_llm_model: get("OPENAI_LLM_MODEL").unwrap_or(defaults.openai_llm_model),
            deepgram_api_key: get("DEEPGRAM_API_KEY"),
            deepgram_url: get("DEEPGRAM_URL"),
            elevenlabs_api_key: get("ELEVENLABS_API_KEY"),
            elevenlabs_url: get("ELEVENLABS_URL"),
            pending_registration_ttl: Duration::from_secs(parse_var(
                "PENDING_REGISTRATION_TTL_SECS",
                get("PENDING_REGISTRATION_TTL_SECS"),
                300u64,
            )?),
            pending_session_timeout: Duration::from_secs(parse_var(
                "PENDING_SESSION_TIMEOUT_SECS",
                get("PENDING_SESSION_TIMEOUT_SECS"),
                10u64,
            )?),
        })
    }
}

// ---------------------------------------------------------------------------
// Per-call agent configuration
// ---------------------------------------------------------------------------

fn default_voice() -> String {
    "alloy".to_string()
}

/// Settings for a realtime speech-to-speech session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeSettings {
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Function tools in the realtime API's `session.tools` shape.
    #[serde(default)]
    pub tools: Vec<Value>,
    /// Let the provider answer each user turn on its own. Flow calls turn
    /// this off so only flow actions produce speech.
    #[serde(default = "default_true")]
    pub auto_response: bool,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            greeting: None,
            voice: default_voice(),
            model: None,
            temperature: None,
            tools: Vec::new(),
            auto_response: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_stt_model() -> String {
    "nova-2".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SttSettings {
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            model: default_stt_model(),
            language: default_language(),
        }
    }
}

fn default_tts_model() -> String {
    "eleven_turbo_v2_5".to_string()
}

fn default_output_format() -> String {
    "ulaw_8000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsSettings {
    pub voice_id: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
    /// `ulaw_8000` or `pcm_<rate>`.
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default)]
    pub stability: Option<f64>,
    #[serde(default)]
    pub similarity_boost: Option<f64>,
}

impl TtsSettings {
    pub fn new(voice_id: impl Into<String>) -> Self {
        Self {
            voice_id: voice_id.into(),
            model: default_tts_model(),
            output_format: default_output_format(),
            stability: None,
            similarity_boost: None,
        }
    }

    pub fn encoding(&self) -> Option<AudioEncoding> {
        AudioEncoding::from_format_tag(&self.output_format)
    }
}

/// Flow-driven bridge: realtime voice plus a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowAgent {
    #[serde(flatten)]
    pub realtime: RealtimeSettings,
    pub flow: FlowDefinition,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

/// STT + LLM + TTS pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineAgent {
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub stt: SttSettings,
    pub tts: TtsSettings,
    #[serde(default)]
    pub llm_model: Option<String>,
}

/// Mode-specific agent payload, tagged by `mode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AgentMode {
    Direct(RealtimeSettings),
    Flow(FlowAgent),
    Pipeline(PipelineAgent),
}

impl AgentMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Flow(_) => "flow",
            Self::Pipeline(_) => "pipeline",
        }
    }
}

/// Immutable per-call snapshot registered ahead of the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub mode: AgentMode,
}

impl AgentConfig {
    pub fn direct(agent_id: impl Into<String>, settings: RealtimeSettings) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: None,
            mode: AgentMode::Direct(settings),
        }
    }

    pub fn flow(agent_id: impl Into<String>, flow: FlowDefinition) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: None,
            mode: AgentMode::Flow(FlowAgent {
                realtime: RealtimeSettings::default(),
                flow,
                variables: HashMap::new(),
            }),
        }
    }

    /// Reject configurations that would fail mid-call.
    pub fn validate(&self) -> Result<(), BridgeError> {
        match &self.mode {
            AgentMode::Direct(_) => Ok(()),
            AgentMode::Flow(agent) => agent.flow.validate().map(|_| ()).map_err(Into::into),
            AgentMode::Pipeline(agent) => {
                if agent.tts.voice_id.trim().is_empty() {
                    return Err(BridgeError::Validation("tts.voiceId is required".into()));
                }
                if agent.tts.encoding().is_none() {
                    return Err(BridgeError::Validation(format!(
                        "unsupported tts.outputFormat '{}'",
                        agent.tts.output_format
                    )));
                }
                Ok(())
            }
        }
    }
}
