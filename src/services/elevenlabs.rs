// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! ElevenLabs streaming text-to-speech over WebSocket.
//!
//! Protocol: a begin-of-stream message (a single space plus voice settings),
//! then incremental text chunks, `flush` to force synthesis of pending text,
//! and `{"text": ""}` as end-of-stream. Audio arrives base64-encoded in the
//! `audio` field; `isFinal: true` marks the end of a generation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audio::resampler::{to_telephony, AudioEncoding};
use crate::services::shared::ws::{spawn_event_pump, Keepalive, WsConnection, WsIncoming};
use crate::services::{ProviderEvent, ProviderEvents, ServiceError, TextToSpeech};
use crate::utils::helpers::decode_base64;

/// Voice settings sent with the begin-of-stream message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElevenLabsVoiceSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_boost: Option<f64>,
}

/// Inbound message from the stream-input endpoint.
#[derive(Debug, Deserialize)]
struct ElevenLabsWsResponse {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default, rename = "isFinal")]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// ElevenLabs WebSocket TTS session.
pub struct ElevenLabsTTSService {
    api_key: String,
    voice_id: String,
    model: String,
    output_format: String,
    ws_url: String,
    voice_settings: ElevenLabsVoiceSettings,
    /// Seconds of silence the server tolerates before closing.
    inactivity_timeout: u32,
    ws: Option<WsConnection>,
}

impl ElevenLabsTTSService {
    pub const DEFAULT_MODEL: &'static str = "eleven_turbo_v2_5";
    /// Telephony-native, no resampling needed.
    pub const DEFAULT_OUTPUT_FORMAT: &'static str = "ulaw_8000";
    pub const DEFAULT_WS_BASE_URL: &'static str = "wss://api.elevenlabs.io";

    pub fn new(api_key: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            model: Self::DEFAULT_MODEL.to_string(),
            output_format: Self::DEFAULT_OUTPUT_FORMAT.to_string(),
            ws_url: Self::DEFAULT_WS_BASE_URL.to_string(),
            voice_settings: ElevenLabsVoiceSettings::default(),
            inactivity_timeout: 180,
            ws: None,
        }
    }

    /// Builder method: set the TTS model (e.g. `eleven_flash_v2_5`).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builder method: set the voice identifier.
    pub fn with_voice_id(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = voice_id.into();
        self
    }

    /// Builder method: `ulaw_8000` or `pcm_<rate>`.
    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = format.into();
        self
    }

    pub fn with_stability(mut self, stability: f64) -> Self {
        self.voice_settings.stability = Some(stability);
        self
    }

    pub fn with_similarity_boost(mut self, similarity_boost: f64) -> Self {
        self.voice_settings.similarity_boost = Some(similarity_boost);
        self
    }

    /// Builder method: set the WebSocket base URL.
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_inactivity_timeout(mut self, secs: u32) -> Self {
        self.inactivity_timeout = secs;
        self
    }

    fn encoding(&self) -> Result<AudioEncoding, ServiceError> {
        AudioEncoding::from_format_tag(&self.output_format).ok_or_else(|| {
            ServiceError::Protocol(format!(
                "unsupported output format '{}'",
                self.output_format
            ))
        })
    }

    fn build_ws_url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream-input?model_id={}&output_format={}&inactivity_timeout={}",
            self.ws_url.trim_end_matches('/'),
            self.voice_id,
            self.model,
            self.output_format,
            self.inactivity_timeout
        )
    }

    fn bos_message(&self) -> serde_json::Value {
        let settings = ElevenLabsVoiceSettings {
            stability: Some(self.voice_settings.stability.unwrap_or(0.5)),
            similarity_boost: Some(self.voice_settings.similarity_boost.unwrap_or(0.8)),
        };
        json!({
            "text": " ",
            "voice_settings": settings,
        })
    }

    fn text_message(text: &str) -> serde_json::Value {
        // The API expects each chunk to end with a space.
        let mut chunk = text.to_string();
        if !chunk.ends_with(' ') {
            chunk.push(' ');
        }
        json!({ "text": chunk, "try_trigger_generation": true })
    }

    fn flush_message() -> serde_json::Value {
        json!({ "text": " ", "flush": true })
    }

    fn eos_message() -> serde_json::Value {
        json!({ "text": "" })
    }

    /// Open the socket, send begin-of-stream, and start the event pump.
    pub async fn connect(mut self) -> Result<(Self, ProviderEvents), ServiceError> {
        if self.api_key.is_empty() {
            return Err(ServiceError::MissingApiKey("elevenlabs"));
        }
        let encoding = self.encoding()?;
        let url = self.build_ws_url();
        let (ws, incoming) = WsConnection::connect(
            "ElevenLabsTTSService",
            &url,
            &[("xi-api-key", self.api_key.clone())],
            Keepalive::default(),
        )
        .await?;
        ws.send_json(&self.bos_message())?;
        tracing::info!(voice_id = %self.voice_id, format = %self.output_format, "ElevenLabs: connected");

        let events = spawn_event_pump(ws.clone(), incoming, move |msg| match msg {
            WsIncoming::Text(text) => parse_ws_message(&text, encoding),
            _ => Vec::new(),
        });
        self.ws = Some(ws);
        Ok((self, events))
    }

    fn ws(&self) -> Result<&WsConnection, ServiceError> {
        self.ws
            .as_ref()
            .ok_or_else(|| ServiceError::Disconnected("ElevenLabs: not connected".into()))
    }
}

/// Convert one inbound message into provider events.
fn parse_ws_message(text: &str, encoding: AudioEncoding) -> Vec<ProviderEvent> {
    let response: ElevenLabsWsResponse = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("ElevenLabs: failed to parse message: {}", e);
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    if let Some(error) = response.error.or(response.message.filter(|_| response.audio.is_none())) {
        tracing::error!("ElevenLabs: server error: {}", error);
        events.push(ProviderEvent::Error(format!("ElevenLabs: {error}")));
    }
    if let Some(audio) = response.audio.as_deref().filter(|a| !a.is_empty()) {
        match decode_base64(audio) {
            Some(raw) => {
                let slin = to_telephony(&raw, encoding);
                if !slin.is_empty() {
                    events.push(ProviderEvent::Audio(slin));
                }
            }
            None => tracing::warn!("ElevenLabs: audio chunk is not valid base64"),
        }
    }
    if response.is_final == Some(true) {
        events.push(ProviderEvent::ResponseDone);
    }
    events
}

impl fmt::Debug for ElevenLabsTTSService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevenLabsTTSService")
            .field("voice_id", &self.voice_id)
            .field("model", &self.model)
            .field("output_format", &self.output_format)
            .field("connected", &self.ws.as_ref().is_some_and(WsConnection::is_open))
            .finish()
    }
}

impl fmt::Display for ElevenLabsTTSService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElevenLabsTTSService({})", self.voice_id)
    }
}

#[async_trait]
impl TextToSpeech for ElevenLabsTTSService {
    async fn send_text(&self, text: &str) -> Result<(), ServiceError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.ws()?.send_json(&Self::text_message(text))
    }

    async fn flush(&self) -> Result<(), ServiceError> {
        self.ws()?.send_json(&Self::flush_message())
    }

    async fn close(&self) {
        if let Some(ws) = &self.ws {
            ws.close_with(Some(Self::eos_message().to_string()));
        }
    }
}
