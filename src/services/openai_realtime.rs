// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! OpenAI Realtime speech-to-speech session.
//!
//! The realtime API speaks `pcm16` at 24 kHz. Caller audio is upsampled from
//! 8 kHz before `input_audio_buffer.append`; `response.audio.delta` chunks
//! are downsampled back to 8 kHz before they are surfaced.
//!
//! The first message after the socket opens is `session.update` carrying the
//! voice, formats, transcription model, server VAD parameters, and tools.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audio::resampler::{downsample_24k_to_8k, upsample_8k_to_24k};
use crate::services::shared::ws::{spawn_event_pump, Keepalive, WsConnection, WsIncoming};
use crate::services::{
    ProviderEvent, ProviderEvents, RealtimeService, ServiceError, TranscriptRole,
};
use crate::utils::helpers::{decode_base64, encode_base64};

/// Server VAD parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnDetection {
    pub threshold: f64,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    /// Let the server answer on its own after each user turn.
    pub create_response: bool,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            create_response: true,
        }
    }
}

/// Fields of a server event that any of the handled types may carry.
#[derive(Debug, Deserialize)]
struct ServerEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    error: Option<ServerError>,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// OpenAI Realtime session.
pub struct OpenAIRealtimeService {
    api_key: String,
    model: String,
    base_url: String,
    voice: String,
    instructions: String,
    temperature: Option<f64>,
    tools: Vec<Value>,
    transcription_model: String,
    turn_detection: TurnDetection,
    ws: Option<WsConnection>,
}

impl OpenAIRealtimeService {
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-realtime-preview";
    pub const DEFAULT_BASE_URL: &'static str = "wss://api.openai.com/v1/realtime";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: Self::DEFAULT_MODEL.to_string(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            voice: "alloy".to_string(),
            instructions: String::new(),
            temperature: None,
            tools: Vec::new(),
            transcription_model: "whisper-1".to_string(),
            turn_detection: TurnDetection::default(),
            ws: None,
        }
    }

    /// Builder method: set the realtime model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builder method: set the realtime endpoint (without `?model=`).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_turn_detection(mut self, turn_detection: TurnDetection) -> Self {
        self.turn_detection = turn_detection;
        self
    }

    fn build_ws_url(&self) -> String {
        format!("{}?model={}", self.base_url.trim_end_matches('/'), self.model)
    }

    fn session_update(&self) -> Value {
        let mut session = json!({
            "modalities": ["text", "audio"],
            "instructions": self.instructions,
            "voice": self.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": { "model": self.transcription_model },
            "turn_detection": {
                "type": "server_vad",
                "threshold": self.turn_detection.threshold,
                "prefix_padding_ms": self.turn_detection.prefix_padding_ms,
                "silence_duration_ms": self.turn_detection.silence_duration_ms,
                "create_response": self.turn_detection.create_response,
            },
        });
        if let Some(temperature) = self.temperature {
            session["temperature"] = json!(temperature);
        }
        if !self.tools.is_empty() {
            session["tools"] = Value::Array(self.tools.clone());
            session["tool_choice"] = json!("auto");
        }
        json!({ "type": "session.update", "session": session })
    }

    /// Open the socket, push `session.update`, and start the event pump.
    pub async fn connect(mut self) -> Result<(Self, ProviderEvents), ServiceError> {
        if self.api_key.is_empty() {
            return Err(ServiceError::MissingApiKey("openai"));
        }
        let url = self.build_ws_url();
        let (ws, incoming) = WsConnection::connect(
            "OpenAIRealtimeService",
            &url,
            &[
                ("Authorization", format!("Bearer {}", self.api_key)),
                ("OpenAI-Beta", "realtime=v1".to_string()),
            ],
            Keepalive::default(),
        )
        .await?;
        ws.send_json(&self.session_update())?;
        tracing::info!(model = %self.model, voice = %self.voice, "OpenAI realtime: connected");

        let events = spawn_event_pump(ws.clone(), incoming, |msg| match msg {
            WsIncoming::Text(text) => parse_server_event(&text),
            _ => Vec::new(),
        });
        self.ws = Some(ws);
        Ok((self, events))
    }

    fn ws(&self) -> Result<&WsConnection, ServiceError> {
        self.ws
            .as_ref()
            .ok_or_else(|| ServiceError::Disconnected("OpenAI realtime: not connected".into()))
    }
}

fn audio_append(slin: &[u8]) -> Value {
    json!({
        "type": "input_audio_buffer.append",
        "audio": encode_base64(&upsample_8k_to_24k(slin)),
    })
}

fn audio_commit() -> Value {
    json!({ "type": "input_audio_buffer.commit" })
}

fn audio_clear() -> Value {
    json!({ "type": "input_audio_buffer.clear" })
}

fn user_text_item(text: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "user",
            "content": [{ "type": "input_text", "text": text }],
        },
    })
}

fn verbatim_response(text: &str) -> Value {
    json!({
        "type": "response.create",
        "response": {
            "instructions": format!(
                "Say exactly the following to the caller and nothing else: \"{text}\""
            ),
        },
    })
}

fn function_output_item(call_id: &str, output: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output,
        },
    })
}

/// Convert one server event into provider events.
fn parse_server_event(text: &str) -> Vec<ProviderEvent> {
    let event: ServerEvent = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("OpenAI realtime: failed to parse event: {}", e);
            return Vec::new();
        }
    };

    let parsed = match event.event_type.as_str() {
        "input_audio_buffer.speech_started" => ProviderEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => ProviderEvent::SpeechStopped,
        "conversation.item.input_audio_transcription.completed" => ProviderEvent::Transcript {
            role: TranscriptRole::User,
            text: event.transcript.unwrap_or_default().trim().to_string(),
            is_final: true,
        },
        "response.audio_transcript.delta" => ProviderEvent::Transcript {
            role: TranscriptRole::Assistant,
            text: event.delta.unwrap_or_default(),
            is_final: false,
        },
        "response.audio_transcript.done" => ProviderEvent::Transcript {
            role: TranscriptRole::Assistant,
            text: event.transcript.unwrap_or_default(),
            is_final: true,
        },
        "response.audio.delta" => {
            let Some(pcm) = event.delta.as_deref().and_then(decode_base64) else {
                tracing::warn!("OpenAI realtime: audio delta is not valid base64");
                return Vec::new();
            };
            ProviderEvent::Audio(downsample_24k_to_8k(&pcm))
        }
        "response.function_call_arguments.done" => ProviderEvent::FunctionCall {
            call_id: event.call_id.unwrap_or_default(),
            name: event.name.unwrap_or_default(),
            arguments: event.arguments.unwrap_or_else(|| "{}".to_string()),
        },
        "response.done" => ProviderEvent::ResponseDone,
        "error" => {
            let (message, code) = event
                .error
                .map(|e| (e.message, e.code))
                .unwrap_or_default();
            let message = message.unwrap_or_else(|| "unknown error".to_string());
            // Cancelling when nothing is playing is routine during barge-in.
            if code.as_deref() == Some("response_cancel_not_active") {
                tracing::debug!("OpenAI realtime: {}", message);
                return Vec::new();
            }
            tracing::error!("OpenAI realtime: server error: {}", message);
            ProviderEvent::Error(message)
        }
        other => {
            tracing::trace!("OpenAI realtime: unhandled event {}", other);
            return Vec::new();
        }
    };
    vec![parsed]
}

impl fmt::Debug for OpenAIRealtimeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAIRealtimeService")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("tools", &self.tools.len())
            .field("connected", &self.ws.as_ref().is_some_and(WsConnection::is_open))
            .finish()
    }
}

impl fmt::Display for OpenAIRealtimeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpenAIRealtimeService({})", self.model)
    }
}

#[async_trait]
impl RealtimeService for OpenAIRealtimeService {
    async fn send_audio(&self, slin: &[u8]) -> Result<(), ServiceError> {
        if slin.is_empty() {
            return Ok(());
        }
        self.ws()?.send_json(&audio_append(slin))
    }

    async fn commit_audio(&self) -> Result<(), ServiceError> {
        self.ws()?.send_json(&audio_commit())
    }

    async fn clear_audio(&self) -> Result<(), ServiceError> {
        self.ws()?.send_json(&audio_clear())
    }

    async fn send_text(&self, text: &str) -> Result<(), ServiceError> {
        let ws = self.ws()?;
        ws.send_json(&user_text_item(text))?;
        ws.send_json(&json!({ "type": "response.create" }))
    }

    async fn speak(&self, text: &str) -> Result<(), ServiceError> {
        self.ws()?.send_json(&verbatim_response(text))
    }

    async fn cancel_response(&self) -> Result<(), ServiceError> {
        self.ws()?.send_json(&json!({ "type": "response.cancel" }))
    }

    async fn send_function_result(
        &self,
        call_id: &str,
        output: &str,
    ) -> Result<(), ServiceError> {
        let ws = self.ws()?;
        ws.send_json(&function_output_item(call_id, output))?;
        ws.send_json(&json!({ "type": "response.create" }))
    }

    async fn close(&self) {
        if let Some(ws) = &self.ws {
            ws.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::samples_to_pcm;

    #[test]
    fn test_session_update_shape() {
        let svc = OpenAIRealtimeService::new("sk")
            .with_voice("verse")
            .with_instructions("Be brief.")
            .with_temperature(0.7)
            .with_turn_detection(TurnDetection {
                create_response: false,
                ..Default::default()
            })
            .with_tools(vec![json!({"type": "function", "name": "end_call"})]);
        let msg = svc.session_update();
        assert_eq!(msg["type"], "session.update");
        let s = &msg["session"];
        assert_eq!(s["voice"], "verse");
        assert_eq!(s["instructions"], "Be brief.");
        assert_eq!(s["input_audio_format"], "pcm16");
        assert_eq!(s["turn_detection"]["type"], "server_vad");
        assert_eq!(s["turn_detection"]["create_response"], false);
        assert_eq!(s["temperature"], 0.7);
        assert_eq!(s["tools"][0]["name"], "end_call");
        assert_eq!(s["tool_choice"], "auto");
    }

    #[test]
    fn test_ws_url() {
        let svc = OpenAIRealtimeService::new("sk").with_base_url("wss://rt.example.test/v1/realtime/");
        assert_eq!(
            svc.build_ws_url(),
            "wss://rt.example.test/v1/realtime?model=gpt-4o-realtime-preview"
        );
    }

    #[test]
    fn test_audio_append_is_upsampled() {
        let slin = samples_to_pcm(&[0i16; 160]);
        let msg = audio_append(&slin);
        let audio = decode_base64(msg["audio"].as_str().unwrap()).unwrap();
        assert_eq!(audio.len(), slin.len() * 3);
    }

    #[test]
    fn test_input_buffer_commit_and_clear() {
        assert_eq!(audio_commit(), json!({"type": "input_audio_buffer.commit"}));
        assert_eq!(audio_clear(), json!({"type": "input_audio_buffer.clear"}));
    }

    #[tokio::test]
    async fn test_buffer_control_requires_connection() {
        let svc = OpenAIRealtimeService::new("sk");
        assert!(matches!(svc.commit_audio().await, Err(ServiceError::Disconnected(_))));
        assert!(matches!(svc.clear_audio().await, Err(ServiceError::Disconnected(_))));
    }

    #[test]
    fn test_outbound_items() {
        assert_eq!(user_text_item("hi")["item"]["content"][0]["text"], "hi");
        assert!(verbatim_response("Hello there")["response"]["instructions"]
            .as_str()
            .unwrap()
            .contains("\"Hello there\""));
        let out = function_output_item("call_1", "{\"ok\":true}");
        assert_eq!(out["item"]["type"], "function_call_output");
        assert_eq!(out["item"]["call_id"], "call_1");
    }

    #[test]
    fn test_parse_vad_and_transcripts() {
        assert_eq!(
            parse_server_event(r#"{"type":"input_audio_buffer.speech_started"}"#),
            vec![ProviderEvent::SpeechStarted]
        );
        assert_eq!(
            parse_server_event(
                r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":" Alice \n"}"#
            ),
            vec![ProviderEvent::Transcript {
                role: TranscriptRole::User,
                text: "Alice".into(),
                is_final: true,
            }]
        );
    }

    #[test]
    fn test_parse_audio_delta_is_downsampled() {
        let pcm24 = samples_to_pcm(&[100i16; 480]);
        let msg = json!({"type": "response.audio.delta", "delta": encode_base64(&pcm24)});
        match &parse_server_event(&msg.to_string())[..] {
            [ProviderEvent::Audio(slin)] => assert_eq!(slin.len(), 320),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_function_call_and_done() {
        let msg = r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"end_call","arguments":"{}"}"#;
        assert_eq!(
            parse_server_event(msg),
            vec![ProviderEvent::FunctionCall {
                call_id: "c1".into(),
                name: "end_call".into(),
                arguments: "{}".into(),
            }]
        );
        assert_eq!(
            parse_server_event(r#"{"type":"response.done","response":{}}"#),
            vec![ProviderEvent::ResponseDone]
        );
    }

    #[test]
    fn test_parse_errors() {
        let err = r#"{"type":"error","error":{"message":"bad session","code":"invalid"}}"#;
        assert_eq!(
            parse_server_event(err),
            vec![ProviderEvent::Error("bad session".into())]
        );
        let benign = r#"{"type":"error","error":{"message":"no response","code":"response_cancel_not_active"}}"#;
        assert!(parse_server_event(benign).is_empty());
        assert!(parse_server_event(r#"{"type":"rate_limits.updated"}"#).is_empty());
        assert!(parse_server_event("{").is_empty());
    }

    #[tokio::test]
    async fn test_connect_without_key() {
        let err = OpenAIRealtimeService::new("").connect().await.unwrap_err();
        assert_eq!(err, ServiceError::MissingApiKey("openai"));
    }
}
