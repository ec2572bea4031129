// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Deepgram streaming speech-to-text.
//!
//! Caller audio is streamed as binary `linear16` frames at 8 kHz, so no
//! conversion is needed on the way out. Inbound `Results` become transcript
//! events; `SpeechStarted` and `UtteranceEnd` (plus `speech_final` results)
//! become voice-activity boundaries.

use std::fmt;
use std::fmt::Write as _;

use async_trait::async_trait;
use serde::Deserialize;

use crate::audio::resampler::TELEPHONY_SAMPLE_RATE;
use crate::services::shared::ws::{spawn_event_pump, Keepalive, WsConnection, WsIncoming};
use crate::services::{ProviderEvent, ProviderEvents, ServiceError, SpeechToText, TranscriptRole};

/// Envelope used to dispatch on `type` before a full parse.
#[derive(Deserialize)]
struct DgTypeOnly {
    #[serde(rename = "type")]
    msg_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DgAlternative {
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct DgChannel {
    alternatives: Vec<DgAlternative>,
}

#[derive(Debug, Deserialize)]
struct DgResult {
    channel: Option<DgChannel>,
    is_final: Option<bool>,
    speech_final: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DgError {
    description: Option<String>,
    message: Option<String>,
}

/// Deepgram live transcription session.
pub struct DeepgramSTTService {
    api_key: String,
    model: String,
    language: Option<String>,
    sample_rate: u32,
    encoding: String,
    interim_results: bool,
    punctuate: bool,
    smart_format: bool,
    vad_events: bool,
    utterance_end_ms: Option<u32>,
    endpointing_ms: Option<u32>,
    base_url: Option<String>,
    ws: Option<WsConnection>,
}

impl DeepgramSTTService {
    pub const DEFAULT_MODEL: &'static str = "nova-2";
    pub const DEFAULT_BASE_URL: &'static str = "wss://api.deepgram.com";

    /// Defaults suit telephony: `linear16` at 8 kHz, interim results, VAD
    /// events, 1 s utterance end.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: Self::DEFAULT_MODEL.to_string(),
            language: Some("en".to_string()),
            sample_rate: TELEPHONY_SAMPLE_RATE,
            encoding: "linear16".to_string(),
            interim_results: true,
            punctuate: true,
            smart_format: true,
            vad_events: true,
            utterance_end_ms: Some(1000),
            endpointing_ms: Some(300),
            base_url: None,
            ws: None,
        }
    }

    /// Builder method: set the Deepgram model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builder method: set the language.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_interim_results(mut self, enabled: bool) -> Self {
        self.interim_results = enabled;
        self
    }

    pub fn with_vad_events(mut self, enabled: bool) -> Self {
        self.vad_events = enabled;
        self
    }

    /// Builder method: set the utterance-end detection timeout in milliseconds.
    pub fn with_utterance_end_ms(mut self, ms: u32) -> Self {
        self.utterance_end_ms = Some(ms);
        self
    }

    pub fn with_endpointing_ms(mut self, ms: u32) -> Self {
        self.endpointing_ms = Some(ms);
        self
    }

    /// Builder method: set a custom Deepgram API base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    fn build_ws_url(&self) -> String {
        let host = self
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
            .trim_end_matches('/');

        let mut url = format!(
            "{}/v1/listen?model={}&encoding={}&sample_rate={}&channels=1",
            host, self.model, self.encoding, self.sample_rate,
        );
        if let Some(ref lang) = self.language {
            let _ = write!(url, "&language={}", lang);
        }
        if self.interim_results {
            url.push_str("&interim_results=true");
        }
        if self.punctuate {
            url.push_str("&punctuate=true");
        }
        if self.smart_format {
            url.push_str("&smart_format=true");
        }
        if self.vad_events {
            url.push_str("&vad_events=true");
        }
        if let Some(ms) = self.utterance_end_ms {
            let _ = write!(url, "&utterance_end_ms={}", ms);
        }
        if let Some(ms) = self.endpointing_ms {
            let _ = write!(url, "&endpointing={}", ms);
        }
        url
    }

    /// Open the socket and start the event pump.
    pub async fn connect(mut self) -> Result<(Self, ProviderEvents), ServiceError> {
        if self.api_key.is_empty() {
            return Err(ServiceError::MissingApiKey("deepgram"));
        }
        let url = self.build_ws_url();
        let (ws, incoming) = WsConnection::connect(
            "DeepgramSTTService",
            &url,
            &[("Authorization", format!("Token {}", self.api_key))],
            Keepalive::default(),
        )
        .await?;
        tracing::info!(model = %self.model, "Deepgram: connected");

        let vad_events = self.vad_events;
        let events = spawn_event_pump(ws.clone(), incoming, move |msg| match msg {
            WsIncoming::Text(text) => parse_ws_message(&text, vad_events),
            _ => Vec::new(),
        });
        self.ws = Some(ws);
        Ok((self, events))
    }
}

/// Convert one Deepgram message into provider events.
fn parse_ws_message(text: &str, vad_events: bool) -> Vec<ProviderEvent> {
    let envelope: DgTypeOnly = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("DeepgramSTTService: failed to parse message: {}: {}", e, text);
            return Vec::new();
        }
    };

    match envelope.msg_type.as_deref().unwrap_or("") {
        "Results" => match serde_json::from_str::<DgResult>(text) {
            Ok(result) => transcription_events(result),
            Err(e) => {
                tracing::warn!("DeepgramSTTService: failed to parse Results: {}", e);
                Vec::new()
            }
        },
        "SpeechStarted" if vad_events => vec![ProviderEvent::SpeechStarted],
        "UtteranceEnd" if vad_events => vec![ProviderEvent::SpeechStopped],
        "Error" => {
            let description = serde_json::from_str::<DgError>(text)
                .ok()
                .and_then(|e| e.description.or(e.message))
                .unwrap_or_else(|| "Unknown Deepgram error".to_string());
            tracing::error!("DeepgramSTTService: error from server: {}", description);
            vec![ProviderEvent::Error(format!("Deepgram error: {description}"))]
        }
        "Metadata" => {
            tracing::debug!("DeepgramSTTService: received metadata message");
            Vec::new()
        }
        other => {
            tracing::trace!("DeepgramSTTService: unhandled message type: {}", other);
            Vec::new()
        }
    }
}

fn transcription_events(result: DgResult) -> Vec<ProviderEvent> {
    let Some(transcript) = result
        .channel
        .and_then(|c| c.alternatives.into_iter().next())
        .map(|a| a.transcript)
    else {
        return Vec::new();
    };

    let speech_final = result.speech_final.unwrap_or(false);
    let mut events = Vec::new();
    if !transcript.is_empty() {
        let is_final = result.is_final.unwrap_or(false);
        if is_final {
            tracing::debug!(text = %transcript, "Deepgram: final transcription");
        }
        events.push(ProviderEvent::Transcript {
            role: TranscriptRole::User,
            text: transcript,
            is_final,
        });
    }
    if speech_final {
        events.push(ProviderEvent::SpeechStopped);
    }
    events
}

impl fmt::Debug for DeepgramSTTService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepgramSTTService")
            .field("model", &self.model)
            .field("sample_rate", &self.sample_rate)
            .field("encoding", &self.encoding)
            .field("connected", &self.ws.as_ref().is_some_and(WsConnection::is_open))
            .finish()
    }
}

impl fmt::Display for DeepgramSTTService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeepgramSTTService({})", self.model)
    }
}

#[async_trait]
impl SpeechToText for DeepgramSTTService {
    async fn send_audio(&self, slin: &[u8]) -> Result<(), ServiceError> {
        let ws = self
            .ws
            .as_ref()
            .ok_or_else(|| ServiceError::Disconnected("Deepgram: not connected".into()))?;
        ws.send_binary(slin.to_vec())
    }

    async fn close(&self) {
        if let Some(ws) = &self.ws {
            ws.close_with(Some(r#"{"type":"CloseStream"}"#.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ws_url_defaults() {
        let url = DeepgramSTTService::new("k").build_ws_url();
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(url.contains("model=nova-2"));
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("sample_rate=8000"));
        assert!(url.contains("vad_events=true"));
        assert!(url.contains("utterance_end_ms=1000"));
        assert!(url.contains("interim_results=true"));
    }

    #[test]
    fn test_build_ws_url_custom() {
        let url = DeepgramSTTService::new("k")
            .with_model("nova-3")
            .with_language("es")
            .with_vad_events(false)
            .with_base_url("wss://dg.example.test/")
            .build_ws_url();
        assert!(url.starts_with("wss://dg.example.test/v1/listen?"));
        assert!(url.contains("model=nova-3"));
        assert!(url.contains("language=es"));
        assert!(!url.contains("vad_events"));
    }

    #[test]
    fn test_parse_final_with_speech_final() {
        let json = r#"{
            "type": "Results",
            "channel": {"alternatives": [{"transcript": "my bill", "confidence": 0.9}]},
            "is_final": true,
            "speech_final": true
        }"#;
        assert_eq!(
            parse_ws_message(json, true),
            vec![
                ProviderEvent::Transcript {
                    role: TranscriptRole::User,
                    text: "my bill".into(),
                    is_final: true,
                },
                ProviderEvent::SpeechStopped,
            ]
        );
    }

    #[test]
    fn test_parse_interim_and_empty() {
        let interim = r#"{"type":"Results","channel":{"alternatives":[{"transcript":"my"}]},"is_final":false}"#;
        assert!(matches!(
            &parse_ws_message(interim, true)[..],
            [ProviderEvent::Transcript { is_final: false, .. }]
        ));

        let empty = r#"{"type":"Results","channel":{"alternatives":[{"transcript":""}]},"is_final":true}"#;
        assert!(parse_ws_message(empty, true).is_empty());
    }

    #[test]
    fn test_parse_vad_events() {
        let started = r#"{"type": "SpeechStarted", "channel": [0], "timestamp": 1.0}"#;
        assert_eq!(parse_ws_message(started, true), vec![ProviderEvent::SpeechStarted]);
        assert!(parse_ws_message(started, false).is_empty());

        let ended = r#"{"type": "UtteranceEnd", "last_word_end": 2.1}"#;
        assert_eq!(parse_ws_message(ended, true), vec![ProviderEvent::SpeechStopped]);
    }

    #[test]
    fn test_parse_error() {
        let json = r#"{"type": "Error", "description": "Rate limit exceeded"}"#;
        assert!(matches!(
            &parse_ws_message(json, true)[..],
            [ProviderEvent::Error(e)] if e.contains("Rate limit exceeded")
        ));
    }

    #[test]
    fn test_display_and_debug() {
        let stt = DeepgramSTTService::new("key").with_model("nova-3");
        assert_eq!(format!("{stt}"), "DeepgramSTTService(nova-3)");
        assert!(format!("{stt:?}").contains("linear16"));
    }
}
