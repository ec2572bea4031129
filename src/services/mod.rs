// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Provider session clients (realtime speech-to-speech, STT, TTS) and the
//! chat-completion LLM.
//!
//! Every client speaks 8 kHz slin at its boundary: callers push telephony
//! audio in, and audio events coming out are already converted back to the
//! telephony rate. Provider-native formats never leak into the call session.

pub mod connector;
pub mod deepgram;
pub mod elevenlabs;
pub mod openai;
pub mod openai_realtime;
pub mod shared;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{RealtimeSettings, SttSettings, TtsSettings};

pub use connector::CloudConnector;

/// Errors raised by provider clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection timed out after {0}s")]
    Timeout(u64),
    #[error("provider disconnected: {0}")]
    Disconnected(String),
    #[error("provider protocol error: {0}")]
    Protocol(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("no API key configured for {0}")]
    MissingApiKey(&'static str),
}

/// Who a transcript belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    User,
    Assistant,
}

/// Normalized inbound event from any provider.
#[derive(Clone, PartialEq)]
pub enum ProviderEvent {
    /// Voice activity began on the caller side.
    SpeechStarted,
    /// Voice activity ended (or an utterance boundary was detected).
    SpeechStopped,
    Transcript {
        role: TranscriptRole,
        text: String,
        is_final: bool,
    },
    /// 8 kHz slin ready for playback.
    Audio(Vec<u8>),
    /// The current response (or TTS stream) has finished.
    ResponseDone,
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    Error(String),
    Disconnected {
        reason: String,
    },
}

impl fmt::Debug for ProviderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpeechStarted => write!(f, "SpeechStarted"),
            Self::SpeechStopped => write!(f, "SpeechStopped"),
            Self::Transcript {
                role,
                text,
                is_final,
            } => write!(f, "Transcript({role:?}, final={is_final}, {text:?})"),
            Self::Audio(pcm) => write!(f, "Audio({} bytes)", pcm.len()),
            Self::ResponseDone => write!(f, "ResponseDone"),
            Self::FunctionCall { call_id, name, .. } => {
                write!(f, "FunctionCall({name}, {call_id})")
            }
            Self::Error(e) => write!(f, "Error({e})"),
            Self::Disconnected { reason } => write!(f, "Disconnected({reason})"),
        }
    }
}

/// Stream of events from one provider session.
pub type ProviderEvents = mpsc::UnboundedReceiver<ProviderEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message of a chat-completion conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Combined speech-to-speech session.
#[async_trait]
pub trait RealtimeService: Send + Sync {
    /// Append caller audio (8 kHz slin) to the input buffer.
    async fn send_audio(&self, slin: &[u8]) -> Result<(), ServiceError>;

    /// Close the buffered caller audio into a user turn.
    async fn commit_audio(&self) -> Result<(), ServiceError>;

    /// Discard caller audio that has not been committed yet.
    async fn clear_audio(&self) -> Result<(), ServiceError>;

    /// Inject a user text turn and ask for a response.
    async fn send_text(&self, text: &str) -> Result<(), ServiceError>;

    /// Have the assistant say `text` verbatim. Only one response may be in
    /// progress; wait for [`ProviderEvent::ResponseDone`] before the next.
    async fn speak(&self, text: &str) -> Result<(), ServiceError>;

    /// Abort the response in progress (barge-in).
    async fn cancel_response(&self) -> Result<(), ServiceError>;

    /// Reply to a function call and let the model continue.
    async fn send_function_result(&self, call_id: &str, output: &str)
        -> Result<(), ServiceError>;

    /// Idempotent.
    async fn close(&self);
}

/// Streaming speech-to-text session.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn send_audio(&self, slin: &[u8]) -> Result<(), ServiceError>;

    async fn close(&self);
}

/// Streaming text-to-speech session.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Queue a text chunk for synthesis.
    async fn send_text(&self, text: &str) -> Result<(), ServiceError>;

    /// Force synthesis of everything queued so far.
    async fn flush(&self) -> Result<(), ServiceError>;

    async fn close(&self);
}

/// One-shot chat completion.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError>;
}

/// Factory for provider sessions; one connection per call.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect_realtime(
        &self,
        settings: &RealtimeSettings,
    ) -> Result<(Arc<dyn RealtimeService>, ProviderEvents), ServiceError>;

    async fn connect_stt(
        &self,
        settings: &SttSettings,
    ) -> Result<(Arc<dyn SpeechToText>, ProviderEvents), ServiceError>;

    async fn connect_tts(
        &self,
        settings: &TtsSettings,
    ) -> Result<(Arc<dyn TextToSpeech>, ProviderEvents), ServiceError>;

    /// Chat LLM for flow nodes and the pipeline, if one is configured.
    fn llm(&self, model: Option<&str>) -> Option<Arc<dyn LlmClient>>;
}
