// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Pipeline mode: streaming STT, chat-completion LLM, streaming TTS.
//!
//! Final transcript fragments are collected until the STT service reports the
//! end of the utterance; only then is the LLM asked for a reply. Every
//! completed utterance and every barge-in bumps a generation counter. LLM
//! replies run on their own task and are spoken only if their generation is
//! still current; TTS audio that arrives after a barge-in is dropped until
//! the interrupted stream reports completion.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::PipelineAgent;
use crate::error::BridgeError;
use crate::services::{ChatMessage, ProviderEvent, ServiceError, TranscriptRole};
use crate::session::{AudioInput, CallSession};

type Reply = (u64, Result<String, ServiceError>);

/// Final transcript fragments of the utterance in progress.
#[derive(Debug, Default)]
struct Utterance {
    fragments: Vec<String>,
}

impl Utterance {
    fn push(&mut self, fragment: &str) {
        let fragment = fragment.trim();
        if !fragment.is_empty() {
            self.fragments.push(fragment.to_string());
        }
    }

    /// The whole utterance, once the caller has stopped speaking.
    fn finish(&mut self) -> Option<String> {
        if self.fragments.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.fragments).join(" "))
    }
}

pub(crate) async fn run(session: Arc<CallSession>, agent: PipelineAgent) -> Result<(), BridgeError> {
    let connector = &session.ctx().connector;
    let llm = connector
        .llm(agent.llm_model.as_deref())
        .ok_or_else(|| BridgeError::Connection("no LLM configured for pipeline mode".into()))?;

    let (stt, mut stt_events) = connector.connect_stt(&agent.stt).await?;
    let (tts, mut tts_events) = match connector.connect_tts(&agent.tts).await {
        Ok(connected) => connected,
        Err(e) => {
            stt.close().await;
            return Err(e.into());
        }
    };
    if !session.attach(AudioInput::Pipeline {
        stt: Arc::clone(&stt),
        tts: Arc::clone(&tts),
    }) {
        stt.close().await;
        tts.close().await;
        return Ok(());
    }
    tracing::info!(session_id = %session.id(), "pipeline: STT and TTS connected");

    let mut history = Vec::new();
    if !agent.system_prompt.trim().is_empty() {
        history.push(ChatMessage::system(agent.system_prompt.clone()));
    }
    if let Some(greeting) = agent.greeting.as_deref().filter(|g| !g.trim().is_empty()) {
        tts.send_text(greeting).await?;
        tts.flush().await?;
        history.push(ChatMessage::assistant(greeting));
    }

    let (reply_tx, mut replies) = mpsc::unbounded_channel::<Reply>();
    let mut generation: u64 = 0;
    let mut discard_tts = false;
    let mut utterance = Utterance::default();

    loop {
        tokio::select! {
            biased;
            _ = session.closed() => return Ok(()),
            event = stt_events.recv() => match event {
                None => return Err(BridgeError::ProviderDisconnect("stt event stream ended".into())),
                Some(ProviderEvent::SpeechStarted) => {
                    if session.barge_in() {
                        generation += 1;
                        discard_tts = true;
                    }
                }
                Some(ProviderEvent::Transcript { role: TranscriptRole::User, text, is_final: true }) => {
                    tracing::debug!(session_id = %session.id(), text = %text, "pipeline: final fragment");
                    utterance.push(&text);
                }
                Some(ProviderEvent::SpeechStopped) => {
                    let Some(text) = utterance.finish() else {
                        continue;
                    };
                    tracing::info!(session_id = %session.id(), text = %text, "pipeline: caller said");
                    generation += 1;
                    history.push(ChatMessage::user(text));

                    let llm = Arc::clone(&llm);
                    let messages = history.clone();
                    let tx = reply_tx.clone();
                    let current = generation;
                    tokio::spawn(async move {
                        let reply = llm.complete(&messages).await;
                        let _ = tx.send((current, reply));
                    });
                }
                Some(ProviderEvent::Disconnected { reason }) => {
                    return Err(BridgeError::ProviderDisconnect(format!("stt: {reason}")));
                }
                Some(ProviderEvent::Error(message)) => {
                    tracing::warn!(session_id = %session.id(), error = %message, "pipeline: STT error");
                }
                Some(other) => {
                    tracing::trace!(session_id = %session.id(), event = ?other, "pipeline: STT event");
                }
            },
            event = tts_events.recv() => match event {
                None => return Err(BridgeError::ProviderDisconnect("tts event stream ended".into())),
                Some(ProviderEvent::Audio(slin)) => {
                    if !discard_tts {
                        session.playback().enqueue(&slin);
                    }
                }
                Some(ProviderEvent::ResponseDone) => {
                    discard_tts = false;
                    session.playback().flush();
                }
                Some(ProviderEvent::Disconnected { reason }) => {
                    return Err(BridgeError::ProviderDisconnect(format!("tts: {reason}")));
                }
                Some(ProviderEvent::Error(message)) => {
                    tracing::warn!(session_id = %session.id(), error = %message, "pipeline: TTS error");
                }
                Some(_) => {}
            },
            Some((reply_generation, reply)) = replies.recv() => {
                if reply_generation != generation || session.is_closed() {
                    tracing::debug!(session_id = %session.id(), "pipeline: discarding stale reply");
                    continue;
                }
                match reply {
                    Ok(text) if !text.trim().is_empty() => {
                        let text = text.trim().to_string();
                        tracing::info!(session_id = %session.id(), text = %text, "pipeline: agent reply");
                        discard_tts = false;
                        tts.send_text(&text).await?;
                        tts.flush().await?;
                        history.push(ChatMessage::assistant(text));
                    }
                    Ok(_) => tracing::warn!(session_id = %session.id(), "pipeline: empty LLM reply"),
                    Err(e) => tracing::warn!(session_id = %session.id(), error = %e, "pipeline: LLM call failed"),
                }
            }
        }
    }
}
