// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Flow mode: the flow engine decides what is said and when; a realtime
//! session with automatic responses turned off does the talking and the
//! transcription.
//!
//! The realtime session runs one response at a time, so utterances the flow
//! produces back to back are queued and each is requested only after the
//! previous response reports completion.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::codec::{strip_wav_header, wav_sample_rate};
use crate::audio::resampler::{resample_pcm, TELEPHONY_SAMPLE_RATE};
use crate::config::FlowAgent;
use crate::error::BridgeError;
use crate::flows::{FlowError, FlowEvent, FlowEventKind, FlowLifecycle, FlowState};
use crate::services::{ProviderEvent, RealtimeService, TranscriptRole};
use crate::session::{AudioInput, CallSession, SessionCommand};

/// Hang up this long after the flow ends even if the goodbye never finishes.
const END_GRACE: Duration = Duration::from_secs(15);

pub(crate) async fn run(
    session: Arc<CallSession>,
    agent_id: String,
    agent: FlowAgent,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) -> Result<(), BridgeError> {
    let ctx = session.ctx();
    let conversation_id = session.id().to_string();

    let mut settings = agent.realtime.clone();
    settings.auto_response = false;
    let (realtime, mut provider_events) = ctx.connector.connect_realtime(&settings).await?;
    if !session.attach(AudioInput::Realtime(Arc::clone(&realtime))) {
        realtime.close().await;
        return Ok(());
    }

    // Subscribe before starting so the greeting is not missed. The handle is
    // dropped (and unsubscribed) when this task ends.
    let mut flow_events = ctx.engine.subscribe(&conversation_id);
    let (timeouts_tx, mut timeouts) = mpsc::unbounded_channel::<String>();
    let mut driver = FlowDriver {
        session: Arc::clone(&session),
        realtime,
        conversation_id,
        current_node: String::new(),
        listen_timer: None,
        timeouts: timeouts_tx,
        utterances: VecDeque::new(),
        responding: false,
        ending: false,
        hanging_up: false,
    };

    let mut variables = agent.variables.clone();
    variables
        .entry("session_id".to_string())
        .or_insert_with(|| json!(session.id()));
    let started = ctx
        .engine
        .start_flow(
            Arc::new(agent.flow.clone()),
            &driver.conversation_id,
            &agent_id,
            variables,
        )
        .await;
    driver.settle(started)?;

    loop {
        tokio::select! {
            biased;
            _ = session.closed() => return Ok(()),
            Some(event) = flow_events.recv() => driver.on_flow_event(event).await?,
            event = provider_events.recv() => match event {
                Some(event) => driver.on_provider_event(event).await?,
                None => return Err(BridgeError::ProviderDisconnect("realtime event stream ended".into())),
            },
            Some(node_id) = timeouts.recv() => driver.on_listen_timeout(&node_id).await?,
            Some(command) = commands.recv() => driver.on_command(command).await?,
        }
    }
}

struct FlowDriver {
    session: Arc<CallSession>,
    realtime: Arc<dyn RealtimeService>,
    conversation_id: String,
    /// Node most recently entered, used to tag listen timers.
    current_node: String,
    listen_timer: Option<CancellationToken>,
    timeouts: mpsc::UnboundedSender<String>,
    /// Text waiting for the current response to finish.
    utterances: VecDeque<String>,
    /// A response was requested and has not reported completion yet.
    responding: bool,
    /// The flow reached an end or transfer.
    ending: bool,
    hanging_up: bool,
}

impl FlowDriver {
    fn engine(&self) -> &crate::flows::FlowEngine {
        &self.session.ctx().engine
    }

    /// Decide what an engine call's outcome means for the call.
    fn settle(&self, result: Result<FlowState, FlowError>) -> Result<(), BridgeError> {
        match result {
            Ok(state) => {
                tracing::debug!(
                    session_id = %self.conversation_id,
                    node_id = %state.current_node_id,
                    state = %state.state,
                    "flow: advanced"
                );
                Ok(())
            }
            // Released or already finished; nothing left to drive.
            Err(FlowError::NotActive(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Queue `text` and start it right away if nothing is being said.
    async fn say(&mut self, text: String) -> Result<(), BridgeError> {
        self.utterances.push_back(text);
        self.speak_next().await
    }

    async fn speak_next(&mut self) -> Result<(), BridgeError> {
        if self.responding {
            return Ok(());
        }
        if let Some(text) = self.utterances.pop_front() {
            self.responding = true;
            self.realtime.speak(&text).await?;
        }
        Ok(())
    }

    /// Once the flow has ended and everything queued has been said, hang up
    /// after playback drains.
    fn hang_up_when_quiet(&mut self) {
        if self.ending && !self.hanging_up && !self.responding && self.utterances.is_empty() {
            self.hanging_up = true;
            self.session.close_after_drain("flow ended");
        }
    }

    fn cancel_listen_timer(&mut self) {
        if let Some(timer) = self.listen_timer.take() {
            timer.cancel();
        }
    }

    fn arm_listen_timer(&mut self, timeout_ms: u64) {
        self.cancel_listen_timer();
        let token = self.session.cancellation().child_token();
        let node_id = self.current_node.clone();
        let tx = self.timeouts.clone();
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    let _ = tx.send(node_id);
                }
            }
        });
        self.listen_timer = Some(token);
    }

    async fn on_flow_event(&mut self, event: FlowEvent) -> Result<(), BridgeError> {
        let session_id = self.conversation_id.as_str();
        match event.kind {
            FlowEventKind::NodeEntered { node_id, node_type } => {
                tracing::debug!(session_id, node_id = %node_id, node_type, "flow: node entered");
                self.current_node = node_id;
            }
            FlowEventKind::Speak { text } => {
                tracing::info!(session_id, text = %text, "flow: speak");
                self.say(text).await?;
            }
            FlowEventKind::Listen {
                prompt,
                timeout_ms,
                store_as,
            } => {
                tracing::debug!(session_id, store_as = %store_as, timeout_ms, "flow: listen");
                if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
                    self.say(prompt).await?;
                }
                self.arm_listen_timer(timeout_ms);
            }
            FlowEventKind::Transfer {
                destination,
                transfer_type,
                message,
            } => {
                tracing::info!(
                    session_id,
                    destination = %destination,
                    transfer_type = transfer_type.as_str(),
                    "flow: transfer requested"
                );
                self.finish(message).await?;
            }
            FlowEventKind::End { outcome, message } => {
                tracing::info!(session_id, outcome = %outcome, "flow: ended");
                self.finish(message).await?;
            }
            FlowEventKind::PlayUrl { url } => self.play_url(url),
            FlowEventKind::Error { message } => {
                tracing::error!(session_id, error = %message, "flow: error");
            }
            FlowEventKind::VariableSet { name, .. } => {
                tracing::trace!(session_id, name = %name, "flow: variable set");
            }
            FlowEventKind::NodeCompleted { node_id, success } => {
                tracing::trace!(session_id, node_id = %node_id, success, "flow: node completed");
            }
            FlowEventKind::StateChanged { from, to } => {
                tracing::debug!(session_id, from = %from, to = %to, "flow: state changed");
            }
        }
        Ok(())
    }

    /// Speak the parting message (if any) and hang up once everything queued
    /// has played.
    async fn finish(&mut self, message: Option<String>) -> Result<(), BridgeError> {
        if self.ending {
            return Ok(());
        }
        self.ending = true;
        self.cancel_listen_timer();
        // Caller audio still buffered can no longer answer anything.
        self.realtime.clear_audio().await?;
        if let Some(message) = message.filter(|m| !m.trim().is_empty()) {
            self.say(message).await?;
        }
        if self.responding {
            self.session.schedule_close(END_GRACE, "flow ended");
        }
        self.hang_up_when_quiet();
        Ok(())
    }

    fn play_url(&self, url: String) {
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let fetched = tokio::select! {
                _ = session.closed() => return,
                fetched = fetch_clip(&session.ctx().http, &url) => fetched,
            };
            match fetched {
                Ok(slin) => {
                    tracing::debug!(session_id = %session.id(), url = %url, bytes = slin.len(), "flow: playing clip");
                    session.playback().enqueue(&slin);
                    session.playback().flush();
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.id(), url = %url, error = %e, "flow: clip fetch failed");
                }
            }
        });
    }

    async fn on_provider_event(&mut self, event: ProviderEvent) -> Result<(), BridgeError> {
        match event {
            ProviderEvent::Audio(slin) => self.session.playback().enqueue(&slin),
            ProviderEvent::SpeechStarted => {
                if !self.ending && self.session.barge_in() && self.responding {
                    self.realtime.cancel_response().await?;
                }
            }
            ProviderEvent::SpeechStopped => {}
            ProviderEvent::ResponseDone => {
                self.session.playback().flush();
                self.responding = false;
                self.speak_next().await?;
                self.hang_up_when_quiet();
            }
            ProviderEvent::Transcript {
                role: TranscriptRole::User,
                text,
                is_final: true,
            } => {
                if self.ending || text.trim().is_empty() {
                    return Ok(());
                }
                tracing::info!(session_id = %self.conversation_id, text = %text, "flow: caller said");
                self.cancel_listen_timer();
                let result = self
                    .engine()
                    .handle_user_input(&self.conversation_id, &text)
                    .await;
                self.settle(result)?;
            }
            ProviderEvent::Transcript { .. } => {}
            ProviderEvent::FunctionCall { call_id, name, .. } => {
                tracing::warn!(session_id = %self.conversation_id, tool = %name, "flow: unexpected tool call");
                let output = json!({ "error": "tools are not available in this call" });
                self.realtime
                    .send_function_result(&call_id, &output.to_string())
                    .await?;
            }
            ProviderEvent::Error(message) => {
                tracing::warn!(session_id = %self.conversation_id, error = %message, "flow: provider error");
            }
            ProviderEvent::Disconnected { reason } => {
                return Err(BridgeError::ProviderDisconnect(reason));
            }
        }
        Ok(())
    }

    async fn on_listen_timeout(&mut self, node_id: &str) -> Result<(), BridgeError> {
        if self.ending {
            return Ok(());
        }
        self.listen_timer = None;
        let result = self
            .engine()
            .handle_listen_timeout(&self.conversation_id, node_id)
            .await;
        self.settle(result)
    }

    async fn on_command(&mut self, command: SessionCommand) -> Result<(), BridgeError> {
        match command {
            SessionCommand::Dtmf(key) => {
                let waiting = self
                    .engine()
                    .get_state(&self.conversation_id)
                    .is_some_and(|s| s.state == FlowLifecycle::WaitingInput);
                if !waiting || self.ending {
                    return Ok(());
                }
                self.cancel_listen_timer();
                // The keypad answered; half-spoken audio must not answer again.
                self.realtime.clear_audio().await?;
                let result = self
                    .engine()
                    .handle_user_input(&self.conversation_id, &key.as_char().to_string())
                    .await;
                self.settle(result)
            }
        }
    }
}

/// Download a clip and convert it to 8 kHz slin.
async fn fetch_clip(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, BridgeError> {
    let response = client
        .get(url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| BridgeError::Connection(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(BridgeError::Connection(format!("HTTP {status} fetching {url}")));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| BridgeError::Connection(e.to_string()))?;
    Ok(decode_clip(&bytes))
}

/// WAV (rate from the header) or raw 8 kHz PCM16 to 8 kHz slin.
pub fn decode_clip(data: &[u8]) -> Vec<u8> {
    let (pcm, rate) = match wav_sample_rate(data) {
        Some(rate) => (strip_wav_header(data), rate),
        None => (data, TELEPHONY_SAMPLE_RATE),
    };
    // Drop a dangling odd byte.
    let pcm = &pcm[..pcm.len() & !1];
    if rate == TELEPHONY_SAMPLE_RATE || rate == 0 {
        pcm.to_vec()
    } else {
        resample_pcm(pcm, rate, TELEPHONY_SAMPLE_RATE)
    }
}
