// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Direct mode: caller audio straight into a realtime speech-to-speech
//! session, its audio straight back out.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::config::RealtimeSettings;
use crate::error::BridgeError;
use crate::services::{ProviderEvent, RealtimeService, TranscriptRole};
use crate::session::{AudioInput, CallSession};

/// Tool the model calls to hang up.
pub const END_CALL_TOOL: &str = "end_call";

/// Hang up this long after `end_call` even if no goodbye arrives.
const END_CALL_GRACE: Duration = Duration::from_secs(10);

pub(crate) async fn run(
    session: Arc<CallSession>,
    settings: RealtimeSettings,
) -> Result<(), BridgeError> {
    let (realtime, mut events) = session
        .ctx()
        .connector
        .connect_realtime(&settings)
        .await?;
    if !session.attach(AudioInput::Realtime(Arc::clone(&realtime))) {
        realtime.close().await;
        return Ok(());
    }
    tracing::info!(session_id = %session.id(), "direct: realtime session connected");

    if let Some(greeting) = settings.greeting.as_deref().filter(|g| !g.trim().is_empty()) {
        realtime.speak(greeting).await?;
    }

    // Set once `end_call` was requested; true once the goodbye produced audio.
    let mut ending: Option<bool> = None;

    loop {
        let event = tokio::select! {
            _ = session.closed() => return Ok(()),
            event = events.recv() => event,
        };
        let Some(event) = event else {
            return Err(BridgeError::ProviderDisconnect("realtime event stream ended".into()));
        };

        match event {
            ProviderEvent::Audio(slin) => {
                if let Some(heard) = ending.as_mut() {
                    *heard = true;
                }
                session.playback().enqueue(&slin);
            }
            ProviderEvent::SpeechStarted => {
                if session.barge_in() {
                    realtime.cancel_response().await?;
                }
            }
            ProviderEvent::SpeechStopped => {
                tracing::debug!(session_id = %session.id(), "direct: caller stopped speaking");
            }
            ProviderEvent::ResponseDone => {
                session.playback().flush();
                if ending == Some(true) {
                    session.close_after_drain("end_call");
                }
            }
            ProviderEvent::Transcript {
                role,
                text,
                is_final: true,
            } => {
                let who = match role {
                    TranscriptRole::User => "caller",
                    TranscriptRole::Assistant => "agent",
                };
                tracing::info!(session_id = %session.id(), who, text = %text, "direct: transcript");
            }
            ProviderEvent::Transcript { .. } => {}
            ProviderEvent::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                handle_tool_call(&session, realtime.as_ref(), &call_id, &name, &arguments).await?;
                if name == END_CALL_TOOL && ending.is_none() {
                    ending = Some(false);
                    session.schedule_close(END_CALL_GRACE, "end_call");
                }
            }
            ProviderEvent::Error(message) => {
                tracing::warn!(session_id = %session.id(), error = %message, "direct: provider error");
            }
            ProviderEvent::Disconnected { reason } => {
                return Err(BridgeError::ProviderDisconnect(reason));
            }
        }
    }
}

async fn handle_tool_call(
    session: &CallSession,
    realtime: &dyn RealtimeService,
    call_id: &str,
    name: &str,
    arguments: &str,
) -> Result<(), BridgeError> {
    tracing::info!(session_id = %session.id(), tool = name, arguments, "direct: tool call");
    let output = if name == END_CALL_TOOL {
        json!({ "ok": true })
    } else {
        tracing::warn!(session_id = %session.id(), tool = name, "direct: unknown tool");
        json!({ "error": format!("unknown tool '{name}'") })
    };
    realtime
        .send_function_result(call_id, &output.to_string())
        .await?;
    Ok(())
}
