// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Per-call sessions.
//!
//! A [`CallSession`] is created when the identifier frame arrives. It takes
//! the matching registration out of the [`PendingRegistry`], fixes its
//! [`SessionMode`] from it, and spawns the bridge for that mode. A call
//! without a registration stays `pending`: no provider, no keepalive, and a
//! timed close.
//!
//! Closing is idempotent and releases everything the session started: the
//! playback driver, timers and bridge tasks (through one cancellation token),
//! the provider connections, the flow subscription and the registry slot.

mod direct;
mod flow;
pub mod playback;
mod pipeline;
pub mod registry;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::dtmf::KeypadEntry;
use crate::config::{AgentConfig, AgentMode, BridgeConfig};
use crate::error::BridgeError;
use crate::flows::FlowEngine;
use crate::serializers::audiosocket::AudioSocketMessage;
use crate::services::{ProviderConnector, RealtimeService, SpeechToText, TextToSpeech};

pub use flow::decode_clip;
pub use playback::{FrameSender, Playback};
pub use registry::{PendingRegistry, SessionRegistry};

/// Longest wait for queued audio to finish before hanging up anyway.
const DRAIN_LIMIT: Duration = Duration::from_secs(15);

/// How a registered call is driven. Fixed when the session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// No registration matched; waiting to be closed.
    Pending,
    Direct,
    Flow,
    Pipeline,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Direct => "direct",
            Self::Flow => "flow",
            Self::Pipeline => "pipeline",
        }
    }

    fn for_agent(agent: Option<&AgentConfig>) -> Self {
        match agent.map(|a| &a.mode) {
            None => Self::Pending,
            Some(AgentMode::Direct(_)) => Self::Direct,
            Some(AgentMode::Flow(_)) => Self::Flow,
            Some(AgentMode::Pipeline(_)) => Self::Pipeline,
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide collaborators shared by every session.
pub struct BridgeContext {
    pub config: Arc<BridgeConfig>,
    pub connector: Arc<dyn ProviderConnector>,
    pub engine: Arc<FlowEngine>,
    pub pending: PendingRegistry,
    pub sessions: SessionRegistry,
    /// Client for fetching playAudio clips.
    pub http: reqwest::Client,
}

impl fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeContext")
            .field("pending", &self.pending)
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl BridgeContext {
    pub fn new(
        config: Arc<BridgeConfig>,
        connector: Arc<dyn ProviderConnector>,
        engine: Arc<FlowEngine>,
    ) -> Self {
        Self {
            config,
            connector,
            engine,
            pending: PendingRegistry::new(),
            sessions: SessionRegistry::new(),
            http: reqwest::Client::new(),
        }
    }

    /// Validate and store an agent configuration ahead of its call.
    ///
    /// Returns `true` if an earlier registration for the same id was
    /// replaced.
    pub fn register(&self, session_id: &str, config: AgentConfig) -> Result<bool, BridgeError> {
        config.validate()?;
        let replaced = self.pending.register(session_id, config);
        tracing::info!(session_id, replaced, "session: registered agent configuration");
        Ok(replaced)
    }

    /// Periodically purge registrations no connection claimed in time.
    pub fn spawn_registration_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let ctx = Arc::clone(self);
        let ttl = ctx.config.pending_registration_ttl;
        let period = (ttl / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = ctx.pending.purge_expired(ttl);
                        if purged > 0 {
                            tracing::info!(purged, "session: expired pending registrations");
                        }
                    }
                }
            }
        });
    }

    /// Close every live session.
    pub async fn close_all(&self, reason: &str) {
        for session in self.sessions.all() {
            session.close(reason).await;
        }
    }
}

/// Provider connections feeding on caller audio.
#[derive(Clone)]
pub(crate) enum AudioInput {
    Realtime(Arc<dyn RealtimeService>),
    Pipeline {
        stt: Arc<dyn SpeechToText>,
        tts: Arc<dyn TextToSpeech>,
    },
}

impl AudioInput {
    async fn close(self) {
        match self {
            Self::Realtime(realtime) => realtime.close().await,
            Self::Pipeline { stt, tts } => {
                stt.close().await;
                tts.close().await;
            }
        }
    }
}

/// Input from the channel driver that the bridge handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    Dtmf(KeypadEntry),
}

/// One bridged phone call.
pub struct CallSession {
    id: String,
    mode: SessionMode,
    agent: Option<Arc<AgentConfig>>,
    ctx: Arc<BridgeContext>,
    playback: Playback,
    out: Mutex<Option<FrameSender>>,
    input: Mutex<Option<AudioInput>>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallSession({}, {})", self.id, self.mode)
    }
}

impl CallSession {
    /// Create the session for `id`, claim its registry slot and start the
    /// bridge for its mode. Audio and hangup frames go out through `out`.
    pub fn open(
        ctx: Arc<BridgeContext>,
        id: Uuid,
        out: FrameSender,
    ) -> Result<Arc<CallSession>, BridgeError> {
        let id = id.to_string();
        let duplicate = || BridgeError::Validation(format!("session {id} is already connected"));
        // A second connection for a live id must not consume the registration.
        if ctx.sessions.get(&id).is_some() {
            return Err(duplicate());
        }
        let agent = ctx.pending.take(&id);
        let mode = SessionMode::for_agent(agent.as_deref());
        let (commands, command_rx) = mpsc::unbounded_channel();

        let session = Arc::new(CallSession {
            id: id.clone(),
            mode,
            agent,
            ctx: Arc::clone(&ctx),
            playback: Playback::new(),
            out: Mutex::new(Some(out.clone())),
            input: Mutex::new(None),
            commands,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        if ctx.sessions.insert(Arc::clone(&session)).is_err() {
            if let Some(agent) = session.agent.clone() {
                ctx.pending.restore(&id, agent);
            }
            return Err(duplicate());
        }

        let agent_id = session.agent.as_ref().map(|a| a.agent_id.clone());
        tracing::info!(session_id = %id, mode = %mode, agent_id = ?agent_id, "session: opened");

        let agent = session.agent.clone();
        match agent.as_deref().map(|a| &a.mode) {
            None => {
                tracing::warn!(session_id = %id, "session: no registration, closing after timeout");
                session.schedule_close(ctx.config.pending_session_timeout, "no registration");
            }
            Some(mode) => {
                session
                    .playback
                    .spawn_driver(out, session.cancel.child_token());
                let agent_id = agent_id.unwrap_or_default();
                match mode.clone() {
                    AgentMode::Direct(settings) => {
                        session.spawn_bridge(direct::run(Arc::clone(&session), settings));
                    }
                    AgentMode::Flow(flow_agent) => {
                        session.spawn_bridge(flow::run(
                            Arc::clone(&session),
                            agent_id,
                            flow_agent,
                            command_rx,
                        ));
                    }
                    AgentMode::Pipeline(pipeline_agent) => {
                        session.spawn_bridge(pipeline::run(Arc::clone(&session), pipeline_agent));
                    }
                }
            }
        }
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn agent(&self) -> Option<&AgentConfig> {
        self.agent.as_deref()
    }

    pub fn playback(&self) -> &Playback {
        &self.playback
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the session closes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn ctx(&self) -> &BridgeContext {
        &self.ctx
    }

    /// Resolves once the session has started closing.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Forward caller audio to the attached provider.
    pub async fn handle_audio(&self, slin: &[u8]) {
        let input = self
            .input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let result = match input {
            Some(AudioInput::Realtime(realtime)) => realtime.send_audio(slin).await,
            Some(AudioInput::Pipeline { stt, .. }) => stt.send_audio(slin).await,
            None => {
                tracing::trace!(session_id = %self.id, bytes = slin.len(), "session: no provider yet, dropping audio");
                return;
            }
        };
        if let Err(e) = result {
            tracing::debug!(session_id = %self.id, error = %e, "session: failed to forward audio");
        }
    }

    pub fn handle_dtmf(&self, key: KeypadEntry) {
        tracing::info!(session_id = %self.id, digit = %key, "session: DTMF");
        if self.mode == SessionMode::Flow && self.commands.send(SessionCommand::Dtmf(key)).is_err() {
            tracing::debug!(session_id = %self.id, "session: bridge gone, DTMF dropped");
        }
    }

    /// Record the provider connection. Returns `false` (and leaves the
    /// caller responsible for closing it) if the session already closed.
    pub(crate) fn attach(&self, input: AudioInput) -> bool {
        let mut slot = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }
        *slot = Some(input);
        true
    }

    /// Clear playback for barge-in. Returns whether anything was playing.
    pub(crate) fn barge_in(&self) -> bool {
        let active = self.playback.is_playing() || self.playback.queued_bytes() > 0;
        self.playback.clear();
        if active {
            tracing::debug!(session_id = %self.id, "session: barge-in, playback cleared");
        }
        active
    }

    fn spawn_bridge<F>(self: &Arc<Self>, bridge: F)
    where
        F: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let reason = match bridge.await {
                Ok(()) => "bridge finished".to_string(),
                Err(e) => {
                    tracing::error!(session_id = %session.id, mode = %session.mode, error = %e, "session: bridge failed");
                    e.to_string()
                }
            };
            session.close(&reason).await;
        });
    }

    /// Close after `delay` unless the session closes first.
    pub(crate) fn schedule_close(self: &Arc<Self>, delay: Duration, reason: &'static str) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => session.close(reason).await,
            }
        });
    }

    /// Hang up once queued audio has played out.
    pub(crate) fn close_after_drain(self: &Arc<Self>, reason: &'static str) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                drained = tokio::time::timeout(DRAIN_LIMIT, session.playback.wait_drained()) => {
                    if drained.is_err() {
                        tracing::warn!(session_id = %session.id, "session: playback did not drain, hanging up");
                    }
                }
            }
            session.close(reason).await;
        });
    }

    /// Tear the call down. Repeat calls are no-ops.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(session_id = %self.id, mode = %self.mode, reason, "session: closing");

        self.cancel.cancel();
        self.playback.clear();

        let input = self
            .input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(input) = input {
            input.close().await;
        }

        if self.mode == SessionMode::Flow {
            self.ctx.engine.release(&self.id).await;
        }
        self.ctx.sessions.remove(self);

        let out = self.out.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(out) = out {
            if let Ok(frame) = AudioSocketMessage::Hangup.encode() {
                let _ = out.send(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeSettings;
    use crate::flows::InMemoryFlowStateStore;
    use crate::services::CloudConnector;

    fn context(config: BridgeConfig) -> Arc<BridgeContext> {
        let config = Arc::new(config);
        Arc::new(BridgeContext::new(
            Arc::clone(&config),
            Arc::new(CloudConnector::new(config)),
            Arc::new(FlowEngine::new(Arc::new(InMemoryFlowStateStore::new()))),
        ))
    }

    #[test]
    fn test_mode_from_registration() {
        assert_eq!(SessionMode::for_agent(None), SessionMode::Pending);
        let direct = AgentConfig::direct("a", RealtimeSettings::default());
        assert_eq!(SessionMode::for_agent(Some(&direct)), SessionMode::Direct);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_session_closes_after_timeout() {
        let ctx = context(BridgeConfig {
            pending_session_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let (out, mut frames) = mpsc::unbounded_channel();
        let session = CallSession::open(Arc::clone(&ctx), Uuid::new_v4(), out).unwrap();
        assert_eq!(session.mode(), SessionMode::Pending);
        assert_eq!(ctx.sessions.len(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        // No keepalive while pending.
        assert!(frames.try_recv().is_err());
        assert!(!session.is_closed());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(session.is_closed());
        assert!(ctx.sessions.is_empty());
        let hangup = frames.recv().await.unwrap();
        assert_eq!(hangup, vec![0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected_and_close_idempotent() {
        let ctx = context(BridgeConfig::default());
        let id = Uuid::new_v4();
        let (out, _frames) = mpsc::unbounded_channel();
        let first = CallSession::open(Arc::clone(&ctx), id, out.clone()).unwrap();
        assert!(CallSession::open(Arc::clone(&ctx), id, out).is_err());

        // The rejected connection leaves a fresh registration untouched.
        ctx.register(&id.to_string(), AgentConfig::direct("later", RealtimeSettings::default()))
            .unwrap();
        assert!(CallSession::open(Arc::clone(&ctx), id, mpsc::unbounded_channel().0).is_err());
        assert!(ctx.pending.contains(&id.to_string()));

        first.close("test").await;
        first.close("again").await;
        assert!(first.is_closed());
        assert!(ctx.sessions.get(&id.to_string()).is_none());
    }

    #[test]
    fn test_register_validates() {
        let ctx = context(BridgeConfig::default());
        let bad: AgentConfig = serde_json::from_value(serde_json::json!({
            "agentId": "a",
            "mode": "flow",
            "flow": {"nodes": []}
        }))
        .unwrap();
        assert!(matches!(
            ctx.register("s1", bad),
            Err(BridgeError::Validation(_))
        ));
        assert!(ctx.pending.is_empty());
    }
}
