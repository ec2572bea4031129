// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use voicebridge::config::{BridgeConfig, RealtimeSettings, SttSettings, TtsSettings};
use voicebridge::flows::{FlowEngine, InMemoryFlowStateStore};
use voicebridge::services::{
    LlmClient, ProviderConnector, ProviderEvent, ProviderEvents, RealtimeService, ServiceError,
    SpeechToText, TextToSpeech,
};
use voicebridge::session::BridgeContext;

/// Byte the fake provider fills its speech audio with.
pub const SPEECH_BYTE: u8 = 0x11;

/// How long the fake takes to finish a spoken response.
pub const RESPONSE_TIME: Duration = Duration::from_millis(30);

/// What the bridge asked the fake realtime session to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeCall {
    Audio(usize),
    Commit,
    Clear,
    Text(String),
    Speak(String),
    Cancel,
    FunctionResult { call_id: String, output: String },
}

pub struct FakeRealtime {
    pub settings: RealtimeSettings,
    calls: Mutex<Vec<RealtimeCall>>,
    events: mpsc::UnboundedSender<ProviderEvent>,
    closed: AtomicBool,
    responding: Arc<AtomicBool>,
    overlapping: Mutex<Vec<String>>,
}

impl FakeRealtime {
    pub fn calls(&self) -> Vec<RealtimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RealtimeCall::Speak(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    pub fn say_final(&self, text: &str) {
        self.emit(ProviderEvent::Transcript {
            role: voicebridge::services::TranscriptRole::User,
            text: text.to_string(),
            is_final: true,
        });
    }

    /// Text passed to `speak` while an earlier response was still running.
    pub fn overlapping(&self) -> Vec<String> {
        self.overlapping.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: RealtimeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RealtimeService for FakeRealtime {
    async fn send_audio(&self, slin: &[u8]) -> Result<(), ServiceError> {
        self.record(RealtimeCall::Audio(slin.len()));
        Ok(())
    }

    async fn commit_audio(&self) -> Result<(), ServiceError> {
        self.record(RealtimeCall::Commit);
        Ok(())
    }

    async fn clear_audio(&self) -> Result<(), ServiceError> {
        self.record(RealtimeCall::Clear);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), ServiceError> {
        self.record(RealtimeCall::Text(text.to_string()));
        Ok(())
    }

    /// Answers with three frames of audio, then completes the response
    /// after [`RESPONSE_TIME`]. Like the real service it accepts one response
    /// at a time; a second request while one runs is recorded.
    async fn speak(&self, text: &str) -> Result<(), ServiceError> {
        self.record(RealtimeCall::Speak(text.to_string()));
        if self.responding.swap(true, Ordering::SeqCst) {
            self.overlapping.lock().unwrap().push(text.to_string());
            return Ok(());
        }
        let events = self.events.clone();
        let responding = Arc::clone(&self.responding);
        tokio::spawn(async move {
            let _ = events.send(ProviderEvent::Audio(vec![SPEECH_BYTE; 960]));
            tokio::time::sleep(RESPONSE_TIME).await;
            responding.store(false, Ordering::SeqCst);
            let _ = events.send(ProviderEvent::ResponseDone);
        });
        Ok(())
    }

    async fn cancel_response(&self) -> Result<(), ServiceError> {
        self.record(RealtimeCall::Cancel);
        Ok(())
    }

    async fn send_function_result(&self, call_id: &str, output: &str) -> Result<(), ServiceError> {
        self.record(RealtimeCall::FunctionResult {
            call_id: call_id.to_string(),
            output: output.to_string(),
        });
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`FakeRealtime`] sessions and keeps them for inspection.
#[derive(Default)]
pub struct FakeConnector {
    realtime: Mutex<Vec<Arc<FakeRealtime>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connected(&self) -> usize {
        self.realtime.lock().unwrap().len()
    }

    /// Wait for the `index`th realtime connection.
    pub async fn realtime(&self, index: usize) -> Arc<FakeRealtime> {
        wait_for(|| self.realtime.lock().unwrap().get(index).cloned()).await
    }
}

#[async_trait]
impl ProviderConnector for FakeConnector {
    async fn connect_realtime(
        &self,
        settings: &RealtimeSettings,
    ) -> Result<(Arc<dyn RealtimeService>, ProviderEvents), ServiceError> {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Arc::new(FakeRealtime {
            settings: settings.clone(),
            calls: Mutex::new(Vec::new()),
            events,
            closed: AtomicBool::new(false),
            responding: Arc::new(AtomicBool::new(false)),
            overlapping: Mutex::new(Vec::new()),
        });
        self.realtime.lock().unwrap().push(Arc::clone(&session));
        Ok((session, rx))
    }

    async fn connect_stt(
        &self,
        _settings: &SttSettings,
    ) -> Result<(Arc<dyn SpeechToText>, ProviderEvents), ServiceError> {
        Err(ServiceError::Connection("stt not available in tests".into()))
    }

    async fn connect_tts(
        &self,
        _settings: &TtsSettings,
    ) -> Result<(Arc<dyn TextToSpeech>, ProviderEvents), ServiceError> {
        Err(ServiceError::Connection("tts not available in tests".into()))
    }

    fn llm(&self, _model: Option<&str>) -> Option<Arc<dyn LlmClient>> {
        None
    }
}

pub fn context(connector: Arc<FakeConnector>) -> Arc<BridgeContext> {
    context_with(connector, BridgeConfig::default())
}

pub fn context_with(connector: Arc<FakeConnector>, config: BridgeConfig) -> Arc<BridgeContext> {
    Arc::new(BridgeContext::new(
        Arc::new(config),
        connector,
        Arc::new(FlowEngine::new(Arc::new(InMemoryFlowStateStore::new()))),
    ))
}

/// Poll `check` until it yields a value; panics after five seconds.
pub async fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    wait_for(|| cond().then_some(())).await
}

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}
