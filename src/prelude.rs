// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Common re-exports.
//!
//! ```
//! use voicebridge::prelude::*;
//! ```

pub use std::sync::Arc;

pub use crate::audio::dtmf::KeypadEntry;
pub use crate::config::{AgentConfig, AgentMode, BridgeConfig, FlowAgent, PipelineAgent, RealtimeSettings};
pub use crate::error::{BridgeError, Result};
pub use crate::flows::{
    FlowAction, FlowDefinition, FlowEngine, FlowEvent, FlowLifecycle, FlowState, FlowStateStore,
    InMemoryFlowStateStore,
};
pub use crate::serializers::{AudioSocketMessage, FrameDecoder};
pub use crate::services::{
    CloudConnector, LlmClient, ProviderConnector, ProviderEvent, RealtimeService, SpeechToText,
    TextToSpeech,
};
pub use crate::session::{BridgeContext, CallSession, Playback, SessionMode};
pub use crate::transports::AudioSocketServer;
