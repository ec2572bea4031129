// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! voicebridge - AudioSocket bridge for AI voice agents.
//!
//! A telephony channel driver connects over TCP and streams 8 kHz signed
//! linear audio using the AudioSocket framing. Each call is matched to an
//! agent configuration registered ahead of time over HTTP, then bridged to a
//! realtime speech-to-speech provider (`direct`), driven by a node graph
//! (`flow`), or run through a streaming STT, LLM and TTS chain (`pipeline`).

pub mod audio;
pub mod config;
pub mod error;
pub mod flows;
pub mod http;
pub mod prelude;
pub mod serializers;
pub mod services;
pub mod session;
pub mod transports;
pub mod utils;
