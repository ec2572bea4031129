// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Network transports towards the telephony channel driver.

pub mod audiosocket;

pub use audiosocket::AudioSocketServer;
