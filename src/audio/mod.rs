// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Audio transcoding: G.711 codec, FIR resampling, DTMF digits.

pub mod codec;
pub mod dtmf;
pub mod resampler;
