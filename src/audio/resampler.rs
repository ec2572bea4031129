// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Integer-ratio FIR resampling between telephony and provider rates.
//!
//! The telephony leg is 8 kHz slin; realtime speech providers want 24 kHz
//! PCM16. Integer ratios go through a fixed 48-tap Blackman-windowed sinc
//! low-pass kernel:
//!
//! - upsample by N: zero-insert, convolve, multiply by N.
//! - downsample by N: convolve (anti-alias), keep every Nth sample.
//!
//! Every call works on one self-contained buffer. No filter history is
//! carried between chunks, so the first and last ~24 samples of each chunk
//! see a truncated kernel. [`to_telephony`] and [`from_telephony`] pick the
//! FIR path for integer ratios and fall back to linear interpolation
//! otherwise.

use std::sync::OnceLock;

use crate::audio::codec::{
    mulaw_to_pcm, pcm_to_samples, resample_linear, resample_linear_pcm, samples_to_pcm,
};

/// Number of taps in the low-pass kernel.
pub const FIR_TAPS: usize = 48;

/// Telephony sample rate (AudioSocket slin).
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// Sample rate used by the realtime speech-to-speech provider.
pub const REALTIME_SAMPLE_RATE: u32 = 24000;

// Convolution offsets. Their sum equals FIR_TAPS - 1, which cancels the
// kernel's 23.5-sample group delay over an up/down round trip.
const UPSAMPLE_OFFSET: isize = (FIR_TAPS / 2) as isize - 1;
const DOWNSAMPLE_OFFSET: isize = (FIR_TAPS / 2) as isize;

/// Windowed-sinc low-pass kernel for a given integer rate factor.
///
/// The cutoff sits at `1 / (2 * factor)` of the higher sample rate, which is
/// the Nyquist frequency of the lower rate. Taps are normalised to unity DC
/// gain.
#[derive(Debug, Clone)]
pub struct LowPassFir {
    factor: usize,
    taps: [f64; FIR_TAPS],
}

impl LowPassFir {
    /// Design the kernel for `factor` (clamped to at least 1).
    pub fn new(factor: usize) -> Self {
        let factor = factor.max(1);
        let cutoff = 0.5 / factor as f64;
        let center = (FIR_TAPS - 1) as f64 / 2.0;
        let span = (FIR_TAPS - 1) as f64;

        let mut taps = [0.0f64; FIR_TAPS];
        for (n, tap) in taps.iter_mut().enumerate() {
            let m = n as f64 - center;
            let x = 2.0 * cutoff * m;
            let sinc = if x == 0.0 {
                1.0
            } else {
                (std::f64::consts::PI * x).sin() / (std::f64::consts::PI * x)
            };
            let phase = 2.0 * std::f64::consts::PI * n as f64 / span;
            let window = 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos();
            *tap = 2.0 * cutoff * sinc * window;
        }

        let sum: f64 = taps.iter().sum();
        if sum != 0.0 {
            for tap in taps.iter_mut() {
                *tap /= sum;
            }
        }

        Self { factor, taps }
    }

    /// The rate factor this kernel was designed for.
    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Kernel coefficients.
    pub fn taps(&self) -> &[f64] {
        &self.taps
    }
}

fn kernel_for(factor: usize) -> LowPassFir {
    static KERNEL_X3: OnceLock<LowPassFir> = OnceLock::new();
    if factor == 3 {
        KERNEL_X3.get_or_init(|| LowPassFir::new(3)).clone()
    } else {
        LowPassFir::new(factor)
    }
}

fn to_i16(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Upsample by an integer factor: zero insertion, FIR low-pass, gain `factor`.
pub fn upsample(samples: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 || samples.is_empty() {
        return samples.to_vec();
    }
    let kernel = kernel_for(factor);
    let gain = factor as f64;
    let out_len = samples.len() * factor;
    let mut out = Vec::with_capacity(out_len);

    for j in 0..out_len as isize {
        let mut acc = 0.0;
        for (k, tap) in kernel.taps.iter().enumerate() {
            let idx = j - k as isize + UPSAMPLE_OFFSET;
            if idx < 0 || idx >= out_len as isize || idx as usize % factor != 0 {
                continue;
            }
            acc += tap * samples[idx as usize / factor] as f64;
        }
        out.push(to_i16(acc * gain));
    }
    out
}

/// Downsample by an integer factor: FIR anti-alias filter, keep every Nth.
pub fn downsample(samples: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 || samples.is_empty() {
        return samples.to_vec();
    }
    let kernel = kernel_for(factor);
    let len = samples.len() as isize;
    let out_len = samples.len().div_ceil(factor);
    let mut out = Vec::with_capacity(out_len);

    for m in 0..out_len as isize {
        let center = m * factor as isize;
        let mut acc = 0.0;
        for (k, tap) in kernel.taps.iter().enumerate() {
            let idx = center - k as isize + DOWNSAMPLE_OFFSET;
            if idx < 0 || idx >= len {
                continue;
            }
            acc += tap * samples[idx as usize] as f64;
        }
        out.push(to_i16(acc));
    }
    out
}

/// 8 kHz slin bytes to 24 kHz PCM16 bytes.
pub fn upsample_8k_to_24k(pcm: &[u8]) -> Vec<u8> {
    samples_to_pcm(&upsample(&pcm_to_samples(pcm), 3))
}

/// 24 kHz PCM16 bytes to 8 kHz slin bytes.
pub fn downsample_24k_to_8k(pcm: &[u8]) -> Vec<u8> {
    samples_to_pcm(&downsample(&pcm_to_samples(pcm), 3))
}

/// Convert PCM16 between arbitrary rates.
///
/// Integer ratios use the FIR path; anything else falls back to linear
/// interpolation.
pub fn resample_pcm(pcm: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return pcm.to_vec();
    }
    if from_rate > to_rate && from_rate % to_rate == 0 {
        let factor = (from_rate / to_rate) as usize;
        return samples_to_pcm(&downsample(&pcm_to_samples(pcm), factor));
    }
    if to_rate > from_rate && to_rate % from_rate == 0 {
        let factor = (to_rate / from_rate) as usize;
        return samples_to_pcm(&upsample(&pcm_to_samples(pcm), factor));
    }
    resample_linear_pcm(pcm, from_rate, to_rate)
}

/// Audio encodings produced or consumed by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// G.711 mu-law, 8 kHz.
    Mulaw8k,
    /// Linear PCM16 little-endian at the given rate.
    Pcm16 { sample_rate: u32 },
}

impl AudioEncoding {
    /// Parse a provider format tag such as `ulaw_8000` or `pcm_22050`.
    pub fn from_format_tag(tag: &str) -> Option<Self> {
        if tag == "ulaw_8000" {
            return Some(Self::Mulaw8k);
        }
        let rate = tag.strip_prefix("pcm_")?.parse().ok()?;
        Some(Self::Pcm16 { sample_rate: rate })
    }
}

/// Convert provider audio into 8 kHz slin for the telephony leg.
pub fn to_telephony(audio: &[u8], encoding: AudioEncoding) -> Vec<u8> {
    match encoding {
        AudioEncoding::Mulaw8k => mulaw_to_pcm(audio),
        AudioEncoding::Pcm16 { sample_rate } => {
            resample_pcm(audio, sample_rate, TELEPHONY_SAMPLE_RATE)
        }
    }
}

/// Convert 8 kHz slin from the telephony leg into PCM16 at `to_rate`.
pub fn from_telephony(slin: &[u8], to_rate: u32) -> Vec<u8> {
    resample_pcm(slin, TELEPHONY_SAMPLE_RATE, to_rate)
}

/// Linear-interpolation resampling of raw samples, re-exported for callers
/// that already hold `i16` buffers.
pub fn resample_samples_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    resample_linear(samples, from_rate, to_rate)
}
