// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! ITU-T G.711 mu-law codec and PCM byte helpers.
//!
//! Both directions are table driven: decoding indexes a 256-entry table built
//! at compile time, encoding uses a 256-entry segment (exponent) lookup. No
//! sample-rate change happens here; mu-law and slin are both 8 kHz on the
//! telephony side. Rate conversion lives in [`crate::audio::resampler`].

/// Bias added before mu-law compression (ITU-T G.711).
const MULAW_BIAS: i32 = 0x84; // 132
/// Maximum linear magnitude before clipping.
const MULAW_CLIP: i32 = 32635;

/// Mu-law code that decodes to "negative zero"; it re-encodes as `0xFF`.
pub const MULAW_NEGATIVE_ZERO: u8 = 0x7F;

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut code = 0;
    while code < 256 {
        let complement = !(code as u8) as i32;
        let sign = complement & 0x80;
        let exponent = (complement >> 4) & 0x07;
        let mantissa = complement & 0x0F;
        let magnitude = (((mantissa << 1) | 0x21) << (exponent + 2)) - MULAW_BIAS;
        table[code] = if sign != 0 {
            -magnitude as i16
        } else {
            magnitude as i16
        };
        code += 1;
    }
    table
}

const fn build_exponent_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 1;
    while i < 256 {
        let mut exponent = 0u8;
        let mut v = i >> 1;
        while v > 0 {
            exponent += 1;
            v >>= 1;
        }
        table[i] = exponent;
        i += 1;
    }
    table
}

/// Mu-law code point to 16-bit linear sample.
pub static MULAW_DECODE_TABLE: [i16; 256] = build_decode_table();

/// Segment number indexed by `(biased_magnitude >> 7) & 0xFF`.
static MULAW_EXPONENT_TABLE: [u8; 256] = build_exponent_table();

/// Encode a single 16-bit linear PCM sample to mu-law.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let sign: i32 = if sample < 0 { 0x80 } else { 0x00 };
    let magnitude = (sample as i32).abs().min(MULAW_CLIP) + MULAW_BIAS;

    let exponent = MULAW_EXPONENT_TABLE[((magnitude >> 7) & 0xFF) as usize] as i32;
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decode a single mu-law byte to a 16-bit linear PCM sample.
#[inline]
pub fn mulaw_to_linear(mulaw_byte: u8) -> i16 {
    MULAW_DECODE_TABLE[mulaw_byte as usize]
}

/// Decode a buffer of mu-law bytes to 16-bit linear PCM bytes (little-endian).
pub fn mulaw_to_pcm(mulaw_data: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(mulaw_data.len().saturating_mul(2));
    for &byte in mulaw_data {
        pcm.extend_from_slice(&mulaw_to_linear(byte).to_le_bytes());
    }
    pcm
}

/// Encode 16-bit linear PCM bytes (little-endian) to mu-law bytes.
///
/// If `pcm_data` has an odd length, the trailing byte is ignored.
pub fn pcm_to_mulaw(pcm_data: &[u8]) -> Vec<u8> {
    pcm_to_samples(pcm_data)
        .into_iter()
        .map(linear_to_mulaw)
        .collect()
}

/// Interpret little-endian PCM16 bytes as samples.
///
/// A trailing odd byte is dropped with a warning.
pub fn pcm_to_samples(pcm_data: &[u8]) -> Vec<i16> {
    if pcm_data.len() % 2 != 0 {
        tracing::warn!(
            "pcm_to_samples: odd-length input ({} bytes), trailing byte ignored",
            pcm_data.len()
        );
    }
    pcm_data
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Serialize samples as little-endian PCM16 bytes.
pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Resample PCM16 samples using linear interpolation at fractional source
/// positions.
///
/// This is the cheap path for non-integer ratios (e.g. 22050 -> 8000). It
/// does no anti-alias filtering, so it is only used for directions that are
/// not latency-critical and tolerate the lower fidelity.
pub fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.len() < 2 || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }

    let input_len = input.len();
    let ratio = from_rate as f64 / to_rate as f64;
    let output_len_f = ((input_len as f64) / ratio).ceil();
    if !output_len_f.is_finite() || output_len_f < 0.0 {
        return input.to_vec();
    }
    let output_len = output_len_f as usize;

    let mut output = Vec::with_capacity(output_len);
    for i in 0..output_len {
        let src_pos = i as f64 * ratio;
        let src_idx = src_pos.floor() as usize;
        let frac = src_pos - src_idx as f64;

        let sample = if src_idx + 1 < input_len {
            let s0 = input[src_idx] as f64;
            let s1 = input[src_idx + 1] as f64;
            (s0 + frac * (s1 - s0)).round() as i16
        } else {
            input[input_len - 1]
        };
        output.push(sample);
    }
    output
}

/// Byte-level wrapper around [`resample_linear`].
pub fn resample_linear_pcm(pcm_data: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if from_rate == to_rate {
        return pcm_data.to_vec();
    }
    samples_to_pcm(&resample_linear(&pcm_to_samples(pcm_data), from_rate, to_rate))
}

/// Standard WAV file header size (44 bytes).
pub const WAV_HEADER_SIZE: usize = 44;

fn is_wav(data: &[u8]) -> bool {
    data.len() >= WAV_HEADER_SIZE && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE"
}

/// Strip a standard 44-byte WAV header from audio data.
///
/// Returns the original data unchanged if it doesn't look like a WAV file.
pub fn strip_wav_header(data: &[u8]) -> &[u8] {
    if is_wav(data) {
        &data[WAV_HEADER_SIZE..]
    } else {
        data
    }
}

/// Sample rate declared in a canonical WAV `fmt ` chunk, if present.
pub fn wav_sample_rate(data: &[u8]) -> Option<u32> {
    if !is_wav(data) {
        return None;
    }
    Some(u32::from_le_bytes([data[24], data[25], data[26], data[27]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mulaw_table_roundtrip_all_codes() {
        for code in 0u8..=255 {
            let decoded = mulaw_to_linear(code);
            let reencoded = linear_to_mulaw(decoded);
            if code == MULAW_NEGATIVE_ZERO {
                assert_eq!(reencoded, 0xFF, "negative zero canonicalises to 0xFF");
            } else {
                assert_eq!(reencoded, code, "code {code:#04x} decoded to {decoded}");
            }
        }
    }

    #[test]
    fn test_mulaw_known_values() {
        assert_eq!(mulaw_to_linear(0xFF), 0);
        assert_eq!(mulaw_to_linear(0x00), -32124);
        assert_eq!(mulaw_to_linear(0x80), 32124);
        assert_eq!(linear_to_mulaw(0), 0xFF);
        assert_eq!(linear_to_mulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_mulaw(i16::MIN), 0x00);
    }

    #[test]
    fn test_mulaw_lossy_but_close() {
        for sample in [-32000i16, -1000, -100, 0, 100, 1000, 32000] {
            let decoded = mulaw_to_linear(linear_to_mulaw(sample));
            let error = (sample as i32 - decoded as i32).unsigned_abs();
            assert!(
                error < 1000 || (error as f64 / sample.unsigned_abs() as f64) < 0.05,
                "sample={sample}, decoded={decoded}, error={error}"
            );
        }
    }

    #[test]
    fn test_pcm_to_mulaw_buffer() {
        let pcm = vec![0u8, 0, 0xFF, 0x7F]; // [0, 32767]
        let mulaw = pcm_to_mulaw(&pcm);
        assert_eq!(mulaw, vec![0xFF, 0x80]);
        assert_eq!(mulaw_to_pcm(&mulaw).len(), 4);
    }

    #[test]
    fn test_pcm_to_samples_odd_length() {
        assert_eq!(pcm_to_samples(&[1, 0, 9]), vec![1]);
    }

    #[test]
    fn test_resample_linear_lengths() {
        assert_eq!(resample_linear(&[100, 200], 8000, 24000).len(), 6);
        assert_eq!(resample_linear(&[100, 200, 300, 400, 500, 600], 24000, 8000).len(), 2);
        // 22050 -> 8000: 441 samples (20 ms) -> 160
        assert_eq!(resample_linear(&vec![0i16; 441], 22050, 8000).len(), 160);
    }

    #[test]
    fn test_resample_linear_interpolates() {
        let out = resample_linear(&[0, 300], 8000, 24000);
        assert_eq!(&out[..3], &[0, 100, 200]);
    }

    #[test]
    fn test_resample_linear_same_rate_and_empty() {
        let data = vec![0u8, 1, 2, 3];
        assert_eq!(resample_linear_pcm(&data, 8000, 8000), data);
        assert!(resample_linear(&[], 8000, 16000).is_empty());
    }

    #[test]
    fn test_wav_header_helpers() {
        let mut data = vec![0u8; 100];
        data[0..4].copy_from_slice(b"RIFF");
        data[8..12].copy_from_slice(b"WAVE");
        data[24..28].copy_from_slice(&22050u32.to_le_bytes());
        assert_eq!(strip_wav_header(&data).len(), 100 - WAV_HEADER_SIZE);
        assert_eq!(wav_sample_rate(&data), Some(22050));

        let raw = vec![0u8; 100];
        assert_eq!(strip_wav_header(&raw).len(), 100);
        assert_eq!(wav_sample_rate(&raw), None);
        assert_eq!(strip_wav_header(&raw[..10]).len(), 10);
    }
}
