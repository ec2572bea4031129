// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! AudioSocket frame codec.
//!
//! Every message on the wire is `type (1 byte) || length (2 bytes, big
//! endian) || payload`. The channel driver sends:
//!
//! - `0x00` hangup, zero length
//! - `0x01` session identifier, 16 raw bytes
//! - `0x03` DTMF digit, one ASCII byte
//! - `0x10` audio, 8 kHz 16-bit signed linear PCM (little endian samples)
//! - `0xFF` error, zero length (some drivers append a one-byte cause)
//!
//! TCP delivers arbitrary fragments, so [`FrameDecoder`] accumulates bytes
//! and only yields a frame once its whole payload has arrived.

use std::fmt;

use uuid::Uuid;

use crate::audio::dtmf::KeypadEntry;
use crate::serializers::ProtocolError;

/// Size of the type + length header.
pub const HEADER_LEN: usize = 3;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hangup = 0x00,
    Identifier = 0x01,
    Dtmf = 0x03,
    Audio = 0x10,
    Error = 0xFF,
}

impl MessageType {
    /// Map a wire byte to a known frame type.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Hangup),
            0x01 => Some(Self::Identifier),
            0x03 => Some(Self::Dtmf),
            0x10 => Some(Self::Audio),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// A decoded AudioSocket message.
#[derive(Clone, PartialEq, Eq)]
pub enum AudioSocketMessage {
    /// Call terminated by the channel driver (or by us, outbound).
    Hangup,
    /// Session identifier, sent once at the start of a connection.
    Identifier(Uuid),
    /// One DTMF digit.
    Dtmf(KeypadEntry),
    /// 8 kHz slin audio.
    Audio(Vec<u8>),
    /// Channel-side error, optional cause bytes.
    Error(Vec<u8>),
}

impl AudioSocketMessage {
    /// The type byte for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Hangup => MessageType::Hangup,
            Self::Identifier(_) => MessageType::Identifier,
            Self::Dtmf(_) => MessageType::Dtmf,
            Self::Audio(_) => MessageType::Audio,
            Self::Error(_) => MessageType::Error,
        }
    }

    /// Serialize to wire bytes.
    ///
    /// Fails only when the payload cannot fit the 16-bit length field; use
    /// [`encode_audio`] to split long audio buffers.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut dtmf = [0u8; 1];
        let payload: &[u8] = match self {
            Self::Hangup => &[],
            Self::Identifier(id) => id.as_bytes(),
            Self::Dtmf(key) => {
                key.as_char().encode_utf8(&mut dtmf);
                &dtmf
            }
            Self::Audio(pcm) => pcm,
            Self::Error(cause) => cause,
        };
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(self.message_type() as u8);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }
}

impl fmt::Debug for AudioSocketMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hangup => write!(f, "Hangup"),
            Self::Identifier(id) => write!(f, "Identifier({id})"),
            Self::Dtmf(key) => write!(f, "Dtmf({key})"),
            Self::Audio(pcm) => write!(f, "Audio({} bytes)", pcm.len()),
            Self::Error(cause) => write!(f, "Error({cause:?})"),
        }
    }
}

/// Encode an arbitrarily long slin buffer as one or more audio frames.
pub fn encode_audio(pcm: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len() + HEADER_LEN);
    // Keep chunks sample-aligned.
    let max_chunk = MAX_PAYLOAD_LEN & !1;
    for chunk in pcm.chunks(max_chunk) {
        out.push(MessageType::Audio as u8);
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);
    }
    out
}

fn parse_payload(type_byte: u8, payload: &[u8]) -> Result<AudioSocketMessage, ProtocolError> {
    let kind = MessageType::from_byte(type_byte).ok_or(ProtocolError::UnknownType(type_byte))?;
    match kind {
        MessageType::Hangup => Ok(AudioSocketMessage::Hangup),
        MessageType::Identifier => {
            let bytes: [u8; 16] = payload
                .try_into()
                .map_err(|_| ProtocolError::InvalidIdentifier(payload.len()))?;
            Ok(AudioSocketMessage::Identifier(Uuid::from_bytes(bytes)))
        }
        MessageType::Dtmf => match payload {
            [byte] => KeypadEntry::from_ascii(*byte)
                .map(AudioSocketMessage::Dtmf)
                .ok_or_else(|| ProtocolError::InvalidDtmf(payload.to_vec())),
            _ => Err(ProtocolError::InvalidDtmf(payload.to_vec())),
        },
        MessageType::Audio => Ok(AudioSocketMessage::Audio(payload.to_vec())),
        MessageType::Error => Ok(AudioSocketMessage::Error(payload.to_vec())),
    }
}

/// Incremental, fragmentation-tolerant frame decoder.
///
/// Bytes are appended with [`push`](Self::push); complete frames are pulled
/// with [`next_frame`](Self::next_frame). A partial trailing frame stays
/// buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Read cursor into `buffer`; consumed bytes are compacted on push.
    start: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the transport.
    pub fn push(&mut self, data: &[u8]) {
        if self.start > 0 {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed as a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.start
    }

    /// Extract the next complete frame.
    ///
    /// Returns `None` when fewer than `3 + length` bytes are buffered. A
    /// malformed or unknown frame is consumed and reported as `Some(Err)`, so
    /// the caller can log it and keep decoding.
    pub fn next_frame(&mut self) -> Option<Result<AudioSocketMessage, ProtocolError>> {
        let available = &self.buffer[self.start..];
        if available.len() < HEADER_LEN {
            return None;
        }
        let type_byte = available[0];
        let len = u16::from_be_bytes([available[1], available[2]]) as usize;
        if available.len() < HEADER_LEN + len {
            return None;
        }
        let payload = &available[HEADER_LEN..HEADER_LEN + len];
        let result = parse_payload(type_byte, payload);
        self.start += HEADER_LEN + len;
        Some(result)
    }

    /// Push `data` and return every complete, well-formed frame.
    ///
    /// Protocol errors are logged and the offending frames skipped.
    pub fn decode(&mut self, data: &[u8]) -> Vec<AudioSocketMessage> {
        self.push(data);
        let mut frames = Vec::new();
        while let Some(result) = self.next_frame() {
            match result {
                Ok(frame) => frames.push(frame),
                Err(e) => tracing::warn!(error = %e, "AudioSocket: discarding frame"),
            }
        }
        frames
    }
}
