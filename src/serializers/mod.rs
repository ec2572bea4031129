// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Wire-format serialization for the telephony transport.

pub mod audiosocket;

pub use audiosocket::{AudioSocketMessage, FrameDecoder, MessageType};

/// Errors raised while decoding AudioSocket frames.
///
/// None of these are fatal to the connection: the offending frame is
/// discarded and decoding continues with the next header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    #[error("identifier frame must carry 16 bytes, got {0}")]
    InvalidIdentifier(usize),
    #[error("invalid DTMF payload {0:?}")]
    InvalidDtmf(Vec<u8>),
    #[error("payload of {0} bytes exceeds the 16-bit length field")]
    PayloadTooLarge(usize),
}
