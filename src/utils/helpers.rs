// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Shared utility functions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Next value of a process-wide counter, for cheap numeric handles.
pub fn next_handle_id() -> u64 {
    static HANDLES: AtomicU64 = AtomicU64::new(1);
    HANDLES.fetch_add(1, Ordering::Relaxed)
}

/// Encode bytes to base64 using the standard alphabet.
pub fn encode_base64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode a base64 string to bytes using the standard alphabet.
///
/// Returns `None` if the input is not valid base64.
pub fn decode_base64(data: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(data).ok()
}

/// Render a JSON value the way it should appear inside spoken text.
///
/// Strings are emitted without quotes, `null` becomes empty, everything else
/// uses its compact JSON form.
pub fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_handle_id_increases() {
        let a = next_handle_id();
        let b = next_handle_id();
        assert!(b > a);
    }

    #[test]
    fn test_decode_base64_invalid() {
        assert!(decode_base64("not valid base64!!!").is_none());
        assert_eq!(decode_base64(&encode_base64(b"pcm")).as_deref(), Some(&b"pcm"[..]));
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&json!("Alice")), "Alice");
        assert_eq!(value_to_text(&json!(42)), "42");
        assert_eq!(value_to_text(&json!(true)), "true");
        assert_eq!(value_to_text(&json!(null)), "");
    }
}
