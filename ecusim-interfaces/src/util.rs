/*
 * Copyright (c) 2026 The Contributors to Eclipse OpenSOVD (see CONTRIBUTORS)
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::SimulationError;

/// Character set scripted descriptions may use to group hex digits.
/// `#` is the PGN marker and is treated as a separator during matching.
const SEPARATORS: [char; 7] = ['_', '.', ',', ';', ' ', '#', '\t'];

/// Upper bound for generated byte strings, matching the maximum UDS payload.
const MAX_RESPONSE_BYTES: usize = 4096;

/// Remove all separator characters from a scripted hex string.
#[must_use]
pub fn strip_separators(raw: &str) -> String {
    raw.chars().filter(|c| !SEPARATORS.contains(c)).collect()
}

/// Decode a scripted hex string (separator insensitive) into bytes.
///
/// # Errors
/// `SimulationError::Decode` when the cleaned string has an odd number of
/// digits or contains non-hex characters. Callers log and treat the payload
/// as empty instead of failing the request.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, SimulationError> {
    let cleaned = strip_separators(value);
    if cleaned.len() % 2 != 0 {
        return Err(SimulationError::Decode(format!(
            "odd number of hex digits in '{value}'"
        )));
    }
    hex::decode(&cleaned).map_err(|e| SimulationError::Decode(format!("'{value}': {e}")))
}

/// Encode bytes as uppercase hex pairs separated by single spaces,
/// e.g. `[0x62, 0xF1]` -> `"62 F1"`.
#[must_use]
pub fn encode_hex_spaced(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render `value` as a big-endian hex byte string of exactly `len` bytes.
///
/// Values wider than `len` are truncated to the least significant bytes,
/// narrower ones are zero padded on the left. `len == 0` yields an empty
/// string; `len` is clamped to the maximum UDS payload size.
///
/// ```
/// use ecusim_interfaces::util::to_byte_response;
/// assert_eq!(to_byte_response(13248, 2), "33 C0");
/// assert_eq!(to_byte_response(13248, 3), "00 33 C0");
/// assert_eq!(to_byte_response(13248, 1), "C0");
/// ```
#[must_use]
pub fn to_byte_response(value: u32, len: usize) -> String {
    let len = len.min(MAX_RESPONSE_BYTES);
    if len == 0 {
        return String::new();
    }
    let be = value.to_be_bytes();
    let mut bytes = vec![0u8; len];
    if len >= be.len() {
        bytes[len - be.len()..].copy_from_slice(&be);
    } else {
        bytes.copy_from_slice(&be[be.len() - len..]);
    }
    encode_hex_spaced(&bytes)
}

/// Convert a string into the hex byte representation of its bytes, wrapped in
/// whitespace so it concatenates cleanly inside scripted responses.
///
/// ```
/// use ecusim_interfaces::util::ascii;
/// assert_eq!(ascii("Hello"), " 48 65 6C 6C 6F ");
/// ```
#[must_use]
pub fn ascii(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(text.len() * 3 + 1);
    for b in text.bytes() {
        out.push(' ');
        out.push_str(&format!("{b:02X}"));
    }
    out.push(' ');
    out
}

pub mod tokio_ext {
    #[macro_export]
    #[cfg(feature = "tokio-tracing")]
    macro_rules! spawn_named {
        ($name:expr, $future:expr) => {
            // see: https://docs.rs/tokio/latest/src/tokio/task/builder.rs.html#87-98
            // the function always returns Ok(...)
            tokio::task::Builder::new()
                .name($name)
                .spawn($future)
                .expect("unable to spawn task")
        };
    }
    #[macro_export]
    #[cfg(not(feature = "tokio-tracing"))]
    macro_rules! spawn_named {
        ($name:expr, $future:expr) => {{
            let _ = &$name; // ignore the name in non-tracing builds
            tokio::task::spawn($future)
        }};
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_separators_removes_full_set() {
        assert_eq!(strip_separators("22_F1.90, ;#\t42"), "22F19042");
        assert_eq!(strip_separators("FE F5 #01 02"), "FEF50102");
    }

    #[test]
    fn decode_hex_accepts_spaced_and_compact() {
        assert_eq!(decode_hex("22 F1 90").unwrap(), vec![0x22, 0xF1, 0x90]);
        assert_eq!(decode_hex("22f190").unwrap(), vec![0x22, 0xF1, 0x90]);
        assert_eq!(decode_hex("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn decode_hex_rejects_garbage() {
        assert!(decode_hex("2").is_err());
        assert!(decode_hex("2G").is_err());
        assert!(decode_hex("22 F").is_err());
    }

    #[test]
    fn encode_round_trip() {
        assert_eq!(encode_hex_spaced(&[0xDE, 0xAD, 0x01]), "DE AD 01");
        assert_eq!(encode_hex_spaced(&[]), "");
    }

    #[test]
    fn to_byte_response_pads_and_truncates() {
        assert_eq!(to_byte_response(13248, 2), "33 C0");
        assert_eq!(to_byte_response(13248, 3), "00 33 C0");
        assert_eq!(to_byte_response(13248, 1), "C0");
        assert_eq!(to_byte_response(13248, 4), "00 00 33 C0");
        assert_eq!(to_byte_response(0xF190, 6), "00 00 00 00 F1 90");
        assert_eq!(to_byte_response(1, 0), "");
    }

    #[test]
    fn ascii_wraps_in_whitespace() {
        assert_eq!(ascii("Hello"), " 48 65 6C 6C 6F ");
        assert_eq!(ascii(""), "");
    }
}
