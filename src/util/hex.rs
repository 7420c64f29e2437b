//! # Hex Encoding/Decoding Utilities
//!
//! Received and sent byte runs are rendered in hex (or as guarded ASCII for
//! subprocess output) whenever debug logging is enabled, and simulation
//! scripts carry their telegrams as hex strings. These helpers wrap the
//! `hex` crate with the lenient whitespace handling both uses need.

use crate::error::BusError;

/// Encode bytes to a lowercase hex string.
///
/// This is the primary rendering used for wire-level diagnostics.
pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decode a hex string to bytes.
///
/// Accepts both cases; whitespace is stripped. An empty string decodes to an
/// empty byte vector (simulation scripts may carry empty telegrams).
pub fn decode_hex(hex_str: &str) -> Result<Vec<u8>, BusError> {
    let cleaned: String = hex_str.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&cleaned).map_err(|_| BusError::InvalidHexString)
}

/// Format bytes as "10 7b 7b 16" with spaces between bytes (log friendly).
pub fn format_hex_compact(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render bytes as a printable ASCII string, replacing control and non-ASCII
/// bytes with '.'. Used for devices expecting ascii output (subprocesses).
pub fn safe_string(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Helper for creating test data from hex strings.
///
/// Panics on invalid hex (intended for test code only).
pub fn hex_to_bytes(hex: &str) -> Vec<u8> {
    decode_hex(hex).expect("Invalid hex in test data")
}
