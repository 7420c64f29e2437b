//! # Utility Modules
//!
//! Small helpers shared by the link layer: hex rendering for protocol
//! diagnostics and a rate limiter for repetitive log messages.

pub mod hex;
pub mod throttle;

pub use hex::{decode_hex, encode_hex, format_hex_compact, hex_to_bytes, safe_string};
pub use throttle::LogThrottle;
