//! # M-Bus Link Error Handling
//!
//! This module defines the BusError enum, which represents the different error
//! types that can occur in the mbus-link crate.

use thiserror::Error;

/// Represents the different error types that can occur in the link layer.
#[derive(Debug, Error)]
pub enum BusError {
    /// Indicates an error related to the serial port communication.
    #[error("Serial port error: {0}")]
    SerialPortError(String),

    /// The device node does not exist (unplugged, never present, or a typo).
    #[error("Device absent: {0}")]
    DeviceAbsent(String),

    /// The device exists but is exclusively claimed by another process.
    #[error("Device locked by another process: {0}")]
    DeviceLocked(String),

    /// The device exists but we lack permission to open it.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A baud rate outside the supported M-Bus set was requested.
    #[error("Unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    /// A parity string other than none/even/odd was given.
    #[error("Unknown parity: {0}")]
    UnknownParity(String),

    /// Frame content exceeds the wire length field limit.
    #[error("Frame content too long: {0} bytes (max 250)")]
    ContentTooLong(usize),

    /// Indicates an error when building an outbound frame.
    #[error("Error encoding frame: {0}")]
    FrameEncodeError(String),

    /// Indicates an invalid hexadecimal string was provided.
    #[error("Invalid hexadecimal string")]
    InvalidHexString,

    /// A simulation script line could not be parsed.
    #[error("Invalid simulation line: {0}")]
    InvalidSimulationLine(String),

    /// A catch-all error for uncategorized cases.
    #[error("Other error: {0}")]
    Other(String),
}
