//! M-Bus Link Constants
//!
//! Wire-format markers and link-layer limits, based on the EN 13757-2 frame
//! delimiting rules, plus the polling intervals used by the background loops.

use std::time::Duration;

/// Start marker of a short/control frame.
pub const FRAME_START_SHORT: u8 = 0x10;

/// Start marker of a long/data frame (appears twice in the header).
pub const FRAME_START_LONG: u8 = 0x68;

/// Stop marker terminating every frame.
pub const FRAME_STOP: u8 = 0x16;

/// Maximum content length the single-byte wire length field can carry.
pub const MAX_FRAME_CONTENT: usize = 250;

/// Total length of a short frame: start, content byte, checksum, stop.
pub const SHORT_FRAME_LENGTH: usize = 4;

/// Bytes a long frame adds around its content:
/// start, len, len, start, checksum, stop.
pub const LONG_FRAME_OVERHEAD: usize = 6;

/// Offset of the content bytes inside a long frame.
pub const LONG_FRAME_PAYLOAD_OFFSET: usize = 4;

/// Bounded wait of one event-loop iteration, so health and shutdown are
/// re-checked even with no I/O activity.
pub const EVENT_LOOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Tick interval of the timer loop.
pub const TIMER_TICK: Duration = Duration::from_secs(1);

/// Baud rates accepted for TTY devices.
pub const SUPPORTED_BAUD_RATES: [u32; 10] = [
    300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
];
