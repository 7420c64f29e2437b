//! Rate limiting for repetitive log messages.
//!
//! A meter stuck behind a noisy line can produce a protocol error on every
//! received chunk; throttling keeps the diagnostics readable without
//! dropping the first occurrences.

use std::time::Instant;

/// Throttling structure for rate-limiting log messages.
#[derive(Debug)]
pub struct LogThrottle {
    /// Time window for throttling (in milliseconds)
    window_ms: u64,
    /// Maximum messages allowed per window
    cap: u32,
    /// Current message count in window
    count: u32,
    /// Start time of current window
    t0: Instant,
}

impl LogThrottle {
    /// Create a new throttle allowing `cap` messages per `window_ms` window.
    pub fn new(window_ms: u64, cap: u32) -> Self {
        Self {
            window_ms,
            cap,
            count: 0,
            t0: Instant::now(),
        }
    }

    /// Returns `true` if the message should be logged, `false` if it should
    /// be suppressed. The counter resets once the window expires.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.t0).as_millis() as u64 > self.window_ms {
            self.t0 = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= self.cap
    }
}
