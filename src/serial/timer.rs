//! Periodic callbacks driven by the manager's timer loop.
//!
//! Timers are coarse: the loop ticks once per second, checks which timers
//! are due, and runs their callbacks. The fire time is recorded before the
//! callback executes so a slow callback does not shift the schedule.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// One registered periodic callback.
pub struct Timer {
    id: u64,
    name: String,
    period: Duration,
    last_fire: Instant,
    callback: TimerCallback,
}

impl Timer {
    pub(crate) fn new(id: u64, name: &str, period_secs: u64, callback: TimerCallback) -> Self {
        Self {
            id,
            name: name.to_string(),
            period: Duration::from_secs(period_secs),
            last_fire: Instant::now(),
            callback,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.last_fire + self.period <= now
    }

    /// Record the fire time, then hand out the callback for invocation
    /// outside the timer list lock.
    pub(crate) fn fired(&mut self, now: Instant) -> TimerCallback {
        self.last_fire = now;
        Arc::clone(&self.callback)
    }
}
