//! # Simulation Replay
//!
//! Replays recorded telegrams through a simulator device, so the whole
//! receive path (framing, dispatch, meter handlers) runs against canned
//! traffic instead of live hardware.
//!
//! Simulation files are line oriented. Lines starting with `telegram=`
//! carry hex-encoded wire bytes; `|` characters and whitespace inside the
//! hex are ignored so recordings can stay readable. A trailing `+<secs>`
//! schedules the telegram that many seconds after replay start; without it
//! the telegram is injected immediately. All other lines are comments.

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::error::BusError;
use crate::serial::{SerialDevice, SerialManager};
use crate::util::hex::decode_hex;

/// One scheduled telegram from a simulation file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedTelegram {
    /// Raw wire bytes to inject into the simulator device.
    pub wire: Vec<u8>,
    /// Seconds after replay start at which to inject.
    pub at_secs: u64,
}

/// Parse one simulation line. Returns `None` for comments and blank lines.
pub fn parse_simulation_line(line: &str) -> Result<Option<SimulatedTelegram>, BusError> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix("telegram=") else {
        return Ok(None);
    };

    let (hex_part, at_secs) = match rest.rsplit_once('+') {
        Some((hex, secs)) => {
            let secs = secs.trim().parse::<u64>().map_err(|_| {
                BusError::InvalidSimulationLine(line.to_string())
            })?;
            (hex, secs)
        }
        None => (rest, 0),
    };

    let cleaned: String = hex_part.chars().filter(|c| *c != '|').collect();
    let wire = decode_hex(&cleaned)
        .map_err(|_| BusError::InvalidSimulationLine(line.to_string()))?;
    if wire.is_empty() {
        return Err(BusError::InvalidSimulationLine(line.to_string()));
    }
    Ok(Some(SimulatedTelegram { wire, at_secs }))
}

/// Parse a whole simulation file's content.
pub fn parse_simulation(content: &str) -> Result<Vec<SimulatedTelegram>, BusError> {
    let mut telegrams = Vec::new();
    for line in content.lines() {
        if let Some(telegram) = parse_simulation_line(line)? {
            telegrams.push(telegram);
        }
    }
    Ok(telegrams)
}

/// Load and parse a simulation file.
pub fn load_simulation(path: &str) -> Result<Vec<SimulatedTelegram>, BusError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BusError::SerialPortError(format!("cannot read {path}: {e}")))?;
    parse_simulation(&content)
}

/// Inject the telegrams into `device` on their schedule, then stop the
/// manager. Returns early if the manager stops first.
pub async fn run_replay(
    manager: &Arc<SerialManager>,
    device: &Arc<SerialDevice>,
    telegrams: &[SimulatedTelegram],
) {
    let start = tokio::time::Instant::now();
    for telegram in telegrams {
        loop {
            if !manager.is_running() {
                return;
            }
            let elapsed = start.elapsed().as_secs();
            if elapsed >= telegram.at_secs {
                break;
            }
            let remaining = Duration::from_secs(telegram.at_secs - elapsed);
            tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
        }
        debug!(
            "(replay) injecting {} bytes at +{}s",
            telegram.wire.len(),
            telegram.at_secs
        );
        device.fill(&telegram.wire);
    }
    manager.stop();
}
