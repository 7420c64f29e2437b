//! # Bus Links
//!
//! A [`BusLink`] ties one [`SerialDevice`] to the framing protocol: it
//! drains received bytes into a [`FrameAssembler`], turns complete frames
//! into [`Telegram`]s and hands them to the registered handler. Outbound,
//! it wraps content bytes into wire frames and sends them on the device.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::BusError;
use crate::frame::{build_frame, AssembleResult, FrameAssembler, FrameStart};
use crate::serial::{SerialDevice, SerialManager};
use crate::util::hex::encode_hex;
use crate::util::throttle::LogThrottle;

/// How many protocol-error warnings to emit per minute and link before
/// switching to debug-only logging.
const ERROR_LOG_CAP: u32 = 5;

/// Kind of link a telegram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Wired M-Bus link.
    MBus,
    /// Wireless M-Bus link.
    WMBus,
    /// Simulated link used for replay and tests.
    Simulated,
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::MBus => write!(f, "mbus"),
            FrameKind::WMBus => write!(f, "wmbus"),
            FrameKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// Provenance of a telegram: which link produced it and of what kind.
#[derive(Debug, Clone)]
pub struct AboutTelegram {
    pub link: String,
    pub kind: FrameKind,
}

/// One decoded frame content, ready for the application layer.
#[derive(Debug, Clone)]
pub struct Telegram {
    pub about: AboutTelegram,
    pub payload: Vec<u8>,
}

pub type TelegramHandler = Box<dyn Fn(&Telegram) -> bool + Send + Sync>;

/// One device attached to the frame layer.
pub struct BusLink {
    alias: String,
    kind: FrameKind,
    device: Arc<SerialDevice>,
    assembler: Mutex<FrameAssembler>,
    handler: TelegramHandler,
    throttle: Mutex<LogThrottle>,
}

impl BusLink {
    /// Wrap a device. The handler returns true if it recognized the
    /// telegram; unrecognized telegrams are only logged.
    pub fn new<F>(alias: &str, kind: FrameKind, device: Arc<SerialDevice>, handler: F) -> Arc<Self>
    where
        F: Fn(&Telegram) -> bool + Send + Sync + 'static,
    {
        Arc::new(Self {
            alias: alias.to_string(),
            kind,
            device,
            assembler: Mutex::new(FrameAssembler::new()),
            handler: Box::new(handler),
            throttle: Mutex::new(LogThrottle::new(60_000, ERROR_LOG_CAP)),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn device(&self) -> &Arc<SerialDevice> {
        &self.device
    }

    /// Register this link's receive path as the device's data callback.
    pub fn attach(self: &Arc<Self>, manager: &SerialManager) {
        let link = Arc::clone(self);
        manager.listen_to(&self.device, move || link.process_serial_data());
    }

    /// Drain the device and dispatch every complete telegram.
    ///
    /// Runs on the manager's event loop. Frames are collected under the
    /// assembler lock and dispatched afterwards, so the handler can send
    /// on the same link without deadlocking.
    pub fn process_serial_data(&self) {
        let data = self.device.receive();
        let mut telegrams = Vec::new();
        {
            let mut assembler = self.assembler.lock().unwrap();
            assembler.append(&data);
            loop {
                match assembler.next_frame() {
                    AssembleResult::Pending => break,
                    AssembleResult::Frame(payload) => {
                        telegrams.push(Telegram {
                            about: AboutTelegram {
                                link: self.alias.clone(),
                                kind: self.kind,
                            },
                            payload,
                        });
                    }
                    AssembleResult::Error(discarded) => {
                        if self.throttle.lock().unwrap().allow() {
                            warn!("({}) protocol error, dropping {} bytes", self.alias, discarded.len());
                        }
                        debug!("({}) dropped \"{}\"", self.alias, encode_hex(&discarded));
                        break;
                    }
                }
            }
        }
        for telegram in telegrams {
            if !(self.handler)(&telegram) {
                debug!(
                    "({}) telegram not handled \"{}\"",
                    self.alias,
                    encode_hex(&telegram.payload)
                );
            }
        }
    }

    /// Frame `content` and send it on the device. Sending to a read-only
    /// device succeeds without writing, so replay setups run unmodified.
    pub async fn send_telegram(&self, start: FrameStart, content: &[u8]) -> Result<bool, BusError> {
        if self.device.readonly() {
            return Ok(true);
        }
        let wire = build_frame(start, content)?;
        Ok(self.device.send(&wire).await)
    }
}
