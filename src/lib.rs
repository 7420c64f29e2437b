//! # mbus-link: M-Bus Link Layer for Rust
//!
//! An event-driven serial link layer and frame codec for M-Bus utility
//! meter telegrams. The crate manages byte-stream devices of several kinds
//! behind one capability set, reassembles the M-Bus wire framing out of
//! arbitrarily chunked input, and dispatches complete telegrams to
//! application handlers.
//!
//! ## Features
//!
//! - **Device management**: ttys with exclusive locking, subprocess pipes,
//!   files/stdin and in-memory simulators, all supervised by one
//!   [`SerialManager`](serial::SerialManager) with health-based eviction
//! - **Frame assembly**: incremental recognition of short and long M-Bus
//!   frames with checksum validation, tolerant of partial reads
//! - **Timers**: coarse periodic callbacks for polling schedules
//! - **Replay**: simulation files drive the full receive path with
//!   recorded traffic
//!
//! ## Quick Start
//!
//! ```no_run
//! use mbus_link::bus::{BusLink, FrameKind};
//! use mbus_link::serial::{Parity, SerialManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mbus_link::error::BusError> {
//!     let manager = SerialManager::new(None);
//!     let device = manager.create_tty("/dev/ttyUSB0", 2400, Parity::Even, "heat meter")?;
//!     device.open(true).await?;
//!
//!     let link = BusLink::new("main", FrameKind::MBus, device, |telegram| {
//!         println!("telegram: {} bytes from {}", telegram.payload.len(), telegram.about.link);
//!         true
//!     });
//!     link.attach(&manager);
//!
//!     manager.expect_devices_to_work();
//!     manager.start();
//!     manager.wait_for_stop().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod constants;
pub mod error;
pub mod frame;
pub mod logging;
pub mod replay;
pub mod serial;
pub mod util;

pub use bus::{AboutTelegram, BusLink, FrameKind, Telegram};
pub use error::BusError;
pub use frame::{build_frame, check_frame, FrameAssembler, FrameStart, FrameStatus};
pub use serial::{AccessResult, Parity, SerialDevice, SerialManager};
