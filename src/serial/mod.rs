//! The serial module contains the event-driven link layer: managed
//! byte-stream devices (tty, subprocess, file, simulator), the manager that
//! runs their event and timer loops, and tty discovery.

pub mod device;
pub mod manager;
pub mod scan;
pub mod timer;

pub use device::{AccessResult, Parity, SerialDevice};
pub use manager::SerialManager;
pub use scan::list_serial_ttys;
pub use timer::Timer;
