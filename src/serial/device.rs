//! # Byte-Stream Devices
//!
//! A [`SerialDevice`] can be connected to a tty with a baud rate, but can
//! also be connected to stdin, a file, the output of a subprocess, or an
//! in-memory simulator. All four kinds expose the same capability set; the
//! event loop treats them uniformly.
//!
//! Reads are pumped by a per-device tokio task spawned on a successful
//! `open`: it awaits transport readability, appends received bytes to the
//! device's pending buffer, and posts a readiness event to the manager's
//! event loop. `receive()` then drains the pending buffer synchronously, so
//! data callbacks never block on I/O.
//!
//! The pending buffer (read path) and the writer half (write path) are
//! guarded by independent locks: a stalled `send` never delays a concurrent
//! `receive`, and `close` is safe and idempotent from any thread.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};
use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_serial::SerialPortBuilderExt;

use crate::error::BusError;
use crate::serial::manager::SerialManager;
use crate::util::hex::{encode_hex, safe_string};

/// Parity setting for TTY devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl FromStr for Parity {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Parity::None),
            "even" => Ok(Parity::Even),
            "odd" => Ok(Parity::Odd),
            other => Err(BusError::UnknownParity(other.to_string())),
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(p: Parity) -> Self {
        match p {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Typed outcome of a device `open` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessResult {
    /// Device opened and is ready for use.
    Ok,
    /// The device node or file does not exist.
    Absent,
    /// Another process holds the device exclusively.
    Locked,
    /// The device exists but permission was denied.
    Denied,
}

/// Handle lifecycle, mirroring the fd sentinels of classic serial code:
/// not yet opened, explicitly closed / no longer working, or live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    NotOpened,
    Closed,
    Open,
}

/// The closed set of transport kinds behind the shared capability set.
#[derive(Debug, Clone)]
enum DeviceKind {
    Tty {
        path: String,
        baud_rate: u32,
        parity: Parity,
    },
    Command {
        identifier: String,
        command: String,
        args: Vec<String>,
        envs: Vec<(String, String)>,
    },
    File {
        path: String,
    },
    Simulator,
}

/// Writable half of an opened transport.
enum DeviceWriter {
    Serial(tokio::io::WriteHalf<tokio_serial::SerialStream>),
    Child(tokio::process::ChildStdin),
}

impl DeviceWriter {
    async fn write_all_flush(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            DeviceWriter::Serial(w) => {
                w.write_all(data).await?;
                w.flush().await
            }
            DeviceWriter::Child(w) => {
                w.write_all(data).await?;
                w.flush().await
            }
        }
    }
}

pub type DataCallback = Arc<dyn Fn() + Send + Sync>;
pub type DisappearCallback = Box<dyn Fn() + Send + Sync>;

/// One byte-stream source managed by the [`SerialManager`].
pub struct SerialDevice {
    id: u64,
    kind: DeviceKind,
    purpose: String,
    manager: Weak<SerialManager>,
    /// Posts this device's id to the event loop when bytes arrive.
    events: mpsc::Sender<u64>,

    state: Mutex<HandleState>,
    resetting: AtomicBool,
    no_callbacks: AtomicBool,
    expecting_ascii: AtomicBool,
    /// Set by the pump once the transport hit end-of-stream or a permanent
    /// error; `receive` closes the device after draining the leftovers.
    eof: AtomicBool,

    /// Read path: bytes received but not yet consumed by `receive`.
    pending: Mutex<BytesMut>,
    /// Write path, independent of the read path. Taken out for the duration
    /// of a `send` so the guard is never held across an await; the device
    /// contract allows at most one concurrent writer.
    writer: Mutex<Option<DeviceWriter>>,
    child: Mutex<Option<tokio::process::Child>>,
    /// Wakes the pump task so it can observe the closed state.
    close_notify: Notify,

    on_data: Mutex<Option<DataCallback>>,
    on_disappear: Mutex<Option<DisappearCallback>>,
}

impl SerialDevice {
    fn new(
        id: u64,
        kind: DeviceKind,
        purpose: &str,
        manager: Weak<SerialManager>,
        events: mpsc::Sender<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            purpose: purpose.to_string(),
            manager,
            events,
            state: Mutex::new(HandleState::NotOpened),
            resetting: AtomicBool::new(false),
            no_callbacks: AtomicBool::new(false),
            expecting_ascii: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            pending: Mutex::new(BytesMut::new()),
            writer: Mutex::new(None),
            child: Mutex::new(None),
            close_notify: Notify::new(),
            on_data: Mutex::new(None),
            on_disappear: Mutex::new(None),
        })
    }

    pub(crate) fn new_tty(
        id: u64,
        path: &str,
        baud_rate: u32,
        parity: Parity,
        purpose: &str,
        manager: Weak<SerialManager>,
        events: mpsc::Sender<u64>,
    ) -> Arc<Self> {
        Self::new(
            id,
            DeviceKind::Tty {
                path: path.to_string(),
                baud_rate,
                parity,
            },
            purpose,
            manager,
            events,
        )
    }

    pub(crate) fn new_command(
        id: u64,
        identifier: &str,
        command: &str,
        args: Vec<String>,
        envs: Vec<(String, String)>,
        purpose: &str,
        manager: Weak<SerialManager>,
        events: mpsc::Sender<u64>,
    ) -> Arc<Self> {
        Self::new(
            id,
            DeviceKind::Command {
                identifier: identifier.to_string(),
                command: command.to_string(),
                args,
                envs,
            },
            purpose,
            manager,
            events,
        )
    }

    pub(crate) fn new_file(
        id: u64,
        path: &str,
        purpose: &str,
        manager: Weak<SerialManager>,
        events: mpsc::Sender<u64>,
    ) -> Arc<Self> {
        Self::new(id, DeviceKind::File { path: path.to_string() }, purpose, manager, events)
    }

    pub(crate) fn new_simulator(
        id: u64,
        purpose: &str,
        manager: Weak<SerialManager>,
        events: mpsc::Sender<u64>,
    ) -> Arc<Self> {
        Self::new(id, DeviceKind::Simulator, purpose, manager, events)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Underlying device identity as a string: tty path, command
    /// identifier, file path, or `"simulator"`.
    pub fn device(&self) -> String {
        match &self.kind {
            DeviceKind::Tty { path, .. } => path.clone(),
            DeviceKind::Command { identifier, .. } => identifier.clone(),
            DeviceKind::File { path } => path.clone(),
            DeviceKind::Simulator => "simulator".to_string(),
        }
    }

    /// Purpose label given at creation, used in log lines.
    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    fn is_open(&self) -> bool {
        *self.state.lock().unwrap() == HandleState::Open
    }

    /// True once `open` has been attempted, even after a later close. The
    /// simulator never reports opened, which keeps it invisible to the
    /// event loop's wait-set and reaper.
    pub fn opened(&self) -> bool {
        self.resetting() || *self.state.lock().unwrap() != HandleState::NotOpened
    }

    /// Explicitly closed and not in a reset window.
    pub fn is_closed(&self) -> bool {
        *self.state.lock().unwrap() == HandleState::Closed && !self.resetting()
    }

    pub fn resetting(&self) -> bool {
        self.resetting.load(Ordering::SeqCst)
    }

    /// A resetting device is working even while its handle is invalid, so a
    /// reset never looks like a disappearance.
    pub fn working(&self) -> bool {
        if self.resetting() {
            return true;
        }
        match &self.kind {
            // One injected message that has already been handled, so never
            // report the simulator as a live device.
            DeviceKind::Simulator => false,
            DeviceKind::Tty { path, .. } => self.is_open() && char_device_exists(path),
            DeviceKind::Command { .. } => {
                if !self.is_open() {
                    return false;
                }
                // Data still buffered counts as working even if the child
                // already exited.
                if !self.pending.lock().unwrap().is_empty() {
                    return true;
                }
                // The pump reports end-of-stream only once the pipe is fully
                // drained, so an exited child whose output is still in
                // flight keeps the device alive.
                !self.eof.load(Ordering::SeqCst)
            }
            // Still open, so keep using it; end-of-file closes the device
            // from the receive path instead of flipping health.
            DeviceKind::File { .. } => self.is_open(),
        }
    }

    /// Sending is meaningless for file and simulator sources; they accept
    /// a send as a successful no-op so replay workflows run unmodified.
    pub fn readonly(&self) -> bool {
        matches!(self.kind, DeviceKind::File { .. } | DeviceKind::Simulator)
    }

    /// Mark this device so that it is ignored by the event loop.
    pub fn disable_callbacks(&self) {
        self.no_callbacks.store(true, Ordering::SeqCst);
    }

    /// Re-enable event loop callbacks for this device.
    pub fn enable_callbacks(&self) {
        self.no_callbacks.store(false, Ordering::SeqCst);
    }

    pub fn skipping_callbacks(&self) -> bool {
        self.no_callbacks.load(Ordering::SeqCst)
    }

    pub fn reset_initiated(&self) {
        debug!("(serial) initiate reset");
        self.resetting.store(true, Ordering::SeqCst);
    }

    pub fn reset_completed(&self) {
        debug!("(serial) reset completed");
        self.resetting.store(false, Ordering::SeqCst);
    }

    /// True if received bytes are waiting to be drained by `receive`.
    pub fn check_if_data_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    pub(crate) fn set_data_callback(&self, cb: DataCallback) {
        *self.on_data.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_disappear_callback(&self, cb: DisappearCallback) {
        *self.on_disappear.lock().unwrap() = Some(cb);
    }

    pub(crate) fn data_callback(&self) -> Option<DataCallback> {
        self.on_data.lock().unwrap().clone()
    }

    /// Open the underlying transport.
    ///
    /// With `fail_if_not_ok` set, access problems come back as hard
    /// [`BusError`]s; otherwise they are reported as an [`AccessResult`]
    /// and the caller decides between fail-fast and retry-later.
    pub async fn open(self: &Arc<Self>, fail_if_not_ok: bool) -> Result<AccessResult, BusError> {
        let result = match self.kind.clone() {
            DeviceKind::Tty {
                path,
                baud_rate,
                parity,
            } => self.open_tty(&path, baud_rate, parity).await,
            DeviceKind::Command {
                identifier,
                command,
                args,
                envs,
            } => self.open_command(&identifier, &command, &args, &envs),
            DeviceKind::File { path } => self.open_file(&path).await,
            DeviceKind::Simulator => {
                debug!("(serialsimulator) opened ({})", self.purpose);
                Ok(AccessResult::Ok)
            }
        }?;

        if fail_if_not_ok && result != AccessResult::Ok {
            let device = self.device();
            return Err(match result {
                AccessResult::Absent => BusError::DeviceAbsent(device),
                AccessResult::Locked => BusError::DeviceLocked(device),
                _ => BusError::AccessDenied(device),
            });
        }
        Ok(result)
    }

    async fn open_tty(
        self: &Arc<Self>,
        path: &str,
        baud_rate: u32,
        parity: Parity,
    ) -> Result<AccessResult, BusError> {
        if !char_device_exists(path) {
            return Ok(AccessResult::Absent);
        }

        let builder = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(parity.into())
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(std::time::Duration::from_millis(100));

        let mut port = match builder.open_native_async() {
            Ok(port) => port,
            Err(e) => {
                return Ok(match e.kind() {
                    tokio_serial::ErrorKind::NoDevice => AccessResult::Absent,
                    tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                        AccessResult::Absent
                    }
                    tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                        AccessResult::Denied
                    }
                    _ => AccessResult::Locked,
                });
            }
        };

        // Claim the port so two readers cannot share it; failing here means
        // another process got there first.
        #[cfg(unix)]
        if port.set_exclusive(true).is_err() {
            return Ok(AccessResult::Locked);
        }

        let (reader, writer) = tokio::io::split(port);
        *self.writer.lock().unwrap() = Some(DeviceWriter::Serial(writer));
        *self.state.lock().unwrap() = HandleState::Open;
        self.spawn_pump(Box::new(reader));

        debug!(
            "(serialtty) opened {path} at {baud_rate} bps ({})",
            self.purpose
        );
        Ok(AccessResult::Ok)
    }

    fn open_command(
        self: &Arc<Self>,
        identifier: &str,
        command: &str,
        args: &[String],
        envs: &[(String, String)],
    ) -> Result<AccessResult, BusError> {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .args(args)
            .envs(envs.iter().cloned())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("(serialcmd) failed to spawn \"{command}\": {e}");
                return Ok(AccessResult::Absent);
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BusError::SerialPortError("subprocess stdout missing".into()))?;
        if let Some(stdin) = child.stdin.take() {
            *self.writer.lock().unwrap() = Some(DeviceWriter::Child(stdin));
        }

        let pid = child.id();
        *self.child.lock().unwrap() = Some(child);
        self.expecting_ascii.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = HandleState::Open;
        self.spawn_pump(Box::new(stdout));

        debug!(
            "(serialcmd) opened {identifier} pid {pid:?} ({})",
            self.purpose
        );
        Ok(AccessResult::Ok)
    }

    async fn open_file(self: &Arc<Self>, path: &str) -> Result<AccessResult, BusError> {
        if path == "stdin" {
            *self.state.lock().unwrap() = HandleState::Open;
            self.spawn_pump(Box::new(tokio::io::stdin()));
            debug!("(serialfile) reading from stdin ({})", self.purpose);
        } else {
            let file = match tokio::fs::File::open(path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(AccessResult::Absent);
                }
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Ok(AccessResult::Denied);
                }
                Err(e) => return Err(BusError::SerialPortError(e.to_string())),
            };
            *self.state.lock().unwrap() = HandleState::Open;
            self.spawn_pump(Box::new(file));
            debug!("(serialfile) reading from file {path} ({})", self.purpose);
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.tickle_event_loop();
        }
        Ok(AccessResult::Ok)
    }

    /// Background read pump: transfers bytes from the transport into the
    /// pending buffer and posts readiness events until close or EOF.
    fn spawn_pump(self: &Arc<Self>, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
        let dev = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                if !dev.is_open() {
                    break;
                }
                tokio::select! {
                    _ = dev.close_notify.notified() => break,
                    res = reader.read(&mut buf) => match res {
                        Ok(0) => {
                            trace!("(serial) end of stream on {}", dev.device());
                            dev.eof.store(true, Ordering::SeqCst);
                            let _ = dev.events.send(dev.id).await;
                            break;
                        }
                        Ok(n) => {
                            dev.pending.lock().unwrap().extend_from_slice(&buf[..n]);
                            let _ = dev.events.send(dev.id).await;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!("(serial) read error on {}: {e}", dev.device());
                            dev.eof.store(true, Ordering::SeqCst);
                            let _ = dev.events.send(dev.id).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Drain every byte received so far. Returns an empty vector when
    /// nothing is pending; transient conditions never surface as errors.
    /// Once the transport reported end-of-stream and the buffer is empty,
    /// the device closes itself.
    pub fn receive(&self) -> Vec<u8> {
        let data = {
            let mut pending = self.pending.lock().unwrap();
            let len = pending.len();
            pending.split_to(len).to_vec()
        };

        if log::log_enabled!(log::Level::Debug) && !data.is_empty() {
            if self.expecting_ascii.load(Ordering::SeqCst) {
                debug!("(serial) received ascii \"{}\"", safe_string(&data));
            } else {
                debug!("(serial) received binary \"{}\"", encode_hex(&data));
            }
        }

        if self.eof.load(Ordering::SeqCst) && self.pending.lock().unwrap().is_empty() {
            self.close();
        }

        data
    }

    /// Drain buffered input until a chunk ends with the desired byte.
    /// Returns false once no further bytes can be read.
    pub fn wait_for(&self, c: u8) -> bool {
        loop {
            let data = self.receive();
            match data.last() {
                None => return false,
                Some(&last) if last == c => return true,
                Some(_) => continue,
            }
        }
    }

    /// Write all bytes to the transport. Returns true only if everything
    /// was written; read-only devices report success without writing.
    pub async fn send(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            warn!("(serial) rejected zero-length send to {}", self.device());
            return false;
        }
        if self.readonly() {
            return true;
        }

        let mut writer = match self.writer.lock().unwrap().take() {
            Some(writer) => writer,
            None => return false,
        };

        let result = writer.write_all_flush(data).await;

        // Hand the writer back unless the device closed underneath us, in
        // which case dropping it releases the transport.
        if self.is_open() {
            *self.writer.lock().unwrap() = Some(writer);
        }

        match result {
            Ok(()) => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("(serial {}) sent \"{}\"", self.device(), encode_hex(data));
                }
                true
            }
            Err(e) => {
                debug!("(serial {}) failed to send: {e}", self.device());
                false
            }
        }
    }

    /// Inject bytes into a simulator device and synchronously trigger its
    /// data callback. No-op for real transports.
    pub fn fill(&self, data: &[u8]) {
        if !matches!(self.kind, DeviceKind::Simulator) {
            return;
        }
        self.pending.lock().unwrap().extend_from_slice(data);
        if let Some(cb) = self.data_callback() {
            cb();
        }
    }

    /// Close the device. Idempotent and callable from any thread; fires the
    /// disappear callback unless a reset is in progress.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != HandleState::Open {
                return;
            }
            *state = HandleState::Closed;
        }

        self.close_notify.notify_one();
        self.writer.lock().unwrap().take();
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.start_kill();
        }
        // Callbacks go away with the handle; drop the data callback so a
        // closed device cannot be re-triggered.
        self.on_data.lock().unwrap().take();

        let on_disappear = if self.resetting() {
            None
        } else {
            self.on_disappear.lock().unwrap().take()
        };
        if let Some(cb) = on_disappear {
            cb();
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.tickle_event_loop();
        }

        debug!("(serial) closed {} ({})", self.device(), self.purpose);
    }
}

impl Drop for SerialDevice {
    fn drop(&mut self) {
        if self.is_open() {
            self.close();
        }
    }
}

#[cfg(unix)]
fn char_device_exists(path: &str) -> bool {
    use std::os::unix::fs::FileTypeExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.file_type().is_char_device(),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn char_device_exists(path: &str) -> bool {
    std::path::Path::new(path).exists()
}
