//! # Serial Communication Manager
//!
//! Owns every [`SerialDevice`] and runs two background loops:
//!
//! - the **event loop** receives device-readiness events from the per-device
//!   read pumps and invokes the matching data callbacks, then sweeps for
//!   devices that stopped working (unplugged tty, exited subprocess) and
//!   evicts them;
//! - the **timer loop** ticks once per second and fires due [`Timer`]
//!   callbacks, and enforces the optional exit-after deadline.
//!
//! Both loops are spawned at construction but parked behind a start gate, so
//! devices and timers can be registered before any callback can fire.
//! `stop()` releases the gate as well, which lets a manager that was never
//! started shut down cleanly.
//!
//! No lock is ever held while a callback runs: the loops clone the callback
//! out under the lock and invoke it afterwards, so callbacks may freely call
//! back into the manager.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, trace};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::constants::{EVENT_LOOP_TIMEOUT, SUPPORTED_BAUD_RATES, TIMER_TICK};
use crate::error::BusError;
use crate::serial::device::{Parity, SerialDevice};
use crate::serial::scan;
use crate::serial::timer::{Timer, TimerCallback};

/// Capacity of the device-readiness event channel. Events carry only a
/// device id and duplicates are harmless, so a small buffer suffices.
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct SerialManager {
    running: AtomicBool,
    /// Operational mode: once set, losing the last device stops the manager.
    expect_devices_to_work: AtomicBool,

    devices: Mutex<Vec<Arc<SerialDevice>>>,
    timers: Mutex<Vec<Timer>>,
    next_device_id: AtomicU64,
    next_timer_id: AtomicU64,

    /// Wakes the event loop for bookkeeping (device added/closed, stop).
    wakeup: Notify,
    timer_wakeup: Notify,
    /// Start gate; both loops park here until `start()` or `stop()`.
    gate_tx: watch::Sender<bool>,
    events_tx: mpsc::Sender<u64>,

    event_task: Mutex<Option<JoinHandle<()>>>,
    timer_task: Mutex<Option<JoinHandle<()>>>,

    started_at: Instant,
    exit_after: Option<Duration>,
}

impl SerialManager {
    /// Create a manager and spawn its background loops. Must be called from
    /// within a tokio runtime. With `exit_after` set, the manager stops
    /// itself once that much time has passed since construction.
    pub fn new(exit_after: Option<Duration>) -> Arc<Self> {
        let (gate_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let manager = Arc::new(Self {
            running: AtomicBool::new(true),
            expect_devices_to_work: AtomicBool::new(false),
            devices: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            next_device_id: AtomicU64::new(1),
            next_timer_id: AtomicU64::new(1),
            wakeup: Notify::new(),
            timer_wakeup: Notify::new(),
            gate_tx,
            events_tx,
            event_task: Mutex::new(None),
            timer_task: Mutex::new(None),
            started_at: Instant::now(),
            exit_after,
        });

        let event_task = tokio::spawn(Arc::clone(&manager).run_event_loop(events_rx));
        let timer_task = tokio::spawn(Arc::clone(&manager).run_timer_loop());
        *manager.event_task.lock().unwrap() = Some(event_task);
        *manager.timer_task.lock().unwrap() = Some(timer_task);

        manager
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Release the start gate; callbacks and timers begin firing.
    pub fn start(&self) {
        debug!("(serial) manager started");
        self.gate_tx.send_replace(true);
    }

    /// Stop the manager. Idempotent and callable from any thread or
    /// callback; both loops observe the flag and exit.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("(serial) manager stopping");
            // Open the gate too so loops parked before start() can exit.
            self.gate_tx.send_replace(true);
            self.wakeup.notify_one();
            self.timer_wakeup.notify_one();
        }
    }

    /// Enter operational mode: from now on, losing the last working device
    /// stops the manager instead of idling without devices.
    pub fn expect_devices_to_work(&self) {
        debug!("(serial) expecting devices to work from now on");
        self.expect_devices_to_work.store(true, Ordering::SeqCst);
    }

    /// Block until the manager has stopped and both loops have terminated.
    /// Returns immediately-ish if all devices are already gone.
    pub async fn wait_for_stop(&self) {
        loop {
            if !self.is_running() {
                break;
            }
            if self.devices.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        self.stop();
        self.close_all();

        let event_task = self.event_task.lock().unwrap().take();
        if let Some(handle) = event_task {
            let _ = handle.await;
        }
        let timer_task = self.timer_task.lock().unwrap().take();
        if let Some(handle) = timer_task {
            let _ = handle.await;
        }
        self.remove_non_working_devices();
        debug!("(serial) manager stopped");
    }

    /// Close every device without removing it from management.
    fn close_all(&self) {
        let devices: Vec<Arc<SerialDevice>> = self.devices.lock().unwrap().clone();
        for device in devices {
            device.close();
        }
    }

    fn next_device_id(&self) -> u64 {
        self.next_device_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Create and register a tty device. The baud rate must be one of the
    /// standard rates between 300 and 115200.
    pub fn create_tty(
        self: &Arc<Self>,
        path: &str,
        baud_rate: u32,
        parity: Parity,
        purpose: &str,
    ) -> Result<Arc<SerialDevice>, BusError> {
        if !SUPPORTED_BAUD_RATES.contains(&baud_rate) {
            return Err(BusError::UnsupportedBaudRate(baud_rate));
        }
        let device = SerialDevice::new_tty(
            self.next_device_id(),
            path,
            baud_rate,
            parity,
            purpose,
            Arc::downgrade(self),
            self.events_tx.clone(),
        );
        self.register(Arc::clone(&device));
        Ok(device)
    }

    /// Create and register a device that reads the stdout of a subprocess
    /// and writes to its stdin.
    pub fn create_command(
        self: &Arc<Self>,
        identifier: &str,
        command: &str,
        args: Vec<String>,
        envs: Vec<(String, String)>,
        purpose: &str,
    ) -> Arc<SerialDevice> {
        let device = SerialDevice::new_command(
            self.next_device_id(),
            identifier,
            command,
            args,
            envs,
            purpose,
            Arc::downgrade(self),
            self.events_tx.clone(),
        );
        self.register(Arc::clone(&device));
        device
    }

    /// Create and register a read-only device backed by a file, or by
    /// standard input when `path` is `"stdin"`.
    pub fn create_file(self: &Arc<Self>, path: &str, purpose: &str) -> Arc<SerialDevice> {
        let device = SerialDevice::new_file(
            self.next_device_id(),
            path,
            purpose,
            Arc::downgrade(self),
            self.events_tx.clone(),
        );
        self.register(Arc::clone(&device));
        device
    }

    /// Create and register an in-memory simulator device for tests and
    /// replay. It never opens a real transport and is invisible to the
    /// event loop's health sweep.
    pub fn create_simulator(self: &Arc<Self>, purpose: &str) -> Arc<SerialDevice> {
        let device = SerialDevice::new_simulator(
            self.next_device_id(),
            purpose,
            Arc::downgrade(self),
            self.events_tx.clone(),
        );
        self.register(Arc::clone(&device));
        device
    }

    fn register(&self, device: Arc<SerialDevice>) {
        trace!("(serial) managing {} ({})", device.device(), device.purpose());
        self.devices.lock().unwrap().push(device);
        self.tickle_event_loop();
    }

    /// Install the data callback invoked by the event loop whenever the
    /// device has bytes pending.
    pub fn listen_to<F>(&self, device: &Arc<SerialDevice>, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        device.set_data_callback(Arc::new(callback));
        self.tickle_event_loop();
    }

    /// Install the disappear callback, fired once when the device closes
    /// for good (not during a reset).
    pub fn on_disappear<F>(&self, device: &Arc<SerialDevice>, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        device.set_disappear_callback(Box::new(callback));
    }

    /// Find a managed device by its identity string (tty path, command
    /// identifier, file path, or `"simulator"`).
    pub fn lookup(&self, identity: &str) -> Option<Arc<SerialDevice>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.device() == identity)
            .cloned()
    }

    /// Evict one non-working device by identity. Returns false when no
    /// such device is managed or it is still working.
    pub fn remove_non_working(&self, identity: &str) -> bool {
        let evicted = {
            let mut devices = self.devices.lock().unwrap();
            let mut evicted = None;
            devices.retain(|d| {
                if d.device() == identity && !d.working() {
                    evicted = Some(Arc::clone(d));
                    false
                } else {
                    true
                }
            });
            evicted
        };
        match evicted {
            Some(device) => {
                debug!("(serial) evicting {}", device.device());
                device.close();
                if self.devices.lock().unwrap().is_empty()
                    && self.expect_devices_to_work.load(Ordering::SeqCst)
                {
                    self.stop();
                }
                true
            }
            None => false,
        }
    }

    /// Evict devices that were opened but no longer work. In operational
    /// mode, evicting the last device stops the manager.
    pub fn remove_non_working_devices(&self) {
        let now_empty = {
            let mut devices = self.devices.lock().unwrap();
            devices.retain(|d| !(d.opened() && !d.working()));
            devices.is_empty()
        };
        if now_empty && self.expect_devices_to_work.load(Ordering::SeqCst) {
            debug!("(serial) no devices working");
            self.stop();
        }
    }

    /// Register a periodic callback. Returns the timer id; ids are unique
    /// for the lifetime of the manager and never reused.
    pub fn start_regular_callback<F>(&self, name: &str, period_secs: u64, callback: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_timer_id.fetch_add(1, Ordering::SeqCst);
        debug!("(serial) added timer {id} \"{name}\" period {period_secs}s");
        self.timers
            .lock()
            .unwrap()
            .push(Timer::new(id, name, period_secs, Arc::new(callback)));
        self.timer_wakeup.notify_one();
        id
    }

    /// Remove a timer by id. Unknown ids are ignored.
    pub fn stop_regular_callback(&self, id: u64) {
        self.timers.lock().unwrap().retain(|t| t.id() != id);
    }

    /// List serial tty device nodes present on this machine.
    pub fn list_serial_ttys(&self) -> Vec<String> {
        scan::list_serial_ttys()
    }

    /// Nudge the event loop so it re-examines device state promptly.
    pub(crate) fn tickle_event_loop(&self) {
        self.wakeup.notify_one();
    }

    async fn wait_for_gate(&self, gate: &mut watch::Receiver<bool>) -> bool {
        while !*gate.borrow() {
            if gate.changed().await.is_err() {
                return false;
            }
        }
        true
    }

    async fn run_event_loop(self: Arc<Self>, mut events: mpsc::Receiver<u64>) {
        let mut gate = self.gate_tx.subscribe();
        if !self.wait_for_gate(&mut gate).await {
            return;
        }
        trace!("(serial) event loop running");

        while self.is_running() {
            let event = tokio::select! {
                ev = events.recv() => ev,
                _ = self.wakeup.notified() => None,
                _ = tokio::time::sleep(EVENT_LOOP_TIMEOUT) => None,
            };
            if !self.is_running() {
                break;
            }

            if let Some(id) = event {
                let callback = {
                    let devices = self.devices.lock().unwrap();
                    devices.iter().find(|d| d.id() == id).and_then(|d| {
                        if d.opened()
                            && d.working()
                            && !d.resetting()
                            && !d.skipping_callbacks()
                        {
                            d.data_callback()
                        } else {
                            None
                        }
                    })
                };
                if let Some(callback) = callback {
                    callback();
                }
            }

            // Health sweep: close anything opened but no longer working,
            // then evict it. Resetting devices count as working.
            let broken: Vec<Arc<SerialDevice>> = {
                let devices = self.devices.lock().unwrap();
                devices
                    .iter()
                    .filter(|d| d.opened() && !d.working())
                    .cloned()
                    .collect()
            };
            if !broken.is_empty() {
                for device in broken {
                    debug!("(serial) device {} stopped working", device.device());
                    device.close();
                }
                self.remove_non_working_devices();
                // Operational mode treats any unhealthy device as fatal,
                // not just the loss of the last one.
                if self.expect_devices_to_work.load(Ordering::SeqCst) {
                    self.stop();
                }
            }
        }
        trace!("(serial) event loop done");
    }

    async fn run_timer_loop(self: Arc<Self>) {
        let mut gate = self.gate_tx.subscribe();
        if !self.wait_for_gate(&mut gate).await {
            return;
        }
        trace!("(serial) timer loop running");

        while self.is_running() {
            tokio::select! {
                _ = tokio::time::sleep(TIMER_TICK) => {}
                _ = self.timer_wakeup.notified() => {}
            }
            if !self.is_running() {
                break;
            }

            if let Some(limit) = self.exit_after {
                if self.started_at.elapsed() > limit {
                    info!("(serial) exit timeout reached, stopping");
                    self.stop();
                    break;
                }
            }
            self.execute_timer_callbacks();
        }
        trace!("(serial) timer loop done");
    }

    fn execute_timer_callbacks(&self) {
        let now = Instant::now();
        let due: Vec<(String, TimerCallback)> = {
            let mut timers = self.timers.lock().unwrap();
            timers
                .iter_mut()
                .filter(|t| t.is_due(now))
                .map(|t| (t.name().to_string(), t.fired(now)))
                .collect()
        };
        for (name, callback) in due {
            trace!("(serial) timer \"{name}\" fires");
            callback();
        }
    }
}
