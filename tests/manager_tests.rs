use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mbus_link::bus::{BusLink, FrameKind, Telegram};
use mbus_link::error::BusError;
use mbus_link::serial::{AccessResult, Parity, SerialManager};
use mbus_link::util::hex::hex_to_bytes;

fn collecting_handler() -> (
    Arc<Mutex<Vec<Vec<u8>>>>,
    impl Fn(&Telegram) -> bool + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = move |t: &Telegram| {
        sink.lock().unwrap().push(t.payload.clone());
        true
    };
    (seen, handler)
}

#[tokio::test]
async fn test_unsupported_baud_rate_rejected() {
    let manager = SerialManager::new(None);
    let result = manager.create_tty("/dev/ttyUSB0", 2401, Parity::Even, "test");
    assert!(matches!(result, Err(BusError::UnsupportedBaudRate(2401))));
    manager.stop();
    manager.wait_for_stop().await;
}

#[tokio::test]
async fn test_absent_tty_reported_not_fatal() {
    let manager = SerialManager::new(None);
    let device = manager
        .create_tty("/dev/tty-mbus-link-does-not-exist", 2400, Parity::Even, "test")
        .unwrap();

    assert_eq!(device.open(false).await.unwrap(), AccessResult::Absent);
    assert!(!device.working());
    assert!(!device.opened());

    match device.open(true).await {
        Err(BusError::DeviceAbsent(path)) => {
            assert_eq!(path, "/dev/tty-mbus-link-does-not-exist")
        }
        other => panic!("expected DeviceAbsent, got {other:?}"),
    }

    manager.stop();
    manager.wait_for_stop().await;
}

#[tokio::test]
async fn test_lookup_by_identity() {
    let manager = SerialManager::new(None);
    let device = manager.create_simulator("test");
    assert!(Arc::ptr_eq(&manager.lookup("simulator").unwrap(), &device));
    assert!(manager.lookup("/dev/ttyUSB9").is_none());
    manager.stop();
    manager.wait_for_stop().await;
}

#[tokio::test]
async fn test_remove_non_working_by_identity() {
    let manager = SerialManager::new(None);
    let _device = manager.create_simulator("test");
    // The simulator never reports working, so it can be evicted on demand.
    assert!(manager.remove_non_working("simulator"));
    assert!(manager.lookup("simulator").is_none());
    assert!(!manager.remove_non_working("simulator"));
    manager.stop();
    manager.wait_for_stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_stop_is_safe_and_idempotent() {
    let manager = SerialManager::new(None);
    assert!(manager.is_running());

    let m1 = Arc::clone(&manager);
    let m2 = Arc::clone(&manager);
    let t1 = std::thread::spawn(move || m1.stop());
    let t2 = std::thread::spawn(move || m2.stop());
    t1.join().unwrap();
    t2.join().unwrap();

    assert!(!manager.is_running());
    manager.wait_for_stop().await;
    manager.wait_for_stop().await;
}

#[tokio::test]
async fn test_wait_for_stop_without_start() {
    // A manager that was never started must still shut down cleanly.
    let manager = SerialManager::new(None);
    manager.stop();
    manager.wait_for_stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_exit_after_stops_manager() {
    let manager = SerialManager::new(Some(Duration::from_secs(3)));
    manager.start();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!manager.is_running());
    manager.wait_for_stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_timer_fires_on_schedule() {
    let manager = SerialManager::new(None);
    let fires = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fires);
    manager.start_regular_callback("poll", 2, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    manager.start();

    // Fires at the 2s and 4s ticks, not yet at the next one.
    tokio::time::sleep(Duration::from_millis(5500)).await;
    assert_eq!(fires.load(Ordering::SeqCst), 2);

    manager.stop();
    manager.wait_for_stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_timer_never_fires() {
    let manager = SerialManager::new(None);
    let fires = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fires);
    let id = manager.start_regular_callback("poll", 1, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    manager.stop_regular_callback(id);
    manager.start();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(fires.load(Ordering::SeqCst), 0);

    manager.stop();
    manager.wait_for_stop().await;
}

#[tokio::test]
async fn test_simulator_drives_receive_path() {
    let manager = SerialManager::new(None);
    let device = manager.create_simulator("test");
    let (seen, handler) = collecting_handler();
    let link = BusLink::new("sim", FrameKind::Simulated, Arc::clone(&device), handler);
    link.attach(&manager);

    // Simulator injection dispatches synchronously.
    device.fill(&hex_to_bytes("107b7b16"));
    assert_eq!(*seen.lock().unwrap(), vec![vec![0x7b]]);

    // A corrupted checksum is dropped, nothing new dispatched.
    device.fill(&hex_to_bytes("107b7c16"));
    assert_eq!(seen.lock().unwrap().len(), 1);

    // Assembly spans injections: a long frame delivered in two pieces.
    device.fill(&hex_to_bytes("68020268"));
    assert_eq!(seen.lock().unwrap().len(), 1);
    device.fill(&hex_to_bytes("0a0b1516"));
    assert_eq!(seen.lock().unwrap().last().unwrap(), &vec![0x0a, 0x0b]);

    manager.stop();
    manager.wait_for_stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_device_end_to_end() {
    mbus_link::logging::init_logger();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&hex_to_bytes("107b7b16680202680a0b1516"))
        .unwrap();
    file.flush().unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let manager = SerialManager::new(None);
    let device = manager.create_file(&path, "test");
    assert!(device.readonly());
    assert_eq!(device.open(true).await.unwrap(), AccessResult::Ok);

    let (seen, handler) = collecting_handler();
    let link = BusLink::new("file", FrameKind::MBus, Arc::clone(&device), handler);
    link.attach(&manager);

    let gone = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&gone);
    manager.on_disappear(&device, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    manager.expect_devices_to_work();
    manager.start();

    // The file drains, hits end-of-file, the device closes itself, and
    // losing the last device stops the manager.
    tokio::time::timeout(Duration::from_secs(10), manager.wait_for_stop())
        .await
        .expect("manager did not stop after file was consumed");

    assert_eq!(*seen.lock().unwrap(), vec![vec![0x7b], vec![0x0a, 0x0b]]);
    assert_eq!(gone.load(Ordering::SeqCst), 1);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_command_device_end_to_end() {
    mbus_link::logging::init_logger();
    let manager = SerialManager::new(None);
    let device = manager.create_command(
        "fakemeter",
        r"printf '\020\173\173\026'",
        Vec::new(),
        Vec::new(),
        "test",
    );
    assert_eq!(device.open(true).await.unwrap(), AccessResult::Ok);

    let (seen, handler) = collecting_handler();
    let link = BusLink::new("cmd", FrameKind::MBus, Arc::clone(&device), handler);
    link.attach(&manager);

    manager.expect_devices_to_work();
    manager.start();

    tokio::time::timeout(Duration::from_secs(10), manager.wait_for_stop())
        .await
        .expect("manager did not stop after subprocess exited");

    assert_eq!(*seen.lock().unwrap(), vec![vec![0x7b]]);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_unhealthy_device_is_fatal_in_operational_mode() {
    mbus_link::logging::init_logger();
    let manager = SerialManager::new(None);

    // A subprocess that stays healthy for the whole test.
    let steady = manager.create_command("steady", "sleep 30", Vec::new(), Vec::new(), "test");
    assert_eq!(steady.open(true).await.unwrap(), AccessResult::Ok);

    // A file device that dies as soon as it is drained.
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&hex_to_bytes("107b7b16")).unwrap();
    file.flush().unwrap();
    let path = file.path().to_str().unwrap().to_string();
    let dying = manager.create_file(&path, "test");
    assert_eq!(dying.open(true).await.unwrap(), AccessResult::Ok);

    let (seen, handler) = collecting_handler();
    let link = BusLink::new("dying", FrameKind::MBus, Arc::clone(&dying), handler);
    link.attach(&manager);

    manager.expect_devices_to_work();
    manager.start();

    // Losing one device must stop the whole manager even though the
    // subprocess device is still healthy.
    tokio::time::timeout(Duration::from_secs(10), manager.wait_for_stop())
        .await
        .expect("manager kept running after losing a device");

    assert!(manager.lookup(&path).is_none());
    assert_eq!(*seen.lock().unwrap(), vec![vec![0x7b]]);
}

#[tokio::test]
async fn test_send_on_readonly_device_is_noop_success() {
    let manager = SerialManager::new(None);
    let device = manager.create_simulator("test");
    assert!(device.send(&[0x10, 0x7b, 0x7b, 0x16]).await);
    assert!(!device.send(&[]).await);
    manager.stop();
    manager.wait_for_stop().await;
}

#[tokio::test]
async fn test_disappear_callback_fires_once() {
    let manager = SerialManager::new(None);
    let device = manager.create_simulator("test");
    let gone = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&gone);
    manager.on_disappear(&device, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // The simulator never opens a transport, so closing it is a no-op and
    // the disappear callback stays armed until a real close happens.
    device.close();
    device.close();
    assert_eq!(gone.load(Ordering::SeqCst), 0);

    manager.stop();
    manager.wait_for_stop().await;
}

#[tokio::test]
async fn test_replay_through_simulator() {
    use mbus_link::replay::{parse_simulation, run_replay};

    let manager = SerialManager::new(None);
    let device = manager.create_simulator("replay");
    let (seen, handler) = collecting_handler();
    let link = BusLink::new("replay", FrameKind::Simulated, Arc::clone(&device), handler);
    link.attach(&manager);

    let telegrams = parse_simulation(
        "# recorded traffic\ntelegram=107b7b16\ntelegram=|680202680a0b1516|\n",
    )
    .unwrap();
    run_replay(&manager, &device, &telegrams).await;

    assert_eq!(*seen.lock().unwrap(), vec![vec![0x7b], vec![0x0a, 0x0b]]);
    assert!(!manager.is_running());
    manager.wait_for_stop().await;
}
