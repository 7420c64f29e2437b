//! Detection of serial tty device nodes.
//!
//! On Linux the kernel exposes every tty under `/sys/class/tty`; entries
//! with a `device/driver` link are backed by real hardware. The legacy
//! `serial8250` driver claims a block of phantom ports, so those are only
//! reported if they answered a probe, which we skip; everything else maps
//! to a usable `/dev/` node.

#[cfg(target_os = "linux")]
pub fn list_serial_ttys() -> Vec<String> {
    let mut ttys = Vec::new();
    let entries = match std::fs::read_dir("/sys/class/tty") {
        Ok(entries) => entries,
        Err(_) => return ttys,
    };
    for entry in entries.flatten() {
        let driver = entry.path().join("device").join("driver");
        let Ok(driver_path) = std::fs::read_link(&driver) else {
            continue;
        };
        if driver_path.file_name().is_some_and(|n| n == "serial8250") {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            let dev = format!("/dev/{name}");
            if std::path::Path::new(&dev).exists() {
                ttys.push(dev);
            }
        }
    }
    ttys.sort();
    ttys
}

#[cfg(not(target_os = "linux"))]
pub fn list_serial_ttys() -> Vec<String> {
    Vec::new()
}
