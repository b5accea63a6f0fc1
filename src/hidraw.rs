//! Linux hidraw transport
//!
//! Talks to the K-Pod through `/dev/hidraw*` nodes. Devices are identified by
//! reading `HID_ID`/`HID_NAME` from `/sys/class/hidraw/*/device/uevent`.
//!
//! There is no permission dialog on Linux; access to the device node is
//! granted by udev rules. Attach/detach notifications come from periodically
//! rescanning sysfs and diffing the set of matching nodes.
//!
//! SPDX-License-Identifier: GPL-3.0

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::transport::{
    DeviceFilter, DeviceHandle, DeviceHandler, InputReport, InputReportHandler, Subscription,
    Transport, TransportError,
};

/// sysfs class directory listing hidraw nodes
pub const HIDRAW_SYSFS: &str = "/sys/class/hidraw";

/// Max hidraw report size we read
const READ_BUF_LEN: usize = 64;

/// Sleep between non-blocking reads when no report is pending
const READ_IDLE: Duration = Duration::from_millis(2);

/// One hidraw node as described by sysfs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidrawDeviceInfo {
    pub handle: DeviceHandle,
    pub path: PathBuf,
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Parse vendor ID, product ID and name from a hidraw `device/uevent` file
///
/// `HID_ID` looks like `0003:000004D8:0000F12D` (bus, vendor, product).
pub fn parse_uevent(uevent: &str) -> Option<(u16, u16, String)> {
    let mut ids = None;
    let mut name = String::new();

    for line in uevent.lines() {
        if let Some(value) = line.strip_prefix("HID_ID=") {
            let mut parts = value.trim().split(':');
            let _bus = parts.next()?;
            let vendor = u32::from_str_radix(parts.next()?, 16).ok()?;
            let product = u32::from_str_radix(parts.next()?, 16).ok()?;
            ids = Some((u16::try_from(vendor).ok()?, u16::try_from(product).ok()?));
        } else if let Some(value) = line.strip_prefix("HID_NAME=") {
            name = value.trim().to_string();
        }
    }

    let (vendor_id, product_id) = ids?;
    Some((vendor_id, product_id, name))
}

/// List every hidraw node on the system
pub fn scan_devices() -> Result<Vec<HidrawDeviceInfo>, TransportError> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir(HIDRAW_SYSFS)? {
        let entry = entry?;
        let uevent_path = entry.path().join("device/uevent");

        let Ok(uevent) = std::fs::read_to_string(&uevent_path) else {
            continue;
        };
        let Some((vendor_id, product_id, name)) = parse_uevent(&uevent) else {
            tracing::debug!(path = %uevent_path.display(), "Unparseable hidraw uevent");
            continue;
        };

        let path = PathBuf::from("/dev").join(entry.file_name());
        devices.push(HidrawDeviceInfo {
            handle: DeviceHandle::new(path.to_string_lossy().into_owned()),
            path,
            name,
            vendor_id,
            product_id,
        });
    }

    devices.sort_by(|a, b| a.handle.cmp(&b.handle));
    Ok(devices)
}

fn scan_matching(filter: DeviceFilter) -> Result<Vec<HidrawDeviceInfo>, TransportError> {
    Ok(scan_devices()?
        .into_iter()
        .filter(|info| filter.matches(info.vendor_id, info.product_id))
        .collect())
}

// ============================================================================
// Transport
// ============================================================================

type SharedDeviceHandler = Arc<dyn Fn(DeviceHandle) + Send + Sync>;
type SharedReportHandler = Arc<dyn Fn(InputReport) + Send + Sync>;

struct OpenDevice {
    file: Arc<File>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    attach: HashMap<u64, SharedDeviceHandler>,
    detach: HashMap<u64, SharedDeviceHandler>,
    reports: HashMap<DeviceHandle, HashMap<u64, SharedReportHandler>>,
    open: HashMap<DeviceHandle, OpenDevice>,
    names: HashMap<DeviceHandle, String>,
    present: HashSet<DeviceHandle>,
    watcher: Option<JoinHandle<()>>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record_present(&mut self, devices: &[HidrawDeviceInfo]) {
        self.present = devices.iter().map(|info| info.handle.clone()).collect();
        for info in devices {
            self.names.insert(info.handle.clone(), info.name.clone());
        }
    }

    fn stop_watcher_if_unused(&mut self) {
        if self.attach.is_empty() && self.detach.is_empty() {
            if let Some(watcher) = self.watcher.take() {
                watcher.abort();
            }
        }
    }
}

type SharedState = Arc<Mutex<State>>;

fn lock(state: &SharedState) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Transport`] over Linux hidraw device nodes
pub struct HidrawTransport {
    filter: DeviceFilter,
    rescan_interval: Duration,
    state: SharedState,
}

impl HidrawTransport {
    pub fn new(filter: DeviceFilter, rescan_interval: Duration) -> Self {
        Self {
            filter,
            rescan_interval,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Start the rescan task if no one is watching yet
    fn ensure_watcher(&self, state: &mut State) {
        if state.watcher.is_some() {
            return;
        }

        match scan_matching(self.filter) {
            Ok(devices) => state.record_present(&devices),
            Err(e) => tracing::warn!(error = %e, "Initial hidraw scan failed"),
        }

        state.watcher = Some(tokio::spawn(watch_devices(
            self.state.clone(),
            self.filter,
            self.rescan_interval,
        )));
    }

    fn register_device_handler(&self, handler: DeviceHandler, attach: bool) -> Subscription {
        let handler: SharedDeviceHandler = Arc::from(handler);
        let mut state = lock(&self.state);
        let id = state.next_id();

        if attach {
            state.attach.insert(id, handler);
        } else {
            state.detach.insert(id, handler);
        }
        self.ensure_watcher(&mut state);

        let shared = self.state.clone();
        Subscription::new(move || {
            let mut state = lock(&shared);
            if attach {
                state.attach.remove(&id);
            } else {
                state.detach.remove(&id);
            }
            state.stop_watcher_if_unused();
        })
    }
}

impl Drop for HidrawTransport {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(watcher) = state.watcher.take() {
            watcher.abort();
        }
        for (_, device) in state.open.drain() {
            device.reader.abort();
        }
    }
}

#[async_trait]
impl Transport for HidrawTransport {
    fn is_available(&self) -> bool {
        Path::new(HIDRAW_SYSFS).is_dir()
    }

    async fn enumerate_open_devices(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        let devices = scan_matching(self.filter)?;
        lock(&self.state).record_present(&devices);

        for info in &devices {
            tracing::debug!(path = %info.path.display(), name = %info.name, "Found matching hidraw device");
        }
        Ok(devices.into_iter().map(|info| info.handle).collect())
    }

    fn on_attach(&self, handler: DeviceHandler) -> Subscription {
        self.register_device_handler(handler, true)
    }

    fn on_detach(&self, handler: DeviceHandler) -> Subscription {
        self.register_device_handler(handler, false)
    }

    async fn open(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        if self.is_open(handle) {
            return Ok(());
        }

        let path = Path::new(handle.id());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(handle.clone()),
                io::ErrorKind::NotFound => TransportError::DeviceNotFound(handle.clone()),
                _ => TransportError::Io(e),
            })?;

        let file = Arc::new(file);
        let reader = tokio::spawn(read_reports(handle.clone(), file.clone(), self.state.clone()));

        if let Some(previous) = lock(&self.state).open.insert(handle.clone(), OpenDevice { file, reader }) {
            previous.reader.abort();
        }

        tracing::info!(path = %path.display(), "Opened hidraw device");
        Ok(())
    }

    fn close(&self, handle: &DeviceHandle) {
        if let Some(device) = lock(&self.state).open.remove(handle) {
            device.reader.abort();
            tracing::info!(device = %handle, "Closed hidraw device");
        }
    }

    fn is_open(&self, handle: &DeviceHandle) -> bool {
        lock(&self.state).open.contains_key(handle) && Path::new(handle.id()).exists()
    }

    async fn send_report(
        &self,
        handle: &DeviceHandle,
        report_id: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let file = lock(&self.state)
            .open
            .get(handle)
            .map(|device| device.file.clone())
            .ok_or_else(|| TransportError::NotOpen(handle.clone()))?;

        // hidraw expects the report number in front, 0 for unnumbered reports
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(report_id);
        buf.extend_from_slice(data);

        (&*file).write_all(&buf)?;
        Ok(())
    }

    fn on_input_report(&self, handle: &DeviceHandle, handler: InputReportHandler) -> Subscription {
        let handler: SharedReportHandler = Arc::from(handler);
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.reports.entry(handle.clone()).or_default().insert(id, handler);

        let shared = self.state.clone();
        let handle = handle.clone();
        Subscription::new(move || {
            let mut state = lock(&shared);
            if let Some(handlers) = state.reports.get_mut(&handle) {
                handlers.remove(&id);
                if handlers.is_empty() {
                    state.reports.remove(&handle);
                }
            }
        })
    }

    async fn request_new_device(&self, filter: DeviceFilter) -> Result<Vec<DeviceHandle>, TransportError> {
        let devices = scan_matching(filter)?;
        if devices.is_empty() {
            tracing::info!(filter = %filter, "No matching hidraw device found");
        }

        let mut state = lock(&self.state);
        for info in &devices {
            state.names.insert(info.handle.clone(), info.name.clone());
        }
        Ok(devices.into_iter().map(|info| info.handle).collect())
    }

    fn product_name(&self, handle: &DeviceHandle) -> Option<String> {
        lock(&self.state).names.get(handle).cloned()
    }
}

/// Rescan sysfs and notify attach/detach handlers about changes
async fn watch_devices(state: SharedState, filter: DeviceFilter, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let devices = match scan_matching(filter) {
            Ok(devices) => devices,
            Err(e) => {
                tracing::debug!(error = %e, "hidraw rescan failed");
                continue;
            }
        };

        let (attached, detached, on_attach, on_detach) = {
            let mut state = lock(&state);
            let now: HashSet<DeviceHandle> = devices.iter().map(|info| info.handle.clone()).collect();
            let mut attached: Vec<_> = now.difference(&state.present).cloned().collect();
            let mut detached: Vec<_> = state.present.difference(&now).cloned().collect();
            attached.sort();
            detached.sort();
            state.record_present(&devices);

            (
                attached,
                detached,
                state.attach.values().cloned().collect::<Vec<_>>(),
                state.detach.values().cloned().collect::<Vec<_>>(),
            )
        };

        for handle in detached {
            tracing::debug!(device = %handle, "hidraw node removed");
            for handler in &on_detach {
                handler(handle.clone());
            }
        }
        for handle in attached {
            tracing::debug!(device = %handle, "hidraw node added");
            for handler in &on_attach {
                handler(handle.clone());
            }
        }
    }
}

/// Read input reports until the device goes away
async fn read_reports(handle: DeviceHandle, file: Arc<File>, state: SharedState) {
    let mut buf = [0u8; READ_BUF_LEN];

    loop {
        let read_result = (&*file).read(&mut buf);

        match read_result {
            Ok(0) => {
                tracing::info!(device = %handle, "hidraw device returned EOF");
                break;
            }
            Ok(len) => {
                let handlers: Vec<SharedReportHandler> = lock(&state)
                    .reports
                    .get(&handle)
                    .map(|handlers| handlers.values().cloned().collect())
                    .unwrap_or_default();

                let report = InputReport {
                    report_id: 0,
                    data: buf[..len].to_vec(),
                };
                for handler in handlers {
                    handler(report.clone());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tokio::time::sleep(READ_IDLE).await;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(device = %handle, error = %e, "Error reading hidraw device");
                break;
            }
        }
    }

    // Leave the entry for is_open to report as closed
    let mut state = lock(&state);
    if state.open.get(&handle).is_some_and(|device| Arc::ptr_eq(&device.file, &file)) {
        state.open.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KPOD_UEVENT: &str = "DRIVER=hid-generic\n\
        HID_ID=0003:000004D8:0000F12D\n\
        HID_NAME=Elecraft K-Pod\n\
        HID_PHYS=usb-0000:00:14.0-2/input0\n\
        MODALIAS=hid:b0003g0001v000004D8p0000F12D\n";

    #[test]
    fn test_parse_uevent() {
        let (vendor, product, name) = parse_uevent(KPOD_UEVENT).unwrap();
        assert_eq!(vendor, 0x04D8);
        assert_eq!(product, 0xF12D);
        assert_eq!(name, "Elecraft K-Pod");
    }

    #[test]
    fn test_parse_uevent_lowercase_hex() {
        let (vendor, product, name) = parse_uevent("HID_ID=0005:0000046d:0000b034\n").unwrap();
        assert_eq!(vendor, 0x046D);
        assert_eq!(product, 0xB034);
        assert!(name.is_empty());
    }

    #[test]
    fn test_parse_uevent_missing_id() {
        assert!(parse_uevent("HID_NAME=Something\n").is_none());
        assert!(parse_uevent("HID_ID=0003:zz:0000F12D\n").is_none());
        assert!(parse_uevent("HID_ID=0003\n").is_none());
    }

    #[test]
    fn test_parse_uevent_rejects_oversized_ids() {
        assert!(parse_uevent("HID_ID=0003:000104D8:0000F12D\n").is_none());
    }

    #[test]
    fn test_unopened_device_is_closed() {
        let transport = HidrawTransport::new(DeviceFilter::default(), Duration::from_secs(2));
        assert!(!transport.is_open(&DeviceHandle::new("/dev/hidraw-none")));
    }

    #[tokio::test]
    async fn test_send_to_unopened_device_fails() {
        let transport = HidrawTransport::new(DeviceFilter::default(), Duration::from_secs(2));
        let handle = DeviceHandle::new("/dev/hidraw-none");
        let err = transport.send_report(&handle, 0, &[0x75]).await.unwrap_err();
        assert!(matches!(err, TransportError::NotOpen(_)));
    }

    #[tokio::test]
    async fn test_open_missing_node() {
        let transport = HidrawTransport::new(DeviceFilter::default(), Duration::from_secs(2));
        let handle = DeviceHandle::new("/dev/kpodd-test-missing-node");
        let err = transport.open(&handle).await.unwrap_err();
        assert!(matches!(err, TransportError::DeviceNotFound(_)));
    }

    #[test]
    fn test_report_subscription_released() {
        let transport = HidrawTransport::new(DeviceFilter::default(), Duration::from_secs(2));
        let handle = DeviceHandle::new("/dev/hidraw0");

        let sub = transport.on_input_report(&handle, Box::new(|_| {}));
        assert_eq!(lock(&transport.state).reports.get(&handle).map(HashMap::len), Some(1));

        sub.release();
        assert!(lock(&transport.state).reports.get(&handle).is_none());
    }
}
