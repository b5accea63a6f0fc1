//! Scripted in-memory transport for driving the session manager in tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use kpodd::transport::{
    DeviceFilter, DeviceHandle, DeviceHandler, InputReport, InputReportHandler, Subscription,
    Transport, TransportError,
};

type SharedDeviceHandler = Arc<dyn Fn(DeviceHandle) + Send + Sync>;
type SharedReportHandler = Arc<dyn Fn(InputReport) + Send + Sync>;

#[derive(Default)]
struct MockState {
    next_id: u64,
    attach: HashMap<u64, SharedDeviceHandler>,
    detach: HashMap<u64, SharedDeviceHandler>,
    reports: HashMap<DeviceHandle, HashMap<u64, SharedReportHandler>>,
    connected: Vec<DeviceHandle>,
    requestable: Vec<DeviceHandle>,
    open: HashSet<DeviceHandle>,
    gate_opens: bool,
    pending_opens: HashMap<DeviceHandle, Vec<oneshot::Sender<Result<(), TransportError>>>>,
    failing_opens: HashSet<DeviceHandle>,
    open_calls: usize,
    close_calls: usize,
    fail_sends: bool,
    sent: Vec<(DeviceHandle, u8, Vec<u8>)>,
}

/// Transport whose devices are scripted by the test
pub struct MockTransport {
    available: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            available: true,
            state: Arc::default(),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            available: false,
            state: Arc::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Device already connected before the manager starts
    pub fn connect(&self, handle: &DeviceHandle) {
        self.lock().connected.push(handle.clone());
    }

    /// Device the OS already has open
    pub fn mark_open(&self, handle: &DeviceHandle) {
        self.lock().open.insert(handle.clone());
    }

    /// Device returned by the next permission request
    pub fn grant_on_request(&self, handle: &DeviceHandle) {
        self.lock().requestable.push(handle.clone());
    }

    /// Hold every open until `resolve_open` is called
    pub fn gate_opens(&self) {
        self.lock().gate_opens = true;
    }

    pub fn fail_open(&self, handle: &DeviceHandle) {
        self.lock().failing_opens.insert(handle.clone());
    }

    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    pub fn resolve_open(&self, handle: &DeviceHandle, result: Result<(), TransportError>) {
        let pending = self.lock().pending_opens.get_mut(handle).and_then(|p| {
            if p.is_empty() {
                None
            } else {
                Some(p.remove(0))
            }
        });
        pending.expect("no pending open").send(result).ok();
    }

    pub fn pending_opens(&self, handle: &DeviceHandle) -> usize {
        self.lock().pending_opens.get(handle).map_or(0, Vec::len)
    }

    pub fn attach(&self, handle: &DeviceHandle) {
        let handlers: Vec<_> = self.lock().attach.values().cloned().collect();
        for handler in handlers {
            handler(handle.clone());
        }
    }

    pub fn detach(&self, handle: &DeviceHandle) {
        let handlers: Vec<_> = {
            let mut state = self.lock();
            state.open.remove(handle);
            state.detach.values().cloned().collect()
        };
        for handler in handlers {
            handler(handle.clone());
        }
    }

    /// Device disappears without a detach notification
    pub fn vanish(&self, handle: &DeviceHandle) {
        self.lock().open.remove(handle);
    }

    pub fn emit_report(&self, handle: &DeviceHandle, data: &[u8]) {
        let handlers: Vec<_> = self
            .lock()
            .reports
            .get(handle)
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(InputReport {
                report_id: 0,
                data: data.to_vec(),
            });
        }
    }

    pub fn sent_to(&self, handle: &DeviceHandle) -> Vec<(u8, Vec<u8>)> {
        self.lock()
            .sent
            .iter()
            .filter(|(h, _, _)| h == handle)
            .map(|(_, id, data)| (*id, data.clone()))
            .collect()
    }

    pub fn send_count(&self, handle: &DeviceHandle) -> usize {
        self.sent_to(handle).len()
    }

    pub fn device_subscribers(&self) -> usize {
        let state = self.lock();
        state.attach.len() + state.detach.len()
    }

    pub fn report_subscribers(&self, handle: &DeviceHandle) -> usize {
        self.lock().reports.get(handle).map_or(0, HashMap::len)
    }

    pub fn is_device_open(&self, handle: &DeviceHandle) -> bool {
        self.lock().open.contains(handle)
    }

    pub fn open_calls(&self) -> usize {
        self.lock().open_calls
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn enumerate_open_devices(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        Ok(self.lock().connected.clone())
    }

    fn on_attach(&self, handler: DeviceHandler) -> Subscription {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.attach.insert(id, Arc::from(handler));

        let shared = self.state.clone();
        Subscription::new(move || {
            shared.lock().unwrap().attach.remove(&id);
        })
    }

    fn on_detach(&self, handler: DeviceHandler) -> Subscription {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.detach.insert(id, Arc::from(handler));

        let shared = self.state.clone();
        Subscription::new(move || {
            shared.lock().unwrap().detach.remove(&id);
        })
    }

    async fn open(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        let gate = {
            let mut state = self.lock();
            state.open_calls += 1;
            if state.failing_opens.contains(handle) {
                return Err(TransportError::PermissionDenied(handle.clone()));
            }
            if state.gate_opens {
                let (tx, rx) = oneshot::channel();
                state.pending_opens.entry(handle.clone()).or_default().push(tx);
                Some(rx)
            } else {
                state.open.insert(handle.clone());
                None
            }
        };

        let Some(rx) = gate else {
            return Ok(());
        };

        let result = rx
            .await
            .unwrap_or_else(|_| Err(TransportError::DeviceNotFound(handle.clone())));
        if result.is_ok() {
            self.lock().open.insert(handle.clone());
        }
        result
    }

    fn close(&self, handle: &DeviceHandle) {
        let mut state = self.lock();
        state.close_calls += 1;
        state.open.remove(handle);
    }

    fn is_open(&self, handle: &DeviceHandle) -> bool {
        self.lock().open.contains(handle)
    }

    async fn send_report(
        &self,
        handle: &DeviceHandle,
        report_id: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.sent.push((handle.clone(), report_id, data.to_vec()));
        if state.fail_sends {
            return Err(TransportError::Io(io::Error::other("device busy")));
        }
        if !state.open.contains(handle) {
            return Err(TransportError::NotOpen(handle.clone()));
        }
        Ok(())
    }

    fn on_input_report(&self, handle: &DeviceHandle, handler: InputReportHandler) -> Subscription {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state
            .reports
            .entry(handle.clone())
            .or_default()
            .insert(id, Arc::from(handler));

        let shared = self.state.clone();
        let handle = handle.clone();
        Subscription::new(move || {
            if let Some(handlers) = shared.lock().unwrap().reports.get_mut(&handle) {
                handlers.remove(&id);
            }
        })
    }

    async fn request_new_device(&self, _filter: DeviceFilter) -> Result<Vec<DeviceHandle>, TransportError> {
        Ok(std::mem::take(&mut self.lock().requestable))
    }

    fn product_name(&self, _handle: &DeviceHandle) -> Option<String> {
        Some("Mock K-Pod".to_string())
    }
}

/// Let every runnable task run to completion of its current step
///
/// Relies on paused time: the clock only auto-advances once all tasks are idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn status_report(ticks: i16, bits: u8) -> [u8; 8] {
    let [lo, hi] = ticks.to_le_bytes();
    [0x75, lo, hi, bits, 0, 0, 0, 0]
}
