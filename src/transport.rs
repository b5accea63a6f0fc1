//! Device transport boundary
//!
//! The session manager and polling engine only talk to devices through the
//! [`Transport`] trait. The Linux implementation lives in [`crate::hidraw`];
//! tests drive the manager through a scripted in-memory transport.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Elecraft K-Pod vendor ID (Microchip)
pub const KPOD_VENDOR_ID: u16 = 0x04D8;

/// Elecraft K-Pod product ID
pub const KPOD_PRODUCT_ID: u16 = 0xF12D;

/// Opaque identifier for one attached device
///
/// Supplied by the transport; equality and hashing go by the identifier only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(Arc<str>);

impl DeviceHandle {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Vendor/product pair selecting one class of device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceFilter {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            vendor_id: KPOD_VENDOR_ID,
            product_id: KPOD_PRODUCT_ID,
        }
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

/// Input report delivered by a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputReport {
    pub report_id: u8,
    pub data: Vec<u8>,
}

/// Callback for attach/detach notifications
pub type DeviceHandler = Box<dyn Fn(DeviceHandle) + Send + Sync>;

/// Callback for input reports of one device
pub type InputReportHandler = Box<dyn Fn(InputReport) + Send + Sync>;

// ============================================================================
// Subscription
// ============================================================================

/// Registration of a handler with the transport
///
/// The handler stays registered for as long as the subscription is alive;
/// dropping it (or calling [`Subscription::release`]) unregisters it.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Subscription with nothing to unregister
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn release(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

// ============================================================================
// Transport trait
// ============================================================================

/// Host device-access subsystem
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether this environment can access devices at all
    fn is_available(&self) -> bool;

    /// Devices already connected when the application starts
    async fn enumerate_open_devices(&self) -> Result<Vec<DeviceHandle>, TransportError>;

    /// Register a handler for device attach notifications
    fn on_attach(&self, handler: DeviceHandler) -> Subscription;

    /// Register a handler for device detach notifications
    fn on_detach(&self, handler: DeviceHandler) -> Subscription;

    async fn open(&self, handle: &DeviceHandle) -> Result<(), TransportError>;

    fn close(&self, handle: &DeviceHandle);

    /// Whether the device is currently open
    fn is_open(&self, handle: &DeviceHandle) -> bool;

    async fn send_report(
        &self,
        handle: &DeviceHandle,
        report_id: u8,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Register a handler invoked for every input report the device emits
    fn on_input_report(&self, handle: &DeviceHandle, handler: InputReportHandler) -> Subscription;

    /// Ask for access to a new device of the given class
    ///
    /// May resolve to an empty list when nothing was selected.
    async fn request_new_device(&self, filter: DeviceFilter) -> Result<Vec<DeviceHandle>, TransportError>;

    /// Human-readable product name, for logging
    fn product_name(&self, _handle: &DeviceHandle) -> Option<String> {
        None
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Transport error type
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Device node vanished or was never present
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceHandle),
    /// Device node exists but cannot be accessed
    #[error("Permission denied for {0}. Ensure udev rules are installed.")]
    PermissionDenied(DeviceHandle),
    /// Operation requires an open device
    #[error("Device not open: {0}")]
    NotOpen(DeviceHandle),
    /// Device access is not supported in this environment
    #[error("Device transport unavailable")]
    Unavailable,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
