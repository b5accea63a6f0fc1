//! kpodd Library
//!
//! Driver core for the Elecraft K-Pod tuning knob: report decoding, per-device
//! status polling and device session management.

pub mod config;
pub mod dbus;
pub mod hidraw;
pub mod polling;
pub mod report;
pub mod session;
pub mod sink;
pub mod transport;

/// Re-export commonly used types
pub use config::{Config, ConfigError, PollingConfig};
pub use dbus::{init_dbus_service, DbusSink, KpodService, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH};
pub use hidraw::HidrawTransport;
pub use polling::PollingEngine;
pub use report::{decode, KnobEvent, Rocker, ScaleHint, StatusReport, STATUS_REQUEST};
pub use session::{SessionError, SessionInfo, SessionManager, SessionManagerHandle, SessionState};
pub use sink::{EventSink, JsonLinesSink, LogSink};
pub use transport::{
    DeviceFilter, DeviceHandle, InputReport, Subscription, Transport, TransportError, KPOD_PRODUCT_ID,
    KPOD_VENDOR_ID,
};
