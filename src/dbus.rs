//! D-Bus IPC server for kpodd
//!
//! Publishes decoded knob events to the receiver-control application.
//!
//! ## Interface: org.openwebrx.Kpod
//!
//! ### Methods:
//! - `RequestDevice() -> as` - Attach newly found K-Pods, returns their ids
//! - `ListDevices() -> a(ss)` - Registered devices and their session state
//!
//! ### Signals:
//! - `EncoderTurned(delta: i16, scale: s)` - Knob turned; scale is coarse/normal/fine
//! - `ButtonPressed(index: y)` - Button 1-15 pressed

use tokio::sync::mpsc;
use zbus::{fdo, interface, object_server::SignalEmitter};

use crate::report::KnobEvent;
use crate::session::{SessionError, SessionManagerHandle};
use crate::sink::EventSink;

/// D-Bus interface name
pub const DBUS_INTERFACE: &str = "org.openwebrx.Kpod";

/// D-Bus object path
pub const DBUS_PATH: &str = "/org/openwebrx/Kpod";

/// D-Bus bus name
pub const DBUS_NAME: &str = "org.openwebrx.Kpod";

/// kpodd D-Bus service
pub struct KpodService {
    manager: SessionManagerHandle,
    version: String,
}

impl KpodService {
    pub fn new(manager: SessionManagerHandle) -> Self {
        Self {
            manager,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[interface(name = "org.openwebrx.Kpod")]
impl KpodService {
    // =========================================================================
    // METHODS
    // =========================================================================

    /// Look for a new K-Pod and attach it
    ///
    /// Returns the ids of the attached devices; empty if none was found.
    async fn request_device(&self) -> fdo::Result<Vec<String>> {
        tracing::info!("RequestDevice called");
        match self.manager.request_device().await {
            Ok(devices) => Ok(devices.iter().map(|handle| handle.id().to_string()).collect()),
            Err(SessionError::Unavailable) => Err(fdo::Error::NotSupported(
                "Device transport unavailable".to_string(),
            )),
            Err(e) => Err(fdo::Error::Failed(e.to_string())),
        }
    }

    /// Registered devices as (id, state) pairs
    async fn list_devices(&self) -> fdo::Result<Vec<(String, String)>> {
        Ok(self
            .manager
            .sessions()
            .await
            .into_iter()
            .map(|info| (info.handle.id().to_string(), info.state.as_str().to_string()))
            .collect())
    }

    // =========================================================================
    // SIGNALS
    // =========================================================================

    /// Signal emitted when the knob is turned
    ///
    /// # Arguments
    /// * `delta` - Encoder ticks, negative for counter-clockwise
    /// * `scale` - "coarse", "normal" or "fine" from the rocker switch
    #[zbus(signal)]
    async fn encoder_turned(emitter: &SignalEmitter<'_>, delta: i16, scale: &str) -> zbus::Result<()>;

    /// Signal emitted when a button is freshly pressed
    #[zbus(signal)]
    async fn button_pressed(emitter: &SignalEmitter<'_>, index: u8) -> zbus::Result<()>;

    // =========================================================================
    // PROPERTIES
    // =========================================================================

    /// Whether hidraw access is available on this system
    #[zbus(property)]
    async fn available(&self) -> bool {
        self.manager.is_available()
    }

    /// Get daemon version
    #[zbus(property)]
    async fn daemon_version(&self) -> &str {
        &self.version
    }
}

/// Initialize the D-Bus service
///
/// Connects to the session bus, registers the service name, and exports
/// the interface at [`DBUS_PATH`]. The returned connection must be kept alive.
pub async fn init_dbus_service(manager: SessionManagerHandle) -> zbus::Result<zbus::Connection> {
    let service = KpodService::new(manager);

    let connection = zbus::connection::Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, service)?
        .build()
        .await?;

    tracing::info!(name = DBUS_NAME, path = DBUS_PATH, "D-Bus service registered");

    Ok(connection)
}

// ============================================================================
// Event sink
// ============================================================================

/// [`EventSink`] that emits knob events as D-Bus signals
///
/// Dispatch only queues the event; [`DbusSink::run`] emits them.
pub struct DbusSink {
    tx: mpsc::UnboundedSender<KnobEvent>,
}

impl DbusSink {
    /// Create the sink and the receiver to pass to [`DbusSink::run`]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<KnobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit queued events as signals until the sink is dropped
    pub async fn run(connection: zbus::Connection, mut events: mpsc::UnboundedReceiver<KnobEvent>) {
        let emitter = match SignalEmitter::new(&connection, DBUS_PATH) {
            Ok(emitter) => emitter,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create D-Bus signal emitter");
                return;
            }
        };

        while let Some(event) = events.recv().await {
            let result = match event {
                KnobEvent::EncoderTurn { delta, scale } => {
                    KpodService::encoder_turned(&emitter, delta, scale.as_str()).await
                }
                KnobEvent::ButtonPress { index } => KpodService::button_pressed(&emitter, index).await,
            };

            if let Err(e) = result {
                tracing::warn!(error = %e, ?event, "Failed to emit knob signal");
            }
        }
    }
}

impl EventSink for DbusSink {
    fn dispatch(&self, event: KnobEvent) {
        self.tx.dispatch(event);
    }
}
