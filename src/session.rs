//! Device session management
//!
//! The [`SessionManager`] owns the registry of attached devices. It runs as a
//! single task: attach/detach notifications from the transport, open
//! completions and engine closure notices are all queued onto one command
//! channel and applied in order, so the registry needs no locking.
//!
//! Per-device state machine:
//!
//! ```text
//! Unknown --attach--> Opening --open ok--> Polling --detach / closed--> (removed)
//!                        |
//!                        +--open failed--> (removed)
//! ```
//!
//! An attach for a handle that is already `Opening` or `Polling` is a
//! reconnection: the old schedule is cancelled before the new open starts.
//! Every attach gets a fresh generation number so a late open completion from
//! a superseded or detached session is recognised and dropped.
//!
//! The task runs until [`SessionManagerHandle::shutdown`] is called or the
//! last handle is dropped; either way every engine is stopped, open devices
//! are closed and the transport subscriptions are released.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::PollingConfig;
use crate::polling::PollingEngine;
use crate::sink::EventSink;
use crate::transport::{DeviceFilter, DeviceHandle, Subscription, Transport, TransportError};

/// Lifecycle state of a registered device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Open request in flight
    Opening,
    /// Open and polled
    Polling,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Opening => "opening",
            SessionState::Polling => "polling",
        }
    }
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub handle: DeviceHandle,
    pub state: SessionState,
    /// Whether a poll schedule is currently running for the device
    pub polling: bool,
}

struct DeviceSession {
    generation: u64,
    state: SessionState,
    engine: Option<PollingEngine>,
}

impl DeviceSession {
    fn teardown(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
        }
    }
}

enum Command {
    Attach(DeviceHandle),
    Detach(DeviceHandle),
    OpenResolved {
        handle: DeviceHandle,
        generation: u64,
        result: Result<(), TransportError>,
    },
    EngineClosed {
        handle: DeviceHandle,
        generation: u64,
    },
    Sessions(oneshot::Sender<Vec<SessionInfo>>),
    Shutdown(oneshot::Sender<()>),
}

// ============================================================================
// Manager task
// ============================================================================

/// Owner of all device sessions
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    polling: PollingConfig,
    sessions: HashMap<DeviceHandle, DeviceSession>,
    next_generation: u64,
    /// Weak so that dropping the last handle ends the task
    commands: mpsc::WeakUnboundedSender<Command>,
    subscriptions: Vec<Subscription>,
}

impl SessionManager {
    /// Construct the manager and start its task
    ///
    /// If the transport is unavailable the returned handle is inert: nothing
    /// is subscribed, no task runs and every operation is a no-op.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        polling: PollingConfig,
        filter: DeviceFilter,
    ) -> SessionManagerHandle {
        if !transport.is_available() {
            tracing::warn!("Device transport unavailable, knob support disabled");
            return SessionManagerHandle {
                transport,
                filter,
                commands: None,
            };
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let attach_tx = tx.downgrade();
        let detach_tx = tx.downgrade();
        let subscriptions = vec![
            transport.on_attach(Box::new(move |handle| {
                send(&attach_tx, Command::Attach(handle));
            })),
            transport.on_detach(Box::new(move |handle| {
                send(&detach_tx, Command::Detach(handle));
            })),
        ];

        let manager = SessionManager {
            transport: transport.clone(),
            sink,
            polling,
            sessions: HashMap::new(),
            next_generation: 0,
            commands: tx.downgrade(),
            subscriptions,
        };
        tokio::spawn(manager.run(rx));

        SessionManagerHandle {
            transport,
            filter,
            commands: Some(tx),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let transport = self.transport.clone();
        match transport.enumerate_open_devices().await {
            Ok(devices) => {
                tracing::info!(count = devices.len(), "Picking up already connected devices");
                for handle in devices {
                    self.on_attach(handle);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to enumerate connected devices"),
        }

        while let Some(command) = rx.recv().await {
            match command {
                Command::Attach(handle) => self.on_attach(handle),
                Command::Detach(handle) => self.on_detach(handle),
                Command::OpenResolved { handle, generation, result } => {
                    self.on_open_resolved(handle, generation, result)
                }
                Command::EngineClosed { handle, generation } => self.on_engine_closed(handle, generation),
                Command::Sessions(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown(reply) => {
                    self.teardown();
                    let _ = reply.send(());
                    return;
                }
            }
        }

        self.teardown();
    }

    fn on_attach(&mut self, handle: DeviceHandle) {
        let name = self.transport.product_name(&handle).unwrap_or_default();

        if let Some(mut previous) = self.sessions.remove(&handle) {
            tracing::info!(
                device = %handle,
                name = %name,
                previous = previous.state.as_str(),
                "Device reconnected, restarting session"
            );
            previous.teardown();
        } else {
            tracing::info!(device = %handle, name = %name, "Device connected");
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.sessions.insert(
            handle.clone(),
            DeviceSession {
                generation,
                state: SessionState::Opening,
                engine: None,
            },
        );

        if self.transport.is_open(&handle) {
            self.start_polling(&handle, generation);
            return;
        }

        let transport = self.transport.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = transport.open(&handle).await;
            let opened = result.is_ok();
            let delivered = send(
                &commands,
                Command::OpenResolved {
                    handle: handle.clone(),
                    generation,
                    result,
                },
            );
            if opened && !delivered {
                tracing::debug!(device = %handle, "Manager stopped while opening, closing device");
                transport.close(&handle);
            }
        });
    }

    fn on_open_resolved(&mut self, handle: DeviceHandle, generation: u64, result: Result<(), TransportError>) {
        let current = self
            .sessions
            .get(&handle)
            .map(|session| (session.generation, session.state));

        match current {
            Some((g, SessionState::Opening)) if g == generation => match result {
                Ok(()) => self.start_polling(&handle, generation),
                Err(e) => {
                    tracing::warn!(device = %handle, error = %e, "Failed to open device");
                    self.sessions.remove(&handle);
                    // a superseded open may have succeeded
                    if self.transport.is_open(&handle) {
                        self.transport.close(&handle);
                    }
                }
            },
            Some(_) => {
                tracing::debug!(device = %handle, generation, "Ignoring open result of superseded session");
            }
            None => {
                tracing::debug!(device = %handle, "Device detached while opening, not polling");
                if result.is_ok() {
                    self.transport.close(&handle);
                }
            }
        }
    }

    fn start_polling(&mut self, handle: &DeviceHandle, generation: u64) {
        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };

        let commands = self.commands.clone();
        let closed_handle = handle.clone();
        let engine = PollingEngine::start(
            handle.clone(),
            self.transport.clone(),
            self.sink.clone(),
            &self.polling,
            move || {
                send(
                    &commands,
                    Command::EngineClosed {
                        handle: closed_handle,
                        generation,
                    },
                );
            },
        );

        session.state = SessionState::Polling;
        session.engine = Some(engine);
        tracing::info!(device = %handle, "Device open, polling");
    }

    fn on_detach(&mut self, handle: DeviceHandle) {
        let name = self.transport.product_name(&handle).unwrap_or_default();

        match self.sessions.remove(&handle) {
            Some(mut session) => {
                tracing::info!(
                    device = %handle,
                    name = %name,
                    state = session.state.as_str(),
                    "Device disconnected"
                );
                session.teardown();
                self.transport.close(&handle);
            }
            None => tracing::debug!(device = %handle, "Detach for unknown device"),
        }
    }

    fn on_engine_closed(&mut self, handle: DeviceHandle, generation: u64) {
        let matches = self
            .sessions
            .get(&handle)
            .is_some_and(|session| session.generation == generation);

        if matches {
            if let Some(mut session) = self.sessions.remove(&handle) {
                session.teardown();
            }
            self.transport.close(&handle);
            tracing::info!(device = %handle, "Session closed");
        }
    }

    fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|(handle, session)| SessionInfo {
                handle: handle.clone(),
                state: session.state,
                polling: session.engine.as_ref().is_some_and(PollingEngine::is_active),
            })
            .collect();
        sessions.sort_by(|a, b| a.handle.cmp(&b.handle));
        sessions
    }

    fn teardown(&mut self) {
        for (handle, mut session) in self.sessions.drain() {
            session.teardown();
            if session.state == SessionState::Polling {
                self.transport.close(&handle);
            }
        }
        for subscription in self.subscriptions.drain(..) {
            subscription.release();
        }
        tracing::info!("Session manager stopped");
    }
}

/// Queue a command if the manager is still running
fn send(commands: &mpsc::WeakUnboundedSender<Command>, command: Command) -> bool {
    commands
        .upgrade()
        .is_some_and(|tx| tx.send(command).is_ok())
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable access to a running [`SessionManager`]
#[derive(Clone)]
pub struct SessionManagerHandle {
    transport: Arc<dyn Transport>,
    filter: DeviceFilter,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl SessionManagerHandle {
    /// Whether the environment supports the device transport at all
    ///
    /// Callers should hide knob-related UI when this is false.
    pub fn is_available(&self) -> bool {
        self.commands.is_some()
    }

    /// Ask the transport for a new device of the configured class and attach it
    ///
    /// Returns the handles that were granted; an empty list means nothing was
    /// selected.
    pub async fn request_device(&self) -> Result<Vec<DeviceHandle>, SessionError> {
        let commands = self.commands.as_ref().ok_or(SessionError::Unavailable)?;

        let devices = self.transport.request_new_device(self.filter).await?;
        if devices.is_empty() {
            tracing::info!(filter = %self.filter, "No device selected");
        }

        for handle in &devices {
            commands
                .send(Command::Attach(handle.clone()))
                .map_err(|_| SessionError::Stopped)?;
        }
        Ok(devices)
    }

    /// Snapshot of all registered sessions, sorted by handle
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let Some(commands) = &self.commands else {
            return Vec::new();
        };

        let (reply, rx) = oneshot::channel();
        if commands.send(Command::Sessions(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn session_state(&self, handle: &DeviceHandle) -> Option<SessionState> {
        self.sessions()
            .await
            .into_iter()
            .find(|info| &info.handle == handle)
            .map(|info| info.state)
    }

    /// Whether at least one device is registered
    pub async fn is_connected(&self) -> bool {
        !self.sessions().await.is_empty()
    }

    /// Stop all polling, close devices and release transport subscriptions
    pub async fn shutdown(&self) {
        let Some(commands) = &self.commands else {
            return;
        };

        let (reply, rx) = oneshot::channel();
        if commands.send(Command::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Session manager error type
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Device transport is not available in this environment
    #[error("Device transport unavailable")]
    Unavailable,
    /// Manager task has shut down
    #[error("Session manager stopped")]
    Stopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
}
