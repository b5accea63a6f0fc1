//! Event sinks
//!
//! Decoded knob events are handed to an [`EventSink`]. Dispatch must not block
//! and cannot fail; sinks that need async work queue the event instead.

use std::io::Write;

use tokio::sync::mpsc;

use crate::report::KnobEvent;

/// Consumer of decoded knob events
pub trait EventSink: Send + Sync + 'static {
    fn dispatch(&self, event: KnobEvent);
}

impl EventSink for mpsc::UnboundedSender<KnobEvent> {
    fn dispatch(&self, event: KnobEvent) {
        if self.send(event).is_err() {
            tracing::debug!(?event, "Event receiver dropped, discarding event");
        }
    }
}

/// Logs every event at info level
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn dispatch(&self, event: KnobEvent) {
        match event {
            KnobEvent::EncoderTurn { delta, scale } => {
                tracing::info!(delta, scale = %scale, "Encoder turned");
            }
            KnobEvent::ButtonPress { index } => {
                tracing::info!(index, "Button pressed");
            }
        }
    }
}

/// Writes one JSON object per event to stdout
///
/// Meant for piping into a receiver-control process.
#[derive(Debug, Default)]
pub struct JsonLinesSink;

impl EventSink for JsonLinesSink {
    fn dispatch(&self, event: KnobEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize event");
                return;
            }
        };

        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", line).and_then(|_| stdout.flush()) {
            tracing::warn!(error = %e, "Failed to write event to stdout");
        }
    }
}
