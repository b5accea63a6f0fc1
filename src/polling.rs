//! Per-device status polling
//!
//! The K-Pod only reports its state when asked. A [`PollingEngine`] owns one
//! timer task per open device that sends a status request every poll
//! interval, and a report subscription that feeds every input report through
//! the decoder into the event sink. Reports are not paired with requests; they
//! are handled whenever they arrive.
//!
//! Device closure is detected by sampling `is_open` on every tick.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::PollingConfig;
use crate::report::{self, COMMAND_REPORT_ID, STATUS_REQUEST};
use crate::sink::EventSink;
use crate::transport::{DeviceHandle, InputReport, Subscription, Transport};

/// Recurring status poll for one device
pub struct PollingEngine {
    handle: DeviceHandle,
    task: Option<JoinHandle<()>>,
    reports: Option<Subscription>,
}

impl PollingEngine {
    /// Start polling a device
    ///
    /// Sends one status request right away, then one per interval.
    /// `on_closed` runs once if a tick finds the device no longer open; the
    /// schedule has already stopped by then.
    pub fn start<F>(
        handle: DeviceHandle,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        config: &PollingConfig,
        on_closed: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let report_handle = handle.clone();
        let reports = transport.on_input_report(
            &handle,
            Box::new(move |report: InputReport| forward_report(&report_handle, &report, sink.as_ref())),
        );

        let period = config.interval();
        let task = tokio::spawn(poll_loop(handle.clone(), transport, period, on_closed));

        tracing::debug!(device = %handle, interval_ms = config.poll_interval_ms, "Polling started");

        Self {
            handle,
            task: Some(task),
            reports: Some(reports),
        }
    }

    /// Stop polling; safe to call any number of times
    pub fn stop(&mut self) {
        let had_task = match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        };
        if let Some(reports) = self.reports.take() {
            reports.release();
        }
        if had_task {
            tracing::debug!(device = %self.handle, "Polling stopped");
        }
    }

    /// Whether the poll schedule is still running
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }
}

impl Drop for PollingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop<F>(
    handle: DeviceHandle,
    transport: Arc<dyn Transport>,
    period: std::time::Duration,
    on_closed: F,
) where
    F: FnOnce() + Send + 'static,
{
    let mut failing = false;

    request_status(&handle, transport.as_ref(), &mut failing).await;

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if !transport.is_open(&handle) {
            tracing::info!(device = %handle, "Device no longer open, stopping poll");
            on_closed();
            return;
        }

        request_status(&handle, transport.as_ref(), &mut failing).await;
    }
}

/// Send one status request; failures are logged and otherwise ignored
async fn request_status(handle: &DeviceHandle, transport: &dyn Transport, failing: &mut bool) {
    match transport
        .send_report(handle, COMMAND_REPORT_ID, &STATUS_REQUEST)
        .await
    {
        Ok(()) => {
            if *failing {
                tracing::info!(device = %handle, "Status requests succeeding again");
                *failing = false;
            }
        }
        Err(e) if *failing => {
            tracing::debug!(device = %handle, error = %e, "Status request failed");
        }
        Err(e) => {
            tracing::warn!(device = %handle, error = %e, "Failed to send status request");
            *failing = true;
        }
    }
}

fn forward_report(handle: &DeviceHandle, report: &InputReport, sink: &dyn EventSink) {
    let events = report::decode(&report.data);
    if events.is_empty() {
        return;
    }

    tracing::debug!(
        device = %handle,
        report_id = report.report_id,
        events = events.len(),
        "Input report decoded"
    );

    for event in events {
        sink.dispatch(event);
    }
}
