//! Polling engine behaviour in isolation

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;

use common::{settle, status_report, MockTransport};
use kpodd::{DeviceHandle, KnobEvent, PollingConfig, PollingEngine, ScaleHint};

fn open_device(transport: &MockTransport) -> DeviceHandle {
    let device = DeviceHandle::new("/dev/hidraw0");
    transport.mark_open(&device);
    device
}

fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = count.clone();
    (count, move || {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test(start_paused = true)]
async fn test_immediate_request_then_interval() {
    let transport = MockTransport::new();
    let device = open_device(&transport);
    let (tx, _rx) = mpsc::unbounded_channel::<KnobEvent>();

    let mut engine = PollingEngine::start(
        device.clone(),
        transport.clone(),
        Arc::new(tx),
        &PollingConfig::new(100),
        || {},
    );
    settle().await;
    assert_eq!(transport.send_count(&device), 1);
    assert!(engine.is_active());

    sleep(Duration::from_millis(60)).await;
    assert_eq!(transport.send_count(&device), 1);

    sleep(Duration::from_millis(40)).await;
    assert_eq!(transport.send_count(&device), 2);

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let transport = MockTransport::new();
    let device = open_device(&transport);
    let (tx, _rx) = mpsc::unbounded_channel::<KnobEvent>();

    let mut engine = PollingEngine::start(
        device.clone(),
        transport.clone(),
        Arc::new(tx),
        &PollingConfig::default(),
        || {},
    );
    settle().await;

    engine.stop();
    engine.stop();
    assert!(!engine.is_active());
    assert_eq!(transport.report_subscribers(&device), 0);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.send_count(&device), 1);

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_drop_stops_polling() {
    let transport = MockTransport::new();
    let device = open_device(&transport);
    let (tx, _rx) = mpsc::unbounded_channel::<KnobEvent>();

    let engine = PollingEngine::start(
        device.clone(),
        transport.clone(),
        Arc::new(tx),
        &PollingConfig::default(),
        || {},
    );
    settle().await;
    drop(engine);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.send_count(&device), 1);
    assert_eq!(transport.report_subscribers(&device), 0);
}

#[tokio::test(start_paused = true)]
async fn test_closure_detected_on_tick() {
    let transport = MockTransport::new();
    let device = open_device(&transport);
    let (tx, _rx) = mpsc::unbounded_channel::<KnobEvent>();
    let (closed, on_closed) = counter();

    let mut engine = PollingEngine::start(
        device.clone(),
        transport.clone(),
        Arc::new(tx),
        &PollingConfig::default(),
        on_closed,
    );
    settle().await;

    transport.vanish(&device);
    // closure is only sampled on the next tick
    assert_eq!(closed.load(Ordering::SeqCst), 0);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(!engine.is_active());

    sleep(Duration::from_millis(200)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(transport.send_count(&device), 1);

    engine.stop();
    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_reports_forwarded_between_ticks() {
    let transport = MockTransport::new();
    let device = open_device(&transport);
    let (tx, mut rx) = mpsc::unbounded_channel::<KnobEvent>();

    let mut engine = PollingEngine::start(
        device.clone(),
        transport.clone(),
        Arc::new(tx),
        &PollingConfig::default(),
        || {},
    );

    // before the immediate request has even gone out
    transport.emit_report(&device, &status_report(-1, 0b0010_0000));
    assert_eq!(
        rx.try_recv().unwrap(),
        KnobEvent::EncoderTurn { delta: -1, scale: ScaleHint::Fine }
    );

    settle().await;
    transport.emit_report(&device, &status_report(0, 0x05));
    transport.emit_report(&device, &status_report(0, 0x15));
    assert_eq!(rx.try_recv().unwrap(), KnobEvent::ButtonPress { index: 5 });
    assert!(rx.try_recv().is_err());

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_does_not_stop_engine() {
    let transport = MockTransport::new();
    let device = open_device(&transport);
    transport.fail_sends(true);
    let (tx, _rx) = mpsc::unbounded_channel::<KnobEvent>();
    let (closed, on_closed) = counter();

    let mut engine = PollingEngine::start(
        device.clone(),
        transport.clone(),
        Arc::new(tx),
        &PollingConfig::default(),
        on_closed,
    );
    settle().await;
    sleep(Duration::from_millis(150)).await;

    assert!(engine.is_active());
    assert_eq!(transport.send_count(&device), 4);
    assert_eq!(closed.load(Ordering::SeqCst), 0);

    engine.stop();
}
