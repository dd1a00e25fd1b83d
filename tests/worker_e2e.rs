//! Tests for a single capture worker driven directly through its handle.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use multiview_recorder::camera::{
    CameraSpec, CaptureBackend, CaptureError, DeviceIdentity, StreamFormat, WorkerContext,
    WorkerEvent, WorkerHandle, WorkerOptions, WorkerState,
};
use multiview_recorder::cancel::CancelToken;
use multiview_recorder::distributor::{Delivery, FrameDistributor, Next, Subscription};
use multiview_recorder::sim::{init_test_logging, SimBackend, SimCamera};

fn spec(name: &str) -> CameraSpec {
    CameraSpec::from_identity(
        &DeviceIdentity::new("/dev/video0", "A1"),
        name,
        StreamFormat::default(),
    )
}

fn start(
    backend: Arc<dyn CaptureBackend>,
    name: &str,
    preview: bool,
) -> (WorkerHandle, Receiver<WorkerEvent>, Option<Subscription>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut distributor = FrameDistributor::new(name);
    let feed = preview.then(|| distributor.subscribe("preview", Delivery::LatestWins));
    let ctx = WorkerContext {
        backend,
        distributor,
        recording: None,
        options: WorkerOptions::default(),
        events: tx,
    };
    (WorkerHandle::start(spec(name), ctx, CancelToken::new()), rx, feed)
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_stop_is_idempotent_and_reported_once() {
    init_test_logging();
    let backend = Arc::new(SimBackend::new(vec![SimCamera::new("/dev/video0", "A1")]));
    let (handle, events, _) = start(backend.clone(), "cam", false);
    assert_eq!(handle.name(), "cam");

    assert!(wait_for(Duration::from_secs(2), || {
        handle.poll_status() == WorkerState::Streaming
    }));
    handle.stop();
    handle.stop();
    assert!(wait_for(Duration::from_secs(2), || handle.is_finished()));
    assert_eq!(handle.poll_status(), WorkerState::Stopped);

    // Still safe once terminal.
    handle.stop();
    let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(event.camera, "cam");
    assert_eq!(event.state, WorkerState::Stopped);
    assert!(event.stats.frames_captured > 0);
    assert!(events.try_recv().is_err());

    handle.join();
    assert_eq!(backend.open_devices(), 0);
}

#[test]
fn test_second_worker_on_same_device_is_busy() {
    init_test_logging();
    let backend = Arc::new(SimBackend::new(vec![SimCamera::new("/dev/video0", "A1")]));
    let (first, first_events, _) = start(backend.clone(), "first", false);
    assert!(wait_for(Duration::from_secs(2), || {
        first.poll_status() == WorkerState::Streaming
    }));

    let (second, second_events, _) = start(backend.clone(), "second", false);
    let event = second_events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(
        event.state,
        WorkerState::Failed(CaptureError::DeviceBusy { .. })
    ));
    assert_eq!(event.stats.frames_captured, 0);
    second.join();

    // The failed open did not disturb the running worker.
    assert_eq!(first.poll_status(), WorkerState::Streaming);
    first.stop();
    first.join();
    assert_eq!(
        first_events.recv_timeout(Duration::from_secs(1)).unwrap().state,
        WorkerState::Stopped
    );
}

#[test]
fn test_preview_feed_closes_with_the_worker() {
    init_test_logging();
    let backend = Arc::new(SimBackend::new(vec![SimCamera::new("/dev/video0", "A1")]));
    let (handle, _events, feed) = start(backend, "cam", true);
    let feed = feed.unwrap();

    let mut seen = Vec::new();
    assert!(wait_for(Duration::from_secs(2), || {
        if let Next::Frame(frame) = feed.recv_timeout(Duration::ZERO) {
            seen.push(frame.sequence_number);
        }
        seen.len() >= 3
    }));
    assert!(seen.windows(2).all(|w| w[0] < w[1]));

    handle.stop();
    handle.join();
    // Drain a frame that may still sit in the slot.
    let _ = feed.recv_timeout(Duration::ZERO);
    assert!(matches!(feed.recv_timeout(Duration::ZERO), Next::Closed));
}
