//! Scripted cameras and in-memory sinks.
//!
//! Drives the whole engine without hardware: integration tests use it, and
//! `mvr record --simulate N` runs a session over synthetic cameras.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::camera::{
    negotiate, CameraSpec, CaptureBackend, CaptureDevice, CaptureError, DeviceIdentity,
    DiscoveryError, FormatPolicy, Frame, NegotiatedFormat, PixelFormat, ReadOutcome, Resolution,
    StreamFormat, SupportedMode,
};
use crate::sinks::{FrameWriter, PreviewSink, RecordingSink, SinkError};

/// Sleep of an idle device (script exhausted) before it reports a timeout.
const IDLE_READ: Duration = Duration::from_millis(10);

/// Initialise a tracing subscriber for tests.
///
/// Respects `RUST_LOG` and defaults to `debug`. Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// One-shot latch a test releases to unblock a [`SimStep::Hold`].
#[derive(Debug, Clone, Default)]
pub struct SimGate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl SimGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut released = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*released {
            released = cvar.wait(released).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// One step of a simulated device's read script.
#[derive(Debug, Clone)]
pub enum SimStep {
    /// Deliver this many good frames, one per frame interval
    Frames(u64),
    /// Deliver a buffer the driver flags as corrupt
    Corrupt,
    /// The driver loses this many buffers before the next one
    DriverDrop(u32),
    /// The next read fails with an I/O error
    Error,
    /// Stall, then report a read timeout
    Delay(Duration),
    /// Block inside the read, ignoring stop requests, until the gate is
    /// released; the read then fails
    Hold(SimGate),
}

/// A scripted camera.
#[derive(Debug, Clone)]
pub struct SimCamera {
    identity: DeviceIdentity,
    script: Vec<SimStep>,
    looping: bool,
    modes: Vec<SupportedMode>,
    busy: bool,
    payload_len: usize,
    frame_interval: Duration,
}

impl SimCamera {
    /// A camera that streams frames forever until stopped.
    pub fn new(device_path: impl Into<PathBuf>, serial: impl Into<String>) -> Self {
        Self {
            identity: DeviceIdentity {
                product: "Simulated Camera".to_string(),
                ..DeviceIdentity::new(device_path, serial)
            },
            script: vec![SimStep::Frames(1)],
            looping: true,
            modes: Vec::new(),
            busy: false,
            payload_len: 1024,
            frame_interval: Duration::from_millis(2),
        }
    }

    pub fn with_usb(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.identity.vendor_id = Some(vendor_id);
        self.identity.product_id = Some(product_id);
        self
    }

    /// Play `steps` once, then idle.
    pub fn with_script(mut self, steps: Vec<SimStep>) -> Self {
        self.script = steps;
        self.looping = false;
        self
    }

    /// Restart the script from the beginning when it runs out.
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    /// Advertise only these modes. Without modes every request is accepted.
    pub fn with_modes(mut self, modes: Vec<SupportedMode>) -> Self {
        self.modes = modes;
        self
    }

    /// Held by another process: every open fails with `DeviceBusy`.
    pub fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    /// Size of compressed payloads. Raw formats always use the full frame size.
    pub fn payload_len(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }
}

/// Capture backend over [`SimCamera`]s.
#[derive(Debug, Default)]
pub struct SimBackend {
    cameras: Vec<SimCamera>,
    open: Arc<Mutex<HashSet<PathBuf>>>,
    opens: AtomicUsize,
}

impl SimBackend {
    pub fn new(cameras: Vec<SimCamera>) -> Self {
        Self {
            cameras,
            ..Self::default()
        }
    }

    /// `count` endless YUYV cameras with serials `SIM0`, `SIM1`, ...
    pub fn synthetic(count: usize, framerate: u32) -> Self {
        let interval = Duration::from_secs(1) / framerate.max(1);
        let cameras = (0..count)
            .map(|i| {
                SimCamera::new(format!("/dev/sim{}", i), format!("SIM{}", i))
                    .with_usb(0x1d6b, 0x0102)
                    .with_modes(vec![
                        SupportedMode::new(PixelFormat::Yuyv, Resolution::VGA, vec![30, 15]),
                        SupportedMode::new(PixelFormat::Yuyv, Resolution::HD, vec![10]),
                    ])
                    .frame_interval(interval)
            })
            .collect();
        Self::new(cameras)
    }

    /// Number of devices currently open.
    pub fn open_devices(&self) -> usize {
        self.open.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of successful opens so far.
    pub fn total_opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn camera(&self, path: &Path) -> Option<&SimCamera> {
        self.cameras.iter().find(|c| c.identity.device_path == path)
    }
}

impl CaptureBackend for SimBackend {
    fn discover(&self) -> Result<Vec<DeviceIdentity>, DiscoveryError> {
        Ok(self.cameras.iter().map(|c| c.identity.clone()).collect())
    }

    fn capabilities(&self, device_path: &Path) -> Result<Vec<SupportedMode>, CaptureError> {
        self.camera(device_path)
            .map(|c| c.modes.clone())
            .ok_or_else(|| CaptureError::DeviceOpenFailed {
                path: device_path.to_path_buf(),
                message: "no such device".to_string(),
            })
    }

    fn open(
        &self,
        spec: &CameraSpec,
        policy: FormatPolicy,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let path = spec.device_path.clone();
        let camera = self
            .camera(&path)
            .ok_or_else(|| CaptureError::DeviceOpenFailed {
                path: path.clone(),
                message: "no such device".to_string(),
            })?;
        if camera.busy {
            return Err(CaptureError::DeviceBusy { path });
        }

        let negotiated = negotiate(spec.format, &camera.modes, policy).map_err(|reason| {
            CaptureError::UnsupportedFormat {
                path: path.clone(),
                reason,
            }
        })?;

        if !self
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.clone())
        {
            return Err(CaptureError::DeviceBusy { path });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        let format = negotiated.format;
        let payload_len = format
            .pixel_format
            .frame_size(format.resolution)
            .filter(|_| !format.pixel_format.is_compressed())
            .unwrap_or(camera.payload_len);

        Ok(Box::new(SimDevice {
            steps: camera.script.clone(),
            looping: camera.looping,
            cursor: 0,
            emitted: 0,
            pending_drop: 0,
            counter: 0,
            frame_interval: camera.frame_interval,
            payload_len,
            negotiated,
            _guard: OpenGuard {
                path,
                open: Arc::clone(&self.open),
            },
        }))
    }
}

/// Marks a device closed when the worker drops it.
struct OpenGuard {
    path: PathBuf,
    open: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.path);
    }
}

struct SimDevice {
    steps: Vec<SimStep>,
    looping: bool,
    cursor: usize,
    /// Frames delivered from the current `Frames` step
    emitted: u64,
    pending_drop: u32,
    counter: u64,
    frame_interval: Duration,
    payload_len: usize,
    negotiated: NegotiatedFormat,
    _guard: OpenGuard,
}

impl SimDevice {
    fn current(&mut self) -> Option<SimStep> {
        if self.cursor >= self.steps.len() {
            if !self.looping || self.steps.is_empty() {
                return None;
            }
            self.cursor = 0;
        }
        Some(self.steps[self.cursor].clone())
    }

    fn advance(&mut self) {
        self.cursor += 1;
        self.emitted = 0;
    }

    /// Moving gradient for YUYV, filler bytes otherwise.
    fn payload(&mut self) -> Vec<u8> {
        self.counter += 1;
        let shift = self.counter as usize;
        (0..self.payload_len)
            .map(|i| {
                if i % 2 == 0 {
                    ((i / 2 + shift) % 256) as u8
                } else {
                    128
                }
            })
            .collect()
    }
}

impl CaptureDevice for SimDevice {
    fn format(&self) -> NegotiatedFormat {
        self.negotiated
    }

    fn read(&mut self) -> io::Result<ReadOutcome> {
        loop {
            let Some(step) = self.current() else {
                thread::sleep(IDLE_READ);
                return Ok(ReadOutcome::TimedOut);
            };
            match step {
                SimStep::Frames(count) => {
                    if self.emitted >= count {
                        self.advance();
                        continue;
                    }
                    self.emitted += 1;
                    thread::sleep(self.frame_interval);
                    let data = self.payload();
                    return Ok(ReadOutcome::Buffer {
                        data,
                        dropped_before: std::mem::take(&mut self.pending_drop),
                    });
                }
                SimStep::Corrupt => {
                    self.advance();
                    thread::sleep(self.frame_interval);
                    return Ok(ReadOutcome::Corrupt {
                        reason: "simulated corrupt buffer".to_string(),
                        dropped_before: std::mem::take(&mut self.pending_drop),
                    });
                }
                SimStep::DriverDrop(count) => {
                    self.advance();
                    self.pending_drop += count;
                }
                SimStep::Error => {
                    self.advance();
                    return Err(io::Error::new(io::ErrorKind::Other, "simulated I/O error"));
                }
                SimStep::Delay(duration) => {
                    self.advance();
                    thread::sleep(duration);
                    return Ok(ReadOutcome::TimedOut);
                }
                SimStep::Hold(gate) => {
                    self.advance();
                    gate.wait();
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "simulated device closed",
                    ));
                }
            }
        }
    }
}

/// One frame as seen by a [`MemoryRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFrame {
    pub sequence_number: u64,
    pub payload_length: usize,
    pub capture_timestamp: Instant,
    pub written_at: Instant,
}

/// Everything a [`MemoryRecorder`] saw for one camera.
#[derive(Debug, Clone)]
pub struct Recording {
    pub camera: String,
    pub path: PathBuf,
    pub format: StreamFormat,
    pub frames: Vec<RecordedFrame>,
    pub opens: usize,
    pub closes: usize,
}

/// Recording sink keeping frame metadata in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    recordings: Arc<Mutex<BTreeMap<String, Recording>>>,
    fail_open: HashSet<String>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `open` fail for `camera`.
    pub fn failing_open(mut self, camera: impl Into<String>) -> Self {
        self.fail_open.insert(camera.into());
        self
    }

    pub fn recording(&self, camera: &str) -> Option<Recording> {
        self.recordings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(camera)
            .cloned()
    }

    pub fn cameras(&self) -> Vec<String> {
        self.recordings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl RecordingSink for MemoryRecorder {
    fn open(
        &self,
        camera_name: &str,
        output_path: &Path,
        format: StreamFormat,
    ) -> Result<Box<dyn FrameWriter>, SinkError> {
        if self.fail_open.contains(camera_name) {
            return Err(SinkError::Rejected(format!(
                "{} is not writable",
                output_path.display()
            )));
        }
        let mut recordings = self.recordings.lock().unwrap_or_else(|e| e.into_inner());
        let entry = recordings
            .entry(camera_name.to_string())
            .or_insert_with(|| Recording {
                camera: camera_name.to_string(),
                path: output_path.to_path_buf(),
                format,
                frames: Vec::new(),
                opens: 0,
                closes: 0,
            });
        entry.opens += 1;
        Ok(Box::new(MemoryWriter {
            camera: camera_name.to_string(),
            recordings: Arc::clone(&self.recordings),
        }))
    }
}

struct MemoryWriter {
    camera: String,
    recordings: Arc<Mutex<BTreeMap<String, Recording>>>,
}

impl MemoryWriter {
    fn with_recording(&self, f: impl FnOnce(&mut Recording)) {
        let mut recordings = self.recordings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(recording) = recordings.get_mut(&self.camera) {
            f(recording);
        }
    }
}

impl FrameWriter for MemoryWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let recorded = RecordedFrame {
            sequence_number: frame.sequence_number,
            payload_length: frame.payload_length(),
            capture_timestamp: frame.capture_timestamp,
            written_at: Instant::now(),
        };
        self.with_recording(|r| r.frames.push(recorded));
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), SinkError> {
        self.with_recording(|r| r.closes += 1);
        Ok(())
    }
}

/// Preview sink recording every update, optionally slow or quitting.
#[derive(Debug, Clone, Default)]
pub struct CollectingPreview {
    updates: Arc<Mutex<Vec<(String, u64)>>>,
    delay: Duration,
    quit_after: Option<usize>,
}

impl CollectingPreview {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `update`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report a user quit once this many updates have been seen.
    pub fn quit_after(mut self, updates: usize) -> Self {
        self.quit_after = Some(updates);
        self
    }

    /// `(camera, sequence)` of every update so far.
    pub fn updates(&self) -> Vec<(String, u64)> {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl PreviewSink for CollectingPreview {
    fn update(&mut self, camera_name: &str, frame: &Frame) {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((camera_name.to_string(), frame.sequence_number));
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
    }

    fn poll_user_quit(&mut self) -> bool {
        self.quit_after.is_some_and(|n| {
            self.updates.lock().unwrap_or_else(|e| e.into_inner()).len() >= n
        })
    }
}
