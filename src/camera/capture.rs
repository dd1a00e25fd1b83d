//! Capture worker handle and lifecycle.
//!
//! A worker owns one device for its whole life. It runs on its own thread,
//! publishes its state through a [`StatusCell`], and reports its terminal
//! state to the session exactly once through a [`WorkerEvent`].

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;

use super::capture_loop::{run_capture_loop, LoopExit};
use super::device::CaptureBackend;
use super::errors::CaptureError;
use super::format::{FormatDeviation, FormatPolicy};
use super::types::{CameraSpec, StreamFormat};
use crate::cancel::CancelToken;
use crate::distributor::{Delivery, FrameDistributor};
use crate::sinks::{RecordingSink, RecordingWriter};

/// Lifecycle state of a capture worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Streaming,
    Draining,
    Stopped,
    Failed(CaptureError),
}

impl WorkerState {
    /// `Stopped` and `Failed` are terminal: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed(_))
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Initializing => write!(f, "initializing"),
            WorkerState::Streaming => write!(f, "streaming"),
            WorkerState::Draining => write!(f, "draining"),
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::Failed(e) => write!(f, "failed ({})", e.kind()),
        }
    }
}

/// Running counters of one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Sequence number of the last published frame
    pub last_sequence: Option<u64>,
    pub frames_captured: u64,
    /// Sequence numbers skipped for dropped or corrupt buffers
    pub frames_skipped: u64,
    /// Frames the recording queue dropped after its bounded wait
    pub recording_dropped: u64,
    /// Format the device actually streams with
    pub negotiated: Option<StreamFormat>,
    pub format_deviation: Option<FormatDeviation>,
}

/// Single-writer status slot shared between a worker and the session.
#[derive(Debug)]
pub struct StatusCell {
    inner: Mutex<(WorkerState, WorkerStats)>,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self {
            inner: Mutex::new((WorkerState::Initializing, WorkerStats::default())),
        }
    }
}

impl StatusCell {
    /// Move to `next`. Returns `false` (and changes nothing) if the current
    /// state is already terminal.
    pub(crate) fn transition(&self, next: WorkerState) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.0.is_terminal() {
            return false;
        }
        guard.0 = next;
        true
    }

    pub(crate) fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard.1);
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).0.clone()
    }

    pub fn snapshot(&self) -> (WorkerState, WorkerStats) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Terminal report sent by every worker exactly once.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub camera: String,
    pub state: WorkerState,
    pub stats: WorkerStats,
}

/// Tuning for capture workers.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub policy: FormatPolicy,
    /// Consecutive read errors tolerated before the worker fails
    pub max_consecutive_errors: u32,
    /// Pause between read retries
    pub retry_delay: Duration,
    pub record_queue_depth: usize,
    /// How long `publish` may wait for room in the recording queue
    pub record_wait: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            policy: FormatPolicy::Strict,
            max_consecutive_errors: 3,
            retry_delay: Duration::from_millis(100),
            record_queue_depth: 64,
            record_wait: Duration::from_millis(200),
        }
    }
}

/// Where a worker records to.
#[derive(Clone)]
pub struct RecordingTarget {
    pub sink: Arc<dyn RecordingSink>,
    pub output_path: PathBuf,
}

impl fmt::Debug for RecordingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingTarget")
            .field("output_path", &self.output_path)
            .finish_non_exhaustive()
    }
}

/// Everything a worker thread needs.
pub struct WorkerContext {
    pub backend: Arc<dyn CaptureBackend>,
    pub distributor: FrameDistributor,
    pub recording: Option<RecordingTarget>,
    pub options: WorkerOptions,
    pub events: Sender<WorkerEvent>,
}

/// Handle to a running capture worker.
pub struct WorkerHandle {
    name: String,
    status: Arc<StatusCell>,
    token: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("state", &self.status.state())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Spawn a worker for `spec`.
    ///
    /// `token` should be a child of the session token. If the thread cannot
    /// be spawned the worker is immediately `Failed` and its event is sent.
    pub fn start(spec: CameraSpec, ctx: WorkerContext, token: CancelToken) -> WorkerHandle {
        let name = spec.name.clone();
        let status = Arc::new(StatusCell::default());
        let events = ctx.events.clone();

        let thread_status = Arc::clone(&status);
        let thread_token = token.clone();
        let spawned = thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || {
                let mut report = TerminalReport {
                    camera: spec.name.clone(),
                    status: thread_status,
                    events: ctx.events.clone(),
                    finished: false,
                };
                let state = run_worker(&spec, ctx, &report.status, &thread_token);
                report.finish(state);
            });

        let thread = match spawned {
            Ok(thread) => Some(thread),
            Err(e) => {
                let state = WorkerState::Failed(CaptureError::Spawn {
                    message: e.to_string(),
                });
                status.transition(state.clone());
                let _ = events.send(WorkerEvent {
                    camera: name.clone(),
                    state,
                    stats: WorkerStats::default(),
                });
                None
            }
        };

        WorkerHandle {
            name,
            status,
            token,
            thread,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop. Idempotent, and safe in any state.
    pub fn stop(&self) {
        if self.token.cancel() {
            log::debug!("{}: stop requested", self.name);
        }
    }

    pub fn poll_status(&self) -> WorkerState {
        self.status.state()
    }

    pub fn snapshot(&self) -> (WorkerState, WorkerStats) {
        self.status.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the worker thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Sends the terminal event when the worker thread ends, even by panic.
struct TerminalReport {
    camera: String,
    status: Arc<StatusCell>,
    events: Sender<WorkerEvent>,
    finished: bool,
}

impl TerminalReport {
    fn finish(&mut self, state: WorkerState) {
        self.status.transition(state);
        self.send();
    }

    fn send(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let (state, stats) = self.status.snapshot();
        match &state {
            WorkerState::Stopped => log::info!(
                "{}: stopped after {} frames (last sequence {:?})",
                self.camera,
                stats.frames_captured,
                stats.last_sequence
            ),
            WorkerState::Failed(e) => log::error!(
                "{}: failed [{}] {} (last sequence {:?})",
                self.camera,
                e.kind(),
                e,
                stats.last_sequence
            ),
            _ => {}
        }
        let _ = self.events.send(WorkerEvent {
            camera: self.camera.clone(),
            state,
            stats,
        });
    }
}

impl Drop for TerminalReport {
    fn drop(&mut self) {
        if !self.finished {
            self.status
                .transition(WorkerState::Failed(CaptureError::WorkerPanicked));
            self.send();
        }
    }
}

fn run_worker(
    spec: &CameraSpec,
    ctx: WorkerContext,
    status: &StatusCell,
    token: &CancelToken,
) -> WorkerState {
    let WorkerContext {
        backend,
        mut distributor,
        recording,
        options,
        events: _,
    } = ctx;

    log::debug!("{}: opening {}", spec.name, spec.device_path.display());
    let mut device = match backend.open(spec, options.policy) {
        Ok(device) => device,
        Err(e) => return WorkerState::Failed(e),
    };

    let negotiated = device.format();
    if let Some(deviation) = negotiated.deviation {
        log::warn!(
            "{}: requested {} but streaming {}",
            spec.name,
            deviation.requested,
            deviation.actual
        );
    }
    status.update_stats(|s| {
        s.negotiated = Some(negotiated.format);
        s.format_deviation = negotiated.deviation;
    });

    let writer = match recording {
        Some(target) => {
            let opened = target
                .sink
                .open(&spec.name, &target.output_path, negotiated.format);
            let sink_writer = match opened {
                Ok(w) => w,
                Err(e) => {
                    return WorkerState::Failed(CaptureError::RecordingOpenFailed {
                        path: target.output_path,
                        message: e.to_string(),
                    })
                }
            };
            let subscription = distributor.subscribe(
                "recording",
                Delivery::Reliable {
                    capacity: options.record_queue_depth,
                    max_wait: options.record_wait,
                },
            );
            match RecordingWriter::spawn(&spec.name, sink_writer, subscription) {
                Ok(w) => Some(w),
                Err(e) => {
                    return WorkerState::Failed(CaptureError::Spawn {
                        message: e.to_string(),
                    })
                }
            }
        }
        None => None,
    };

    status.transition(WorkerState::Streaming);
    log::info!("{}: streaming {}", spec.name, negotiated.format);

    let exit = run_capture_loop(
        &spec.name,
        device.as_mut(),
        &mut distributor,
        status,
        token,
        &options,
    );

    status.transition(WorkerState::Draining);
    drop(device);
    log::debug!("{}: device released", spec.name);
    drop(distributor);

    let recorded = writer.map(RecordingWriter::finish);
    match (exit, recorded) {
        (LoopExit::Failed(e), _) => WorkerState::Failed(e),
        (_, Some(Err(e))) => WorkerState::Failed(CaptureError::RecordingFailed {
            message: e.to_string(),
        }),
        (LoopExit::RecordingClosed, _) => WorkerState::Failed(CaptureError::RecordingFailed {
            message: "recording stopped accepting frames".to_string(),
        }),
        (LoopExit::Cancelled, _) => WorkerState::Stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_sticky() {
        let cell = StatusCell::default();
        assert!(cell.transition(WorkerState::Streaming));
        assert!(cell.transition(WorkerState::Stopped));
        assert!(!cell.transition(WorkerState::Streaming));
        assert!(!cell.transition(WorkerState::Failed(CaptureError::WorkerPanicked)));
        assert_eq!(cell.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_report_is_sent_once_on_panic() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let status = Arc::new(StatusCell::default());
        let report = TerminalReport {
            camera: "cam".to_string(),
            status: Arc::clone(&status),
            events: tx,
            finished: false,
        };
        let result = thread::spawn(move || {
            let _report = report;
            panic!("boom");
        })
        .join();
        assert!(result.is_err());
        let event = rx.recv().unwrap();
        assert_eq!(event.state, WorkerState::Failed(CaptureError::WorkerPanicked));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Streaming.to_string(), "streaming");
        let failed = WorkerState::Failed(CaptureError::TransientIo {
            attempts: 3,
            message: "gone".to_string(),
        });
        assert_eq!(failed.to_string(), "failed (TransientIOError)");
    }
}
