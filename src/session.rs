//! Session orchestration.
//!
//! A [`Session`] starts one capture worker per camera, all at once, plus one
//! preview thread. It then waits for the workers to end on their own or for
//! cancellation (Ctrl+C, a user quit in the preview, or
//! [`Session::cancel_token`]). On cancellation every worker is stopped and
//! given `shutdown_timeout` to reach a terminal state; stragglers are
//! abandoned and reported as [`Terminal::ShutdownTimeout`].

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;

use crate::camera::{
    CameraSpec, CaptureBackend, CaptureError, FormatDeviation, RecordingTarget, WorkerContext,
    WorkerEvent, WorkerHandle, WorkerOptions, WorkerState, WorkerStats,
};
use crate::cancel::CancelToken;
use crate::distributor::{Delivery, FrameDistributor};
use crate::sinks::{spawn_preview, PreviewSink, RecordingSink};

/// Control loop tick while waiting for worker events.
const TICK: Duration = Duration::from_millis(50);

/// How long to wait for the preview thread once all workers are done.
const PREVIEW_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Session-wide settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub output_dir: PathBuf,
    /// Output file extension
    pub container: String,
    /// Exit successfully only if every camera stopped cleanly
    pub require_all: bool,
    pub shutdown_timeout: Duration,
    pub preview_interval: Duration,
    pub worker: WorkerOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            container: "mkv".to_string(),
            require_all: false,
            shutdown_timeout: Duration::from_secs(5),
            preview_interval: Duration::from_millis(33),
            worker: WorkerOptions::default(),
        }
    }
}

impl SessionOptions {
    /// `<output_dir>/<camera>.<container>`
    pub fn output_path(&self, camera: &str) -> PathBuf {
        self.output_dir.join(format!("{}.{}", camera, self.container))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no cameras to record")]
    NoCameras,

    #[error("camera name '{0}' is used more than once")]
    DuplicateCameraName(String),

    #[error("failed to create output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start preview: {0}")]
    Preview(#[source] std::io::Error),
}

/// How a camera's worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Stopped,
    Failed(CaptureError),
    /// Still running when the shutdown timeout expired; abandoned
    ShutdownTimeout,
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Stopped => write!(f, "stopped"),
            Terminal::Failed(e) => write!(f, "failed: {}: {}", e.kind(), e),
            Terminal::ShutdownTimeout => write!(f, "shutdown timeout"),
        }
    }
}

/// Final report for one camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraOutcome {
    pub terminal: Terminal,
    pub last_sequence: Option<u64>,
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub recording_dropped: u64,
    pub format_deviation: Option<FormatDeviation>,
    /// Recording file, when the session was recording
    pub output_path: Option<PathBuf>,
}

impl CameraOutcome {
    fn new(terminal: Terminal, stats: WorkerStats, output_path: Option<PathBuf>) -> Self {
        Self {
            terminal,
            last_sequence: stats.last_sequence,
            frames_captured: stats.frames_captured,
            frames_skipped: stats.frames_skipped,
            recording_dropped: stats.recording_dropped,
            format_deviation: stats.format_deviation,
            output_path,
        }
    }
}

/// Outcome of a whole session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionResult {
    pub per_camera_outcome: BTreeMap<String, CameraOutcome>,
    /// Whether the session ended because of a stop request
    pub interrupted: bool,
}

impl SessionResult {
    /// With `require_all` every camera must have stopped cleanly; otherwise
    /// one is enough.
    pub fn succeeded(&self, require_all: bool) -> bool {
        let mut outcomes = self.per_camera_outcome.values();
        if require_all {
            !self.per_camera_outcome.is_empty()
                && outcomes.all(|o| o.terminal == Terminal::Stopped)
        } else {
            outcomes.any(|o| o.terminal == Terminal::Stopped)
        }
    }

    /// Process exit code: 0 on success, 1 otherwise.
    pub fn exit_code(&self, require_all: bool) -> i32 {
        if self.succeeded(require_all) {
            0
        } else {
            1
        }
    }

    /// Human-readable table, one row per camera.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{:<16} {:>10} {:>8} {:>8} {:>8}  {}",
            "CAMERA", "LAST SEQ", "FRAMES", "SKIPPED", "DROPPED", "RESULT"
        )];
        for (name, o) in &self.per_camera_outcome {
            let last = o
                .last_sequence
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            let mut result = o.terminal.to_string();
            if let Some(deviation) = &o.format_deviation {
                result.push_str(&format!(" (format {} instead of {})", deviation.actual, deviation.requested));
            }
            lines.push(format!(
                "{:<16} {:>10} {:>8} {:>8} {:>8}  {}",
                name, last, o.frames_captured, o.frames_skipped, o.recording_dropped, result
            ));
        }
        lines
    }
}

/// One recording/preview run over a fixed set of cameras.
pub struct Session {
    backend: Arc<dyn CaptureBackend>,
    options: SessionOptions,
    recorder: Option<Arc<dyn RecordingSink>>,
    preview: Option<Box<dyn PreviewSink>>,
    token: CancelToken,
}

impl Session {
    /// A session that neither records nor previews until configured to.
    pub fn new(backend: Arc<dyn CaptureBackend>, options: SessionOptions) -> Self {
        Self {
            backend,
            options,
            recorder: None,
            preview: None,
            token: CancelToken::new(),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RecordingSink>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_preview(mut self, preview: Box<dyn PreviewSink>) -> Self {
        self.preview = Some(preview);
        self
    }

    /// Token that stops the whole session when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Run until every worker has ended or a stop was requested and handled.
    pub fn run(self, specs: Vec<CameraSpec>) -> Result<SessionResult, SessionError> {
        let Session {
            backend,
            options,
            recorder,
            preview,
            token,
        } = self;

        if specs.is_empty() {
            return Err(SessionError::NoCameras);
        }
        let mut names = HashSet::new();
        for spec in &specs {
            if !names.insert(spec.name.as_str()) {
                return Err(SessionError::DuplicateCameraName(spec.name.clone()));
            }
        }
        if recorder.is_some() {
            std::fs::create_dir_all(&options.output_dir).map_err(|source| {
                SessionError::OutputDir {
                    path: options.output_dir.clone(),
                    source,
                }
            })?;
        }

        let mut distributors = Vec::with_capacity(specs.len());
        let mut feeds = Vec::new();
        for spec in &specs {
            let mut distributor = FrameDistributor::new(spec.name.clone());
            if preview.is_some() {
                feeds.push((
                    spec.name.clone(),
                    distributor.subscribe("preview", Delivery::LatestWins),
                ));
            }
            distributors.push(distributor);
        }

        let preview_thread = match preview {
            Some(sink) => Some(
                spawn_preview(sink, feeds, options.preview_interval, token.clone())
                    .map_err(SessionError::Preview)?,
            ),
            None => None,
        };

        log::info!("starting {} camera(s)", specs.len());
        let (events_tx, events) = crossbeam_channel::unbounded::<WorkerEvent>();
        let mut handles: BTreeMap<String, (WorkerHandle, Option<PathBuf>)> = BTreeMap::new();
        for (spec, distributor) in specs.into_iter().zip(distributors) {
            let recording = recorder.as_ref().map(|sink| RecordingTarget {
                sink: Arc::clone(sink),
                output_path: options.output_path(&spec.name),
            });
            let output_path = recording.as_ref().map(|r| r.output_path.clone());
            let ctx = WorkerContext {
                backend: Arc::clone(&backend),
                distributor,
                recording,
                options: options.worker.clone(),
                events: events_tx.clone(),
            };
            let name = spec.name.clone();
            let handle = WorkerHandle::start(spec, ctx, token.child());
            handles.insert(name, (handle, output_path));
        }
        drop(events_tx);

        let mut finished: BTreeMap<String, WorkerEvent> = BTreeMap::new();
        let mut deadline: Option<Instant> = None;
        while finished.len() < handles.len() {
            if deadline.is_none() && token.is_cancelled() {
                log::info!("stopping {} camera(s)", handles.len() - finished.len());
                for (handle, _) in handles.values() {
                    handle.stop();
                }
                deadline = Some(Instant::now() + options.shutdown_timeout);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }

            match events.recv_timeout(TICK) {
                Ok(event) => {
                    log::debug!("{}: reached {}", event.camera, event.state);
                    finished.insert(event.camera.clone(), event);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        while let Ok(event) = events.try_recv() {
            finished.insert(event.camera.clone(), event);
        }
        let interrupted = deadline.is_some();

        // Ends the preview thread if the workers ended on their own.
        token.cancel();

        let mut result = SessionResult {
            per_camera_outcome: BTreeMap::new(),
            interrupted,
        };
        for (name, (handle, output_path)) in handles {
            let outcome = match finished.remove(&name) {
                Some(event) => {
                    handle.join();
                    let terminal = match event.state {
                        WorkerState::Failed(e) => Terminal::Failed(e),
                        _ => Terminal::Stopped,
                    };
                    CameraOutcome::new(terminal, event.stats, output_path)
                }
                None => {
                    let (state, stats) = handle.snapshot();
                    log::error!(
                        "{}: still {} after {:?}, abandoning it",
                        name,
                        state,
                        options.shutdown_timeout
                    );
                    // Detached: the thread owns the device and releases it if it ever returns.
                    drop(handle);
                    CameraOutcome::new(Terminal::ShutdownTimeout, stats, output_path)
                }
            };
            result.per_camera_outcome.insert(name, outcome);
        }

        if let Some(thread) = preview_thread {
            join_bounded(thread, PREVIEW_JOIN_TIMEOUT);
        }

        for line in result.summary() {
            log::info!("{}", line);
        }
        Ok(result)
    }
}

fn join_bounded(thread: JoinHandle<()>, timeout: Duration) {
    let start = Instant::now();
    while !thread.is_finished() {
        if start.elapsed() >= timeout {
            log::warn!("preview did not finish within {:?}, leaving it behind", timeout);
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if thread.join().is_err() {
        log::error!("preview thread panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(terminal: Terminal) -> CameraOutcome {
        CameraOutcome::new(terminal, WorkerStats::default(), None)
    }

    fn result(terminals: Vec<Terminal>) -> SessionResult {
        SessionResult {
            per_camera_outcome: terminals
                .into_iter()
                .enumerate()
                .map(|(i, t)| (format!("cam{}", i), outcome(t)))
                .collect(),
            interrupted: true,
        }
    }

    #[test]
    fn test_one_stopped_camera_is_enough_by_default() {
        let r = result(vec![
            Terminal::Stopped,
            Terminal::Failed(CaptureError::WorkerPanicked),
        ]);
        assert!(r.succeeded(false));
        assert_eq!(r.exit_code(false), 0);
        assert!(!r.succeeded(true));
        assert_eq!(r.exit_code(true), 1);
    }

    #[test]
    fn test_timeout_counts_as_failure() {
        let r = result(vec![Terminal::ShutdownTimeout]);
        assert!(!r.succeeded(false));
        assert!(!r.succeeded(true));
    }

    #[test]
    fn test_empty_result_fails() {
        let r = SessionResult::default();
        assert!(!r.succeeded(false));
        assert!(!r.succeeded(true));
    }

    #[test]
    fn test_summary_reports_failures() {
        let r = result(vec![Terminal::Failed(CaptureError::DeviceBusy {
            path: PathBuf::from("/dev/video0"),
        })]);
        let lines = r.summary();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("cam0"));
        assert!(lines[1].contains("DeviceBusy"));
    }

    #[test]
    fn test_output_path() {
        let options = SessionOptions {
            output_dir: PathBuf::from("/data/run1"),
            ..SessionOptions::default()
        };
        assert_eq!(
            options.output_path("01_left"),
            PathBuf::from("/data/run1/01_left.mkv")
        );
    }
}
