//! Live preview surfaces and the preview thread.
//!
//! All cameras feed one preview thread through their latest-wins slots. The
//! thread hands the freshest frame of each camera to a [`PreviewSink`] at a
//! steady interval and turns a user quit into a session-wide cancellation.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::ascii::AsciiRenderer;
use crate::camera::Frame;
use crate::cancel::CancelToken;
use crate::distributor::{Next, Subscription};

/// Display surface for the most recent frame of each camera.
pub trait PreviewSink: Send {
    fn update(&mut self, camera_name: &str, frame: &Frame);

    /// Whether the user asked to end the session.
    fn poll_user_quit(&mut self) -> bool;

    /// Called once when the preview thread exits.
    fn finish(&mut self) {}
}

/// Preview for headless runs.
#[derive(Debug, Default)]
pub struct NullPreview;

impl PreviewSink for NullPreview {
    fn update(&mut self, _camera_name: &str, _frame: &Frame) {}

    fn poll_user_quit(&mut self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
struct CameraLine {
    first_sequence: u64,
    first_timestamp: Instant,
    last_sequence: u64,
    last_timestamp: Instant,
    payload_length: usize,
}

impl CameraLine {
    fn new(frame: &Frame) -> Self {
        Self {
            first_sequence: frame.sequence_number,
            first_timestamp: frame.capture_timestamp,
            last_sequence: frame.sequence_number,
            last_timestamp: frame.capture_timestamp,
            payload_length: frame.payload_length(),
        }
    }

    fn observe(&mut self, frame: &Frame) {
        self.last_sequence = frame.sequence_number;
        self.last_timestamp = frame.capture_timestamp;
        self.payload_length = frame.payload_length();
    }

    fn fps(&self) -> f64 {
        let elapsed = self
            .last_timestamp
            .duration_since(self.first_timestamp)
            .as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.last_sequence.saturating_sub(self.first_sequence) as f64 / elapsed
    }

    fn describe(&self, name: &str) -> String {
        format!(
            "{:<16} seq {:>8}  {:>6.1} fps  {:>8} bytes",
            name,
            self.last_sequence,
            self.fps(),
            self.payload_length
        )
    }
}

/// Set once the user types `q` followed by Enter.
fn watch_stdin_for_quit() -> Arc<AtomicBool> {
    let quit = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&quit);
    // Blocked on stdin for the life of the process; never joined.
    let spawned = thread::Builder::new()
        .name("preview-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().eq_ignore_ascii_case("q") {
                    flag.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        log::warn!("could not watch stdin for quit key: {}", e);
    }
    quit
}

/// Redraw `lines` over the block drawn last time on stderr.
fn redraw(lines: &[String], drawn_lines: &mut usize) {
    let mut err = io::stderr().lock();
    if *drawn_lines > 0 {
        let _ = write!(err, "\x1b[{}A\x1b[J", *drawn_lines);
    }
    for line in lines {
        let _ = writeln!(err, "{}", line);
    }
    let _ = writeln!(err, "(type q + Enter to stop)");
    let _ = err.flush();
    *drawn_lines = lines.len() + 1;
}

/// Terminal status display: one line per camera, redrawn in place on stderr.
///
/// Typing `q` followed by Enter quits the session.
pub struct StatusPreview {
    cameras: BTreeMap<String, CameraLine>,
    redraw_every: Duration,
    last_draw: Option<Instant>,
    drawn_lines: usize,
    quit: Arc<AtomicBool>,
}

impl StatusPreview {
    /// Create the display and start listening for `q` on stdin.
    pub fn new() -> Self {
        Self::with_quit_flag(watch_stdin_for_quit())
    }

    fn with_quit_flag(quit: Arc<AtomicBool>) -> Self {
        Self {
            cameras: BTreeMap::new(),
            redraw_every: Duration::from_millis(500),
            last_draw: None,
            drawn_lines: 0,
            quit,
        }
    }

    /// Current status lines, one per camera, ordered by name.
    pub fn lines(&self) -> Vec<String> {
        self.cameras
            .iter()
            .map(|(name, line)| line.describe(name))
            .collect()
    }

    fn draw(&mut self) {
        let lines = self.lines();
        redraw(&lines, &mut self.drawn_lines);
    }
}

impl Default for StatusPreview {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewSink for StatusPreview {
    fn update(&mut self, camera_name: &str, frame: &Frame) {
        self.cameras
            .entry(camera_name.to_string())
            .and_modify(|line| line.observe(frame))
            .or_insert_with(|| CameraLine::new(frame));

        let due = self
            .last_draw
            .map_or(true, |t| t.elapsed() >= self.redraw_every);
        if due {
            self.draw();
            self.last_draw = Some(Instant::now());
        }
    }

    fn poll_user_quit(&mut self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    fn finish(&mut self) {
        if !self.cameras.is_empty() {
            self.draw();
        }
    }
}

struct Tile {
    line: CameraLine,
    latest: Frame,
}

/// Live picture of every camera drawn as ASCII art on stderr.
///
/// Uncompressed frames are shown as a picture under each camera's status
/// line. Cameras streaming MJPEG or H.264 show the status line only.
/// Typing `q` followed by Enter quits the session.
pub struct AsciiPreview {
    renderer: AsciiRenderer,
    tiles: BTreeMap<String, Tile>,
    redraw_every: Duration,
    last_draw: Option<Instant>,
    drawn_lines: usize,
    quit: Arc<AtomicBool>,
}

impl AsciiPreview {
    /// Picture size used by [`AsciiPreview::new`], in characters.
    pub const DEFAULT_SIZE: (u16, u16) = (64, 18);

    /// Create the display with pictures of at most `max_cols` x `max_rows`
    /// characters and start listening for `q` on stdin.
    pub fn new(max_cols: u16, max_rows: u16) -> Self {
        Self::with_quit_flag(max_cols, max_rows, watch_stdin_for_quit())
    }

    fn with_quit_flag(max_cols: u16, max_rows: u16, quit: Arc<AtomicBool>) -> Self {
        Self {
            renderer: AsciiRenderer::new(max_cols, max_rows),
            tiles: BTreeMap::new(),
            redraw_every: Duration::from_millis(100),
            last_draw: None,
            drawn_lines: 0,
            quit,
        }
    }

    /// Render the latest frame of every camera, ordered by name.
    pub fn lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        for (name, tile) in &self.tiles {
            lines.push(tile.line.describe(name));
            match self.renderer.render(&tile.latest) {
                Some(picture) => lines.extend(picture),
                None => lines.push(format!(
                    "  ({} stream, no picture preview)",
                    tile.latest.format.pixel_format
                )),
            }
        }
        lines
    }

    fn draw(&mut self) {
        let lines = self.lines();
        redraw(&lines, &mut self.drawn_lines);
    }
}

impl PreviewSink for AsciiPreview {
    fn update(&mut self, camera_name: &str, frame: &Frame) {
        match self.tiles.get_mut(camera_name) {
            Some(tile) => {
                tile.line.observe(frame);
                tile.latest = frame.clone();
            }
            None => {
                self.tiles.insert(
                    camera_name.to_string(),
                    Tile {
                        line: CameraLine::new(frame),
                        latest: frame.clone(),
                    },
                );
            }
        }

        let due = self
            .last_draw
            .map_or(true, |t| t.elapsed() >= self.redraw_every);
        if due {
            self.draw();
            self.last_draw = Some(Instant::now());
        }
    }

    fn poll_user_quit(&mut self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    fn finish(&mut self) {
        if !self.tiles.is_empty() {
            self.draw();
        }
    }
}

/// Start the preview thread.
///
/// The thread exits when `token` is cancelled, when every feed has closed,
/// or after the sink reports a user quit (which cancels `token`).
pub fn spawn_preview(
    mut sink: Box<dyn PreviewSink>,
    feeds: Vec<(String, Subscription)>,
    interval: Duration,
    token: CancelToken,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("preview".to_string())
        .spawn(move || {
            let mut open: Vec<(String, Subscription)> = feeds;
            while !token.is_cancelled() && !open.is_empty() {
                open.retain(|(name, feed)| match feed.recv_timeout(Duration::ZERO) {
                    Next::Frame(frame) => {
                        sink.update(name, &frame);
                        true
                    }
                    Next::Empty => true,
                    Next::Closed => false,
                });

                if sink.poll_user_quit() {
                    log::info!("Quit requested from preview");
                    token.cancel();
                    break;
                }
                token.wait_timeout(interval);
            }
            sink.finish();
        })
}
