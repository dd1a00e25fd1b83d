//! Recording sink contract and the per-camera writer thread.

use std::io;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::camera::{Frame, StreamFormat};
use crate::distributor::{Next, Subscription};

/// How long the writer thread waits for a frame before re-checking its queue.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("ffmpeg not found; install it (e.g. `apt install ffmpeg`) or run with --no-record")]
    FfmpegNotFound,

    #[error("failed to start recorder: {0}")]
    Spawn(#[source] io::Error),

    #[error("writing to recorder failed: {0}")]
    Io(#[from] io::Error),

    #[error("recorder exited with code {exit_code:?}: {stderr}")]
    ProcessFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("recording rejected: {0}")]
    Rejected(String),

    #[error("recording thread panicked")]
    WriterPanicked,
}

/// Something that can store a camera's frames in a file.
pub trait RecordingSink: Send + Sync {
    /// Prepare `output_path` to receive frames in `format`.
    fn open(
        &self,
        camera_name: &str,
        output_path: &Path,
        format: StreamFormat,
    ) -> Result<Box<dyn FrameWriter>, SinkError>;
}

/// An open recording.
///
/// `close` consumes the writer, so it can only ever run once.
pub trait FrameWriter: Send {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError>;
    fn close(self: Box<Self>) -> Result<(), SinkError>;
}

/// Background thread draining one camera's recording queue into a writer.
#[derive(Debug)]
pub struct RecordingWriter {
    camera: String,
    thread: Option<JoinHandle<Result<u64, SinkError>>>,
}

impl RecordingWriter {
    /// Start consuming `subscription` into `writer`.
    ///
    /// The writer is closed exactly once, when the subscription closes or
    /// the first write fails. If the thread cannot be started the writer is
    /// closed here before the error is returned.
    pub fn spawn(
        camera: &str,
        writer: Box<dyn FrameWriter>,
        subscription: Subscription,
    ) -> io::Result<Self> {
        let builder = thread::Builder::new().name(format!("record-{}", camera));
        Self::spawn_on(builder, camera, writer, subscription)
    }

    fn spawn_on(
        builder: thread::Builder,
        camera: &str,
        writer: Box<dyn FrameWriter>,
        subscription: Subscription,
    ) -> io::Result<Self> {
        // The writer only moves into the thread once it is running.
        let (handoff_tx, handoff_rx) = crossbeam_channel::bounded::<Handoff>(1);
        let name = camera.to_string();
        let spawned = builder.spawn(move || match handoff_rx.recv() {
            Ok((writer, subscription)) => drain(&name, writer, subscription),
            Err(_) => Ok(0),
        });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                drop(subscription);
                close_unstarted(camera, writer);
                return Err(e);
            }
        };
        if let Err(crossbeam_channel::SendError((writer, subscription))) =
            handoff_tx.send((writer, subscription))
        {
            drop(subscription);
            close_unstarted(camera, writer);
        }
        Ok(Self {
            camera: camera.to_string(),
            thread: Some(thread),
        })
    }

    /// Wait for the writer thread and return the number of frames written.
    pub fn finish(mut self) -> Result<u64, SinkError> {
        let Some(thread) = self.thread.take() else {
            return Ok(0);
        };
        match thread.join() {
            Ok(result) => result,
            Err(_) => {
                log::error!("{}: recording thread panicked", self.camera);
                Err(SinkError::WriterPanicked)
            }
        }
    }
}

type Handoff = (Box<dyn FrameWriter>, Subscription);

fn close_unstarted(camera: &str, writer: Box<dyn FrameWriter>) {
    log::error!("{}: recording thread did not start", camera);
    if let Err(e) = writer.close() {
        log::warn!("{}: closing unstarted recording: {}", camera, e);
    }
}

fn drain(
    camera: &str,
    mut writer: Box<dyn FrameWriter>,
    subscription: Subscription,
) -> Result<u64, SinkError> {
    let mut written = 0u64;
    loop {
        match subscription.recv_timeout(POLL_INTERVAL) {
            Next::Frame(frame) => {
                if let Err(e) = writer.write(&frame) {
                    log::error!(
                        "{}: write of frame {} failed: {}",
                        camera,
                        frame.sequence_number,
                        e
                    );
                    // Hang up first so the producer stops waiting on a dead queue.
                    drop(subscription);
                    if let Err(close_err) = writer.close() {
                        log::warn!("{}: closing failed recording: {}", camera, close_err);
                    }
                    return Err(e);
                }
                written += 1;
            }
            Next::Empty => continue,
            Next::Closed => break,
        }
    }
    writer.close()?;
    log::debug!("{}: recording closed after {} frames", camera, written);
    Ok(written)
}
