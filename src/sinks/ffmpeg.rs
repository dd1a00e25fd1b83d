//! Recording through one `ffmpeg` process per camera.
//!
//! Frames are piped to ffmpeg's stdin. Compressed formats are stream-copied
//! into the container; raw YUYV is encoded losslessly with FFV1.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::recording::{FrameWriter, RecordingSink, SinkError};
use crate::camera::{Frame, PixelFormat, StreamFormat};

/// Lines of ffmpeg stderr kept for error reports.
const STDERR_TAIL: usize = 20;

/// Grace period after SIGINT before the process is killed.
const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

/// Arguments for recording `format` from stdin into `output`.
pub fn ffmpeg_args(format: StreamFormat, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let framerate = format.framerate.to_string();
    match format.pixel_format {
        PixelFormat::Mjpeg => {
            args.extend(["-f", "mjpeg", "-framerate", framerate.as_str()].map(String::from));
        }
        PixelFormat::H264 => {
            args.extend(["-f", "h264", "-framerate", framerate.as_str()].map(String::from));
        }
        PixelFormat::Yuyv => {
            let size = format.resolution.to_string();
            args.extend(
                [
                    "-f",
                    "rawvideo",
                    "-pix_fmt",
                    "yuyv422",
                    "-video_size",
                    size.as_str(),
                    "-framerate",
                    framerate.as_str(),
                ]
                .map(String::from),
            );
        }
    }

    args.extend(["-i", "pipe:0"].map(String::from));
    let codec = if format.pixel_format.is_compressed() {
        "copy"
    } else {
        "ffv1"
    };
    args.extend(["-c:v", codec].map(String::from));
    args.push(output.display().to_string());
    args
}

/// [`RecordingSink`] backed by the `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegRecorder {
    program: PathBuf,
    close_timeout: Duration,
}

impl Default for FfmpegRecorder {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            close_timeout: Duration::from_secs(3),
        }
    }
}

impl FfmpegRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different ffmpeg executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// How long `close` waits for ffmpeg to finish before interrupting it.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

impl RecordingSink for FfmpegRecorder {
    fn open(
        &self,
        camera_name: &str,
        output_path: &Path,
        format: StreamFormat,
    ) -> Result<Box<dyn FrameWriter>, SinkError> {
        let args = ffmpeg_args(format, output_path);
        log::debug!("{}: ffmpeg {}", camera_name, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SinkError::FfmpegNotFound
                } else {
                    SinkError::Spawn(e)
                }
            })?;

        let stdin = child.stdin.take();
        let stderr_thread = child.stderr.take().map(|stderr| {
            let camera = camera_name.to_string();
            thread::spawn(move || {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL);
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    log::warn!("[ffmpeg {}] {}", camera, line);
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>()
            })
        });

        log::info!("{}: recording to {}", camera_name, output_path.display());
        Ok(Box::new(FfmpegWriter {
            camera: camera_name.to_string(),
            child,
            stdin,
            stderr_thread,
            close_timeout: self.close_timeout,
        }))
    }
}

struct FfmpegWriter {
    camera: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<Vec<String>>>,
    close_timeout: Duration,
}

impl FfmpegWriter {
    fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn interrupt(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGINT);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }

    fn stderr_tail(&mut self) -> String {
        self.stderr_thread
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
            .join("\n")
    }
}

impl FrameWriter for FfmpegWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(SinkError::Rejected("recorder input already closed".to_string()));
        };
        stdin.write_all(&frame.payload)?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), SinkError> {
        // EOF on stdin lets ffmpeg finalize the container.
        drop(self.stdin.take());

        let timeout = self.close_timeout;
        let status = match self.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                log::warn!(
                    "{}: ffmpeg still running after {:?}, interrupting",
                    self.camera,
                    timeout
                );
                self.interrupt();
                match self.wait_timeout(INTERRUPT_GRACE)? {
                    Some(status) => status,
                    None => {
                        log::error!("{}: killing ffmpeg", self.camera);
                        let _ = self.child.kill();
                        self.child.wait()?
                    }
                }
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(SinkError::ProcessFailed {
                exit_code: status.code(),
                stderr: self.stderr_tail(),
            })
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
