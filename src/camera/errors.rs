//! Error types for device discovery and capture.
//!
//! A [`CaptureError`] is always local to one camera: it ends up in that
//! worker's `Failed` state and never aborts the rest of the session.

use std::path::PathBuf;

use super::format::FormatError;

/// Errors raised while enumerating capture devices.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to enumerate capture devices: {0}")]
    Io(#[from] std::io::Error),
    #[error("hardware capture is only supported on Linux (V4L2); use --simulate to try mvr elsewhere")]
    Unsupported,
}

/// Reasons a capture worker ends in the `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("device {} is busy (held by another process or worker)", .path.display())]
    DeviceBusy { path: PathBuf },

    #[error("failed to open device {}: {message}", .path.display())]
    DeviceOpenFailed { path: PathBuf, message: String },

    #[error("device {} cannot provide the requested format: {reason}", .path.display())]
    UnsupportedFormat { path: PathBuf, reason: FormatError },

    #[error("I/O error persisted after {attempts} consecutive attempts: {message}")]
    TransientIo { attempts: u32, message: String },

    #[error("failed to open recording {}: {message}", .path.display())]
    RecordingOpenFailed { path: PathBuf, message: String },

    #[error("recording failed: {message}")]
    RecordingFailed { message: String },

    #[error("could not start capture thread: {message}")]
    Spawn { message: String },

    #[error("capture thread panicked")]
    WorkerPanicked,
}

impl CaptureError {
    /// Short machine-friendly name of the error kind, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::DeviceBusy { .. } => "DeviceBusy",
            CaptureError::DeviceOpenFailed { .. } => "DeviceOpenFailed",
            CaptureError::UnsupportedFormat { .. } => "UnsupportedFormat",
            CaptureError::TransientIo { .. } => "TransientIOError",
            CaptureError::RecordingOpenFailed { .. } => "RecordingOpenFailed",
            CaptureError::RecordingFailed { .. } => "RecordingFailed",
            CaptureError::Spawn { .. } => "SpawnFailed",
            CaptureError::WorkerPanicked => "WorkerPanicked",
        }
    }

    /// Classify an error from opening or configuring a device node.
    pub fn from_open_error(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        let path = path.into();
        if is_busy(err) {
            CaptureError::DeviceBusy { path }
        } else {
            CaptureError::DeviceOpenFailed {
                path,
                message: err.to_string(),
            }
        }
    }
}

#[cfg(unix)]
fn is_busy(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBUSY)
}

#[cfg(not(unix))]
fn is_busy(_err: &std::io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PixelFormat, Resolution, StreamFormat};

    #[test]
    fn test_device_busy_display() {
        let err = CaptureError::DeviceBusy {
            path: PathBuf::from("/dev/video0"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/video0"));
        assert!(msg.contains("busy"));
        assert_eq!(err.kind(), "DeviceBusy");
    }

    #[test]
    fn test_unsupported_format_display() {
        let requested = StreamFormat::new(Resolution::HD, 60, PixelFormat::Mjpeg);
        let err = CaptureError::UnsupportedFormat {
            path: PathBuf::from("/dev/video4"),
            reason: FormatError::NoExactMode { requested },
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/video4"));
        assert!(msg.contains("1280x720@60 MJPEG"));
    }

    #[test]
    fn test_transient_io_kind() {
        let err = CaptureError::TransientIo {
            attempts: 3,
            message: "No such device".to_string(),
        };
        assert_eq!(err.kind(), "TransientIOError");
        assert!(err.to_string().contains("3 consecutive"));
    }

    #[cfg(unix)]
    #[test]
    fn test_open_error_classifies_ebusy() {
        let busy = std::io::Error::from_raw_os_error(libc::EBUSY);
        assert!(matches!(
            CaptureError::from_open_error("/dev/video0", &busy),
            CaptureError::DeviceBusy { .. }
        ));

        let missing = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert!(matches!(
            CaptureError::from_open_error("/dev/video9", &missing),
            CaptureError::DeviceOpenFailed { .. }
        ));
    }
}
