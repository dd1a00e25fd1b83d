//! Capture backend abstraction.
//!
//! A [`CaptureBackend`] enumerates devices and opens them; the returned
//! [`CaptureDevice`] is owned by exactly one capture worker, which is the only
//! code that ever touches the hardware handle.

use std::io;
use std::path::Path;

use super::errors::{CaptureError, DiscoveryError};
use super::format::{FormatPolicy, NegotiatedFormat, SupportedMode};
use super::types::{CameraSpec, DeviceIdentity};

/// Result of one blocking read from a device.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete buffer. `dropped_before` counts buffers the driver lost
    /// since the previous read.
    Buffer { data: Vec<u8>, dropped_before: u32 },
    /// The driver handed out a buffer that must not be recorded.
    Corrupt { reason: String, dropped_before: u32 },
    /// No buffer became ready within the backend's poll interval.
    TimedOut,
}

/// An opened, format-negotiated, streaming device.
pub trait CaptureDevice: Send {
    /// Format the device is streaming with.
    fn format(&self) -> NegotiatedFormat;

    /// Block until the next buffer is available.
    ///
    /// Implementations must return within a bounded time (yielding
    /// [`ReadOutcome::TimedOut`]) so the caller can observe cancellation.
    fn read(&mut self) -> io::Result<ReadOutcome>;
}

/// Source of capture devices.
pub trait CaptureBackend: Send + Sync {
    /// Enumerate capture devices with their hardware identity. Read-only.
    fn discover(&self) -> Result<Vec<DeviceIdentity>, DiscoveryError>;

    /// Modes the device at `device_path` advertises.
    fn capabilities(&self, device_path: &Path) -> Result<Vec<SupportedMode>, CaptureError>;

    /// Open the device exclusively and start streaming in the negotiated format.
    fn open(
        &self,
        spec: &CameraSpec,
        policy: FormatPolicy,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

/// The V4L2 backend on Linux.
#[cfg(target_os = "linux")]
pub fn hardware_backend(lock_focus: bool) -> Result<Box<dyn CaptureBackend>, DiscoveryError> {
    Ok(Box::new(
        super::v4l2::V4l2Backend::new().with_focus_lock(lock_focus),
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn hardware_backend(_lock_focus: bool) -> Result<Box<dyn CaptureBackend>, DiscoveryError> {
    Err(DiscoveryError::Unsupported)
}
