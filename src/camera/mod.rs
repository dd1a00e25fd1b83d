//! Camera access: device identity, format negotiation and capture workers.
//!
//! - Backends via [`CaptureBackend`] (V4L2 on Linux, [`crate::sim`] anywhere)
//! - Format selection via [`negotiate`] and [`FormatPolicy`]
//! - One capture thread per camera via [`WorkerHandle`]

mod capture;
mod capture_loop;
mod device;
mod errors;
#[cfg(target_os = "linux")]
pub mod focus;
mod format;
mod types;
#[cfg(target_os = "linux")]
mod v4l2;

pub use capture::{
    RecordingTarget, StatusCell, WorkerContext, WorkerEvent, WorkerHandle, WorkerOptions,
    WorkerState, WorkerStats,
};
pub use device::{hardware_backend, CaptureBackend, CaptureDevice, ReadOutcome};
pub use errors::{CaptureError, DiscoveryError};
pub use format::{
    negotiate, reconcile, FormatDeviation, FormatError, FormatPolicy, NegotiatedFormat,
    SupportedMode,
};
pub use types::{
    parse_usb_id, CameraSpec, DeviceIdentity, Frame, ParseFormatError, PixelFormat, Resolution,
    StreamFormat, MAX_RESOLUTION,
};
#[cfg(target_os = "linux")]
pub use v4l2::V4l2Backend;
