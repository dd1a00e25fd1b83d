//! Camera types and data structures.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Largest resolution accepted from configuration or the command line.
pub const MAX_RESOLUTION: Resolution = Resolution {
    width: 7680,
    height: 4320,
};

/// Errors produced when parsing format descriptions from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFormatError {
    #[error("invalid resolution '{0}', use WIDTHxHEIGHT (e.g. 1280x720)")]
    Resolution(String),
    #[error("resolution {0} exceeds the maximum supported (7680x4320)")]
    ResolutionTooLarge(String),
    #[error("unknown pixel format '{0}', expected one of: mjpeg, yuyv, h264")]
    PixelFormat(String),
}

/// Capture resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// 640x480
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };

    /// 1280x720, the default capture size.
    pub const HD: Resolution = Resolution {
        width: 1280,
        height: 720,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one frame.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::HD
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseFormatError::Resolution(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        if width > MAX_RESOLUTION.width || height > MAX_RESOLUTION.height {
            return Err(ParseFormatError::ResolutionTooLarge(s.to_string()));
        }
        Ok(Self { width, height })
    }
}

/// Pixel format requested from (and delivered by) a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// Motion-JPEG, one compressed image per buffer
    #[default]
    Mjpeg,
    /// Packed YUV 4:2:2, two bytes per pixel
    Yuyv,
    /// H.264 elementary stream
    H264,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 3] = [PixelFormat::Mjpeg, PixelFormat::Yuyv, PixelFormat::H264];

    /// V4L2 four-character code.
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::H264 => *b"H264",
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == code)
    }

    /// Whether buffers carry compressed data of varying length.
    pub fn is_compressed(&self) -> bool {
        !matches!(self, PixelFormat::Yuyv)
    }

    /// Expected payload size of one raw frame, `None` for compressed formats.
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        match self {
            PixelFormat::Yuyv => Some(resolution.area() as usize * 2),
            PixelFormat::Mjpeg | PixelFormat::H264 => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::H264 => "H264",
        };
        f.write_str(name)
    }
}

impl FromStr for PixelFormat {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mjpeg" | "mjpg" => Ok(PixelFormat::Mjpeg),
            "yuyv" | "yuyv422" | "yuy2" => Ok(PixelFormat::Yuyv),
            "h264" => Ok(PixelFormat::H264),
            _ => Err(ParseFormatError::PixelFormat(s.to_string())),
        }
    }
}

/// Resolution, frame rate and pixel format of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    pub resolution: Resolution,
    pub framerate: u32,
    pub pixel_format: PixelFormat,
}

impl StreamFormat {
    pub fn new(resolution: Resolution, framerate: u32, pixel_format: PixelFormat) -> Self {
        Self {
            resolution,
            framerate,
            pixel_format,
        }
    }
}

impl Default for StreamFormat {
    /// 1280x720 at 30 fps, MJPEG
    fn default() -> Self {
        Self::new(Resolution::HD, 30, PixelFormat::Mjpeg)
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} {}",
            self.resolution, self.framerate, self.pixel_format
        )
    }
}

/// Hardware identity of a discovered capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Device node, e.g. `/dev/video0`
    pub device_path: PathBuf,
    /// Product string reported by the device
    pub product: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// Per-unit serial number, empty when the device does not expose one
    pub serial: String,
}

impl DeviceIdentity {
    pub fn new(device_path: impl Into<PathBuf>, serial: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            product: String::new(),
            vendor_id: None,
            product_id: None,
            serial: serial.into(),
        }
    }

    /// File name of the device node (`video0` for `/dev/video0`).
    pub fn node_name(&self) -> String {
        node_name(&self.device_path)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device_path.display())?;
        if !self.product.is_empty() {
            write!(f, " ({})", self.product)?;
        }
        if let (Some(vid), Some(pid)) = (self.vendor_id, self.product_id) {
            write!(f, " {:04x}:{:04x}", vid, pid)?;
        }
        if !self.serial.is_empty() {
            write!(f, " serial={}", self.serial)?;
        }
        Ok(())
    }
}

/// Parse a USB id as written in sysfs or on the command line (`046d`, `0x046d`).
pub fn parse_usb_id(s: &str) -> Option<u16> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).ok()
}

pub(crate) fn node_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Identity and requested format of one logical camera in a session.
///
/// Built once by the matcher and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSpec {
    pub device_path: PathBuf,
    pub serial: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// Unique label, also the base name of the output file
    pub name: String,
    pub format: StreamFormat,
}

impl CameraSpec {
    pub fn from_identity(
        identity: &DeviceIdentity,
        name: impl Into<String>,
        format: StreamFormat,
    ) -> Self {
        Self {
            device_path: identity.device_path.clone(),
            serial: identity.serial.clone(),
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
            name: name.into(),
            format,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.format.resolution
    }

    pub fn framerate(&self) -> u32 {
        self.format.framerate
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format.pixel_format
    }
}

impl fmt::Display for CameraSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <- {} [{}]",
            self.name,
            self.device_path.display(),
            self.format
        )
    }
}

/// One captured buffer.
///
/// The payload is shared, so handing a frame to several consumers never
/// copies pixel data and never gives anyone a mutable alias.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_name: Arc<str>,
    /// Per-camera counter starting at 0; gaps mark skipped buffers
    pub sequence_number: u64,
    /// Monotonic capture time
    pub capture_timestamp: Instant,
    /// Format the device was streaming when the buffer was read
    pub format: StreamFormat,
    pub payload: Arc<[u8]>,
}

impl Frame {
    pub fn new(
        camera_name: Arc<str>,
        sequence_number: u64,
        capture_timestamp: Instant,
        format: StreamFormat,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            camera_name,
            sequence_number,
            capture_timestamp,
            format,
            payload: payload.into(),
        }
    }

    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }
}
