//! V4L2 capture backend for Linux.
//!
//! Devices are enumerated from `/sys/class/video4linux`; USB identity
//! (vendor/product id, serial) is read from the sysfs attributes of each
//! node's USB parent. Only the first capture-capable node of every physical
//! device is reported, since UVC cameras also expose metadata nodes.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use v4l::buffer::{Flags as BufferFlags, Type};
use v4l::capability::Flags as CapabilityFlags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use super::device::{CaptureBackend, CaptureDevice, ReadOutcome};
use super::errors::{CaptureError, DiscoveryError};
use super::focus;
use super::format::{self, FormatError, FormatPolicy, NegotiatedFormat, SupportedMode};
use super::types::{
    parse_usb_id, CameraSpec, DeviceIdentity, PixelFormat, Resolution, StreamFormat,
};

const SYSFS_VIDEO4LINUX: &str = "/sys/class/video4linux";

/// Number of mmap buffers queued with the driver.
const BUFFER_COUNT: u32 = 4;

/// Upper bound on one blocking dequeue, so stop requests are seen promptly.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Capture backend talking to `/dev/video*` through V4L2.
#[derive(Debug, Default)]
pub struct V4l2Backend {
    lock_focus: bool,
}

impl V4l2Backend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable autofocus on every device before it starts streaming.
    pub fn with_focus_lock(mut self, lock_focus: bool) -> Self {
        self.lock_focus = lock_focus;
        self
    }
}

impl CaptureBackend for V4l2Backend {
    fn discover(&self) -> Result<Vec<DeviceIdentity>, DiscoveryError> {
        let entries = match fs::read_dir(SYSFS_VIDEO4LINUX) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut nodes: Vec<(u32, String)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let index = name.strip_prefix("video")?.parse().ok()?;
                Some((index, name))
            })
            .collect();
        nodes.sort();

        let mut seen_parents = HashSet::new();
        let mut devices = Vec::new();
        for (_, node) in nodes {
            let device_path = PathBuf::from("/dev").join(&node);
            if !is_capture_node(&device_path) {
                continue;
            }

            let usb_dir = usb_parent(&Path::new(SYSFS_VIDEO4LINUX).join(&node));
            let parent_key = usb_dir.clone().unwrap_or_else(|| device_path.clone());
            if !seen_parents.insert(parent_key) {
                log::debug!("{}: secondary node of an already listed device", device_path.display());
                continue;
            }

            let identity = match usb_dir {
                Some(dir) => DeviceIdentity {
                    device_path,
                    product: read_attr(&dir, "product").unwrap_or_default(),
                    vendor_id: read_attr(&dir, "idVendor").and_then(|v| parse_usb_id(&v)),
                    product_id: read_attr(&dir, "idProduct").and_then(|v| parse_usb_id(&v)),
                    serial: read_attr(&dir, "serial").unwrap_or_default(),
                },
                None => DeviceIdentity {
                    product: read_attr(&Path::new(SYSFS_VIDEO4LINUX).join(&node), "name")
                        .unwrap_or_default(),
                    ..DeviceIdentity::new(device_path, "")
                },
            };
            log::debug!("discovered {}", identity);
            devices.push(identity);
        }
        Ok(devices)
    }

    fn capabilities(&self, device_path: &Path) -> Result<Vec<SupportedMode>, CaptureError> {
        let device = Device::with_path(device_path)
            .map_err(|e| CaptureError::from_open_error(device_path, &e))?;
        query_modes(&device).map_err(|e| CaptureError::from_open_error(device_path, &e))
    }

    fn open(
        &self,
        spec: &CameraSpec,
        policy: FormatPolicy,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let path = spec.device_path.as_path();
        let open_error = |e: io::Error| CaptureError::from_open_error(path, &e);

        let device = Device::with_path(path).map_err(open_error)?;
        if self.lock_focus {
            focus::lock(path);
        }

        let modes = query_modes(&device).unwrap_or_else(|e| {
            log::debug!("{}: could not enumerate modes: {}", path.display(), e);
            Vec::new()
        });
        let unsupported = |reason: FormatError| CaptureError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason,
        };
        let negotiated = format::negotiate(spec.format, &modes, policy).map_err(unsupported)?;

        let target = negotiated.format;
        let requested = Format::new(
            target.resolution.width,
            target.resolution.height,
            FourCC::new(&target.pixel_format.fourcc()),
        );
        let applied = Capture::set_format(&device, &requested).map_err(open_error)?;
        let params = Capture::set_params(&device, &Parameters::with_fps(target.framerate))
            .map_err(open_error)?;

        let pixel_format = PixelFormat::from_fourcc(applied.fourcc.repr).ok_or_else(|| {
            unsupported(FormatError::UnknownPixelFormat(
                String::from_utf8_lossy(&applied.fourcc.repr).into_owned(),
            ))
        })?;
        let applied = StreamFormat::new(
            Resolution::new(applied.width, applied.height),
            fps_from_interval(params.interval.numerator, params.interval.denominator)
                .unwrap_or(target.framerate),
            pixel_format,
        );
        let negotiated =
            format::reconcile(spec.format, negotiated, applied, policy).map_err(unsupported)?;

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT).map_err(open_error)?;
        stream.set_timeout(READ_TIMEOUT);

        log::info!(
            "{}: streaming {} from {}",
            spec.name,
            negotiated.format,
            path.display()
        );
        Ok(Box::new(V4l2Device {
            stream,
            _device: device,
            format: negotiated,
            last_sequence: None,
        }))
    }
}

/// An open V4L2 device. Dropping it stops streaming and closes the handle.
struct V4l2Device {
    // Declared before the device so buffers are released first.
    stream: MmapStream<'static>,
    _device: Device,
    format: NegotiatedFormat,
    last_sequence: Option<u32>,
}

impl CaptureDevice for V4l2Device {
    fn format(&self) -> NegotiatedFormat {
        self.format
    }

    fn read(&mut self) -> io::Result<ReadOutcome> {
        let (buf, meta) = match CaptureStream::next(&mut self.stream) {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(ReadOutcome::TimedOut),
            Err(e) => return Err(e),
        };

        let dropped_before = match self.last_sequence {
            Some(prev) => meta.sequence.wrapping_sub(prev).saturating_sub(1),
            None => 0,
        };
        self.last_sequence = Some(meta.sequence);

        if meta.flags.contains(BufferFlags::ERROR) {
            return Ok(ReadOutcome::Corrupt {
                reason: "driver flagged the buffer as erroneous".to_string(),
                dropped_before,
            });
        }
        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Ok(ReadOutcome::Corrupt {
                reason: "empty buffer".to_string(),
                dropped_before,
            });
        }
        Ok(ReadOutcome::Buffer {
            data: buf[..used].to_vec(),
            dropped_before,
        })
    }
}

fn is_capture_node(path: &Path) -> bool {
    match Device::with_path(path).and_then(|d| d.query_caps()) {
        Ok(caps) => caps.capabilities.contains(CapabilityFlags::VIDEO_CAPTURE),
        Err(e) => {
            log::debug!("{}: skipped ({})", path.display(), e);
            false
        }
    }
}

fn query_modes(device: &Device) -> io::Result<Vec<SupportedMode>> {
    let mut modes = Vec::new();
    for description in device.enum_formats()? {
        let Some(pixel_format) = PixelFormat::from_fourcc(description.fourcc.repr) else {
            continue;
        };
        for size in device.enum_framesizes(description.fourcc)? {
            for resolution in frame_sizes(&size.size) {
                let mut framerates: Vec<u32> = device
                    .enum_frameintervals(description.fourcc, resolution.width, resolution.height)
                    .map(|intervals| {
                        intervals
                            .iter()
                            .flat_map(|i| interval_rates(&i.interval))
                            .collect()
                    })
                    .unwrap_or_default();
                framerates.sort_unstable_by(|a, b| b.cmp(a));
                framerates.dedup();
                modes.push(SupportedMode::new(pixel_format, resolution, framerates));
            }
        }
    }
    Ok(modes)
}

fn frame_sizes(size: &FrameSizeEnum) -> Vec<Resolution> {
    match size {
        FrameSizeEnum::Discrete(d) => vec![Resolution::new(d.width, d.height)],
        FrameSizeEnum::Stepwise(s) => vec![
            Resolution::new(s.min_width, s.min_height),
            Resolution::new(s.max_width, s.max_height),
        ],
    }
}

fn interval_rates(interval: &FrameIntervalEnum) -> Vec<u32> {
    match interval {
        FrameIntervalEnum::Discrete(f) => {
            fps_from_interval(f.numerator, f.denominator).into_iter().collect()
        }
        FrameIntervalEnum::Stepwise(s) => [&s.min, &s.max]
            .into_iter()
            .filter_map(|f| fps_from_interval(f.numerator, f.denominator))
            .collect(),
    }
}

/// Frames per second for a frame interval of `numerator/denominator` seconds, rounded.
fn fps_from_interval(numerator: u32, denominator: u32) -> Option<u32> {
    if numerator == 0 || denominator == 0 {
        return None;
    }
    let (n, d) = (u64::from(numerator), u64::from(denominator));
    u32::try_from((d + n / 2) / n).ok()
}

/// Walk up from a video4linux node to the USB device directory carrying `idVendor`.
fn usb_parent(node_dir: &Path) -> Option<PathBuf> {
    let mut dir = fs::canonicalize(node_dir.join("device")).ok()?;
    loop {
        if dir.join("idVendor").is_file() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(name)).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_from_interval() {
        assert_eq!(fps_from_interval(1, 30), Some(30));
        assert_eq!(fps_from_interval(1001, 30000), Some(30));
        assert_eq!(fps_from_interval(1, 0), None);
        assert_eq!(fps_from_interval(0, 30), None);
    }

    #[test]
    fn test_usb_parent_walks_up_to_id_vendor() {
        let root = tempfile::tempdir().unwrap();
        let usb = root.path().join("usb1").join("1-2");
        let iface = usb.join("1-2:1.0");
        let node = root.path().join("video4linux").join("video0");
        fs::create_dir_all(iface.join("video4linux")).unwrap();
        fs::create_dir_all(&node).unwrap();
        fs::write(usb.join("idVendor"), "046d\n").unwrap();
        fs::write(usb.join("serial"), "A1B2\n").unwrap();
        std::os::unix::fs::symlink(&iface, node.join("device")).unwrap();

        let found = usb_parent(&node).unwrap();
        assert_eq!(found, fs::canonicalize(&usb).unwrap());
        assert_eq!(read_attr(&found, "serial").as_deref(), Some("A1B2"));
        assert_eq!(read_attr(&found, "missing"), None);
    }

    /// Requires a real camera; prints what was found.
    #[test]
    fn test_discover_does_not_error() {
        let devices = V4l2Backend::new().discover();
        assert!(devices.is_ok(), "discover failed: {:?}", devices.err());
        for device in devices.unwrap() {
            println!("  {}", device);
        }
    }
}
