//! Text output for `mvr list` and `mvr capabilities`.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::camera::{DeviceIdentity, PixelFormat, SupportedMode};

fn usb_id(id: Option<u16>) -> String {
    id.map_or_else(|| "-".to_string(), |id| format!("{:04x}", id))
}

/// Table of discovered devices, one per line, with a header.
pub fn format_device_table(devices: &[DeviceIdentity]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<14} {:<28} {:<6} {:<6} {}",
        "DEVICE", "NAME", "VID", "PID", "SERIAL"
    );
    for device in devices {
        let product = if device.product.is_empty() {
            "-"
        } else {
            device.product.as_str()
        };
        let serial = if device.serial.is_empty() {
            "(none)"
        } else {
            device.serial.as_str()
        };
        let _ = writeln!(
            out,
            "{:<14} {:<28} {:<6} {:<6} {}",
            device.device_path.display(),
            product,
            usb_id(device.vendor_id),
            usb_id(device.product_id),
            serial
        );
    }
    out
}

/// Supported modes of one device, grouped by pixel format.
///
/// ```text
/// /dev/video0 (HD Pro Webcam C920)
///   MJPEG
///     1920x1080  30
///     1280x720   30 24 15
/// ```
pub fn format_capabilities(device: &DeviceIdentity, modes: &[SupportedMode]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", device);
    if modes.is_empty() {
        let _ = writeln!(out, "  (driver does not enumerate its modes)");
        return out;
    }

    let mut by_format: BTreeMap<String, Vec<&SupportedMode>> = BTreeMap::new();
    for format in PixelFormat::ALL {
        let matching: Vec<&SupportedMode> =
            modes.iter().filter(|m| m.pixel_format == format).collect();
        if !matching.is_empty() {
            by_format.insert(format.to_string(), matching);
        }
    }

    for (format, mut modes) in by_format {
        let _ = writeln!(out, "  {}", format);
        modes.sort_by(|a, b| b.resolution.area().cmp(&a.resolution.area()));
        for mode in modes {
            let rates: Vec<String> = mode.framerates.iter().map(|r| r.to_string()).collect();
            let _ = writeln!(
                out,
                "    {:<10} {}",
                mode.resolution.to_string(),
                if rates.is_empty() {
                    "?".to_string()
                } else {
                    rates.join(" ")
                }
            );
        }
    }
    out
}
