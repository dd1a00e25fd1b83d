//! Manual focus lock through `v4l2-ctl`.
//!
//! Cameras are switched to a fixed focus before they start streaming. Any
//! failure here is a warning only.

use std::path::Path;
use std::process::{Command, Stdio};

/// Controls applied, in order.
pub const FOCUS_CONTROLS: [&str; 2] = ["focus_automatic_continuous=0", "focus_absolute=0"];

/// Arguments passed to `v4l2-ctl` for one control.
pub fn focus_args(device: &Path, control: &str) -> Vec<String> {
    vec![
        "-d".to_string(),
        device.display().to_string(),
        format!("--set-ctrl={}", control),
    ]
}

/// Disable continuous autofocus and park focus at infinity.
pub fn lock(device: &Path) {
    for control in FOCUS_CONTROLS {
        let output = Command::new("v4l2-ctl")
            .args(focus_args(device, control))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        match output {
            Ok(out) if out.status.success() => {
                log::debug!("{}: set {}", device.display(), control);
            }
            Ok(out) => {
                log::warn!(
                    "{}: could not set {}: {}",
                    device.display(),
                    control,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("v4l2-ctl not found, autofocus left enabled (install v4l-utils)");
                return;
            }
            Err(e) => {
                log::warn!("{}: failed to run v4l2-ctl: {}", device.display(), e);
                return;
            }
        }
    }
}
