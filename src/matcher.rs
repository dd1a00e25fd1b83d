//! Device matching: discovered hardware + configuration -> named cameras.
//!
//! Matching is by exact serial number only. Vendor/product IDs identify a
//! model, not a unit, so they are only ever used as a filter.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::camera::{CameraSpec, CaptureBackend, DeviceIdentity, DiscoveryError, StreamFormat};

/// One `[[cameras]]` entry: the serial of a physical camera and its label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraEntry {
    pub serial: String,
    pub name: String,
}

impl CameraEntry {
    pub fn new(serial: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            name: name.into(),
        }
    }
}

/// USB vendor/product filter from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsbFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl UsbFilter {
    /// A device passes when it matches every ID that is set.
    pub fn matches(&self, device: &DeviceIdentity) -> bool {
        let vendor_ok = self.vendor_id.map_or(true, |v| device.vendor_id == Some(v));
        let product_ok = self.product_id.map_or(true, |p| device.product_id == Some(p));
        vendor_ok && product_ok
    }

    pub fn is_empty(&self) -> bool {
        self.vendor_id.is_none() && self.product_id.is_none()
    }
}

/// How one discovered device (or configured entry) was classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(CameraSpec),
    /// Filtered out, or not listed in a named session
    Unmatched(DeviceIdentity),
    /// Several devices carry the serial of one configured entry
    Ambiguous {
        entry: CameraEntry,
        devices: Vec<DeviceIdentity>,
    },
    /// A configured camera that is not connected
    Missing(CameraEntry),
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("camera '{name}' (serial {serial}) matches more than one device: {devices:?}")]
    AmbiguousDeviceMatch {
        name: String,
        serial: String,
        devices: Vec<PathBuf>,
    },

    #[error("camera name '{name}' is used more than once")]
    DuplicateCameraName { name: String },

    #[error("serial '{serial}' is configured more than once")]
    DuplicateConfiguredSerial { serial: String },

    #[error("camera entry #{index} is invalid: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("device {} was matched twice", .path.display())]
    DuplicateDevice { path: PathBuf },

    #[error("no cameras matched ({discovered} capture device(s) found)")]
    NoCamerasMatched { discovered: usize },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Enumerate capture devices through `backend`.
pub fn discover(backend: &dyn CaptureBackend) -> Result<Vec<DeviceIdentity>, MatchError> {
    let devices = backend.discover()?;
    log::debug!("discovered {} capture device(s)", devices.len());
    Ok(devices)
}

/// Reject configuration entries that could silently record the wrong camera.
pub fn validate_entries(entries: &[CameraEntry]) -> Result<(), MatchError> {
    let mut names = HashSet::new();
    let mut serials = HashSet::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.serial.trim().is_empty() {
            return Err(MatchError::InvalidEntry {
                index,
                reason: "serial is empty".to_string(),
            });
        }
        if entry.serial.trim() != entry.serial {
            return Err(MatchError::InvalidEntry {
                index,
                reason: format!("serial '{}' has surrounding whitespace", entry.serial),
            });
        }
        if entry.name.trim().is_empty() {
            return Err(MatchError::InvalidEntry {
                index,
                reason: "name is empty".to_string(),
            });
        }
        if entry.name.contains(['/', '\\']) {
            return Err(MatchError::InvalidEntry {
                index,
                reason: format!("name '{}' contains a path separator", entry.name),
            });
        }
        if !names.insert(entry.name.as_str()) {
            return Err(MatchError::DuplicateCameraName {
                name: entry.name.clone(),
            });
        }
        if !serials.insert(entry.serial.as_str()) {
            return Err(MatchError::DuplicateConfiguredSerial {
                serial: entry.serial.clone(),
            });
        }
    }
    Ok(())
}

/// Whether `name` can be used as a recording file name as-is.
fn is_file_stem(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Classify every discovered device.
///
/// With `entries` (a named session) each entry is matched by exact serial;
/// without them (an ad-hoc session) every device passing `filter` is taken
/// and named after its serial, or after its device node when the serial is
/// empty, shared with another device, or not usable as a file name.
pub fn classify(
    discovered: &[DeviceIdentity],
    entries: Option<&[CameraEntry]>,
    filter: &UsbFilter,
    format: StreamFormat,
) -> Vec<MatchOutcome> {
    let mut outcomes = Vec::new();
    let mut candidates = Vec::new();
    for device in discovered {
        if filter.matches(device) {
            candidates.push(device);
        } else {
            outcomes.push(MatchOutcome::Unmatched(device.clone()));
        }
    }

    match entries {
        Some(entries) => {
            let mut claimed = HashSet::new();
            for entry in entries {
                let hits: Vec<&DeviceIdentity> = candidates
                    .iter()
                    .copied()
                    .filter(|d| d.serial == entry.serial)
                    .collect();
                match hits.as_slice() {
                    [] => outcomes.push(MatchOutcome::Missing(entry.clone())),
                    [device] => {
                        claimed.insert(device.device_path.clone());
                        outcomes.push(MatchOutcome::Matched(CameraSpec::from_identity(
                            device,
                            entry.name.clone(),
                            format,
                        )));
                    }
                    _ => {
                        for device in &hits {
                            claimed.insert(device.device_path.clone());
                        }
                        outcomes.push(MatchOutcome::Ambiguous {
                            entry: entry.clone(),
                            devices: hits.into_iter().cloned().collect(),
                        });
                    }
                }
            }
            for device in candidates {
                if !claimed.contains(&device.device_path) {
                    outcomes.push(MatchOutcome::Unmatched(device.clone()));
                }
            }
        }
        None => {
            let mut serial_counts: BTreeMap<&str, usize> = BTreeMap::new();
            for device in &candidates {
                *serial_counts.entry(device.serial.as_str()).or_default() += 1;
            }
            for device in candidates {
                let shared = serial_counts.get(device.serial.as_str()).copied().unwrap_or(0) > 1;
                let name = if shared || !is_file_stem(&device.serial) {
                    device.node_name()
                } else {
                    device.serial.clone()
                };
                outcomes.push(MatchOutcome::Matched(CameraSpec::from_identity(
                    device, name, format,
                )));
            }
        }
    }
    outcomes
}

/// Resolve discovered devices into the ordered cameras of a session.
///
/// Named sessions are ordered by camera name, ad-hoc sessions by serial and
/// then device path. Any ambiguity, a duplicate name or an empty result is
/// an error and no camera is returned.
pub fn resolve(
    discovered: &[DeviceIdentity],
    entries: Option<&[CameraEntry]>,
    filter: &UsbFilter,
    format: StreamFormat,
) -> Result<Vec<CameraSpec>, MatchError> {
    if let Some(entries) = entries {
        validate_entries(entries)?;
    }

    let mut specs = Vec::new();
    for outcome in classify(discovered, entries, filter, format) {
        match outcome {
            MatchOutcome::Matched(spec) => specs.push(spec),
            MatchOutcome::Unmatched(device) => {
                log::debug!("not recording {}", device);
            }
            MatchOutcome::Missing(entry) => {
                log::warn!(
                    "configured camera '{}' (serial {}) is not connected",
                    entry.name,
                    entry.serial
                );
            }
            MatchOutcome::Ambiguous { entry, devices } => {
                return Err(MatchError::AmbiguousDeviceMatch {
                    name: entry.name,
                    serial: entry.serial,
                    devices: devices.into_iter().map(|d| d.device_path).collect(),
                });
            }
        }
    }

    let mut names = HashSet::new();
    let mut paths = HashSet::new();
    for spec in &specs {
        if !names.insert(spec.name.clone()) {
            return Err(MatchError::DuplicateCameraName {
                name: spec.name.clone(),
            });
        }
        if !paths.insert(spec.device_path.clone()) {
            return Err(MatchError::DuplicateDevice {
                path: spec.device_path.clone(),
            });
        }
    }

    if specs.is_empty() {
        return Err(MatchError::NoCamerasMatched {
            discovered: discovered.len(),
        });
    }

    if entries.is_some() {
        specs.sort_by(|a, b| a.name.cmp(&b.name));
    } else {
        specs.sort_by(|a, b| {
            a.serial
                .cmp(&b.serial)
                .then_with(|| a.device_path.cmp(&b.device_path))
        });
    }

    for spec in &specs {
        log::info!("camera {}", spec);
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PixelFormat, Resolution};

    fn format() -> StreamFormat {
        StreamFormat::new(Resolution::HD, 30, PixelFormat::Mjpeg)
    }

    fn device(path: &str, serial: &str) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: Some(0x046d),
            product_id: Some(0x082d),
            ..DeviceIdentity::new(path, serial)
        }
    }

    #[test]
    fn test_filter_requires_every_given_id() {
        let dev = device("/dev/video0", "A1");
        assert!(UsbFilter::default().matches(&dev));
        let vendor_only = UsbFilter {
            vendor_id: Some(0x046d),
            product_id: None,
        };
        assert!(vendor_only.matches(&dev));
        let wrong_product = UsbFilter {
            vendor_id: Some(0x046d),
            product_id: Some(0x0825),
        };
        assert!(!wrong_product.matches(&dev));
    }

    #[test]
    fn test_classify_tags_missing_entries() {
        let devices = vec![device("/dev/video0", "A1")];
        let entries = vec![CameraEntry::new("A1", "left"), CameraEntry::new("B2", "right")];
        let outcomes = classify(&devices, Some(&entries), &UsbFilter::default(), format());
        assert!(matches!(&outcomes[0], MatchOutcome::Matched(spec) if spec.name == "left"));
        assert_eq!(outcomes[1], MatchOutcome::Missing(entries[1].clone()));
    }

    #[test]
    fn test_adhoc_names_fall_back_to_node() {
        let devices = vec![
            device("/dev/video0", "SN1"),
            device("/dev/video2", ""),
            device("/dev/video4", "DUP"),
            device("/dev/video6", "DUP"),
        ];
        let specs = resolve(&devices, None, &UsbFilter::default(), format()).unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["video2", "video4", "video6", "SN1"]);
    }

    #[test]
    fn test_entry_validation() {
        let dup_name = vec![CameraEntry::new("A", "cam"), CameraEntry::new("B", "cam")];
        assert!(matches!(
            validate_entries(&dup_name),
            Err(MatchError::DuplicateCameraName { .. })
        ));

        let dup_serial = vec![CameraEntry::new("A", "one"), CameraEntry::new("A", "two")];
        assert!(matches!(
            validate_entries(&dup_serial),
            Err(MatchError::DuplicateConfiguredSerial { .. })
        ));

        let empty = vec![CameraEntry::new("", "one")];
        assert!(matches!(
            validate_entries(&empty),
            Err(MatchError::InvalidEntry { index: 0, .. })
        ));

        let slash = vec![CameraEntry::new("A", "../evil")];
        assert!(validate_entries(&slash).is_err());
    }
}
