//! Configuration file handling for mvr.
//!
//! Loads configuration from `<config_dir>/multiview-recorder/config.toml` or a
//! custom path, then merges it with command-line overrides into [`Settings`].
//! Precedence is command line, then file, then built-in default.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::camera::{FormatPolicy, PixelFormat, Resolution, StreamFormat, WorkerOptions};
use crate::matcher::{CameraEntry, UsbFilter};
use crate::session::SessionOptions;

/// Highest frame rate accepted anywhere.
pub const MAX_FRAMERATE: u32 = 240;

/// Configuration file structure.
///
/// Every field is optional; a missing field falls back to its default.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    pub resolution: Option<String>,
    pub framerate: Option<FramerateValue>,
    pub input_format: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub container: Option<String>,
    pub strict_format: Option<bool>,
    pub require_all: Option<bool>,
    pub lock_focus: Option<bool>,
    pub shutdown_timeout_secs: Option<u64>,
    pub record_queue_depth: Option<usize>,
    pub record_wait_ms: Option<u64>,
    /// Presence selects a named session
    pub cameras: Option<Vec<CameraConfig>>,
}

/// `framerate = 30` and `framerate = "30"` are both accepted.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum FramerateValue {
    Number(u32),
    Text(String),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CameraConfig {
    pub serial: String,
    pub name: String,
}

impl Config {
    /// Load configuration from a file path, or from the default location.
    ///
    /// A missing default file yields the default configuration; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let path = default_path();
                if !path.exists() {
                    log::debug!("no config file at {}, using defaults", path.display());
                    return Ok(Config::default());
                }
                path
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.clone(),
            source: e,
        })?;
        let config = Self::from_toml_str(&content, &path)?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse configuration text; `path` is only used in error messages.
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("config file already exists: {}", .path.display())]
    AlreadyExists { path: PathBuf },
}

/// Get the default config file path.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("multiview-recorder").join("config.toml"))
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config/multiview-recorder/config.toml")
        })
}

/// Values given on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub resolution: Option<Resolution>,
    pub framerate: Option<u32>,
    pub input_format: Option<PixelFormat>,
    pub output_dir: Option<PathBuf>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// Accept the closest supported mode instead of failing
    pub lenient_format: bool,
    pub require_all: bool,
    pub no_lock_focus: bool,
}

/// Fully merged settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Format requested from every camera
    pub format: StreamFormat,
    /// `Some` for a named session
    pub cameras: Option<Vec<CameraEntry>>,
    pub filter: UsbFilter,
    pub lock_focus: bool,
    pub session: SessionOptions,
}

/// Merge `config` and `overrides` over the built-in defaults.
pub fn resolve_settings(config: &Config, overrides: &Overrides) -> Result<Settings, ConfigError> {
    let resolution = match (overrides.resolution, &config.resolution) {
        (Some(r), _) => r,
        (None, Some(s)) => s.parse().map_err(|e| invalid("resolution", e))?,
        (None, None) => Resolution::default(),
    };

    let framerate = match (overrides.framerate, &config.framerate) {
        (Some(f), _) => f,
        (None, Some(FramerateValue::Number(n))) => *n,
        (None, Some(FramerateValue::Text(s))) => s
            .trim()
            .parse()
            .map_err(|_| invalid("framerate", format!("'{}' is not a number", s)))?,
        (None, None) => 30,
    };
    if !(1..=MAX_FRAMERATE).contains(&framerate) {
        return Err(invalid(
            "framerate",
            format!("must be between 1 and {}, got {}", MAX_FRAMERATE, framerate),
        ));
    }

    let pixel_format = match (overrides.input_format, &config.input_format) {
        (Some(f), _) => f,
        (None, Some(s)) => s.parse().map_err(|e| invalid("input_format", e))?,
        (None, None) => PixelFormat::default(),
    };

    let container = config.container.clone().unwrap_or_else(|| "mkv".to_string());
    if container.is_empty() || !container.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid(
            "container",
            format!("'{}' is not a file extension", container),
        ));
    }

    let record_queue_depth = config.record_queue_depth.unwrap_or(64);
    if record_queue_depth == 0 {
        return Err(invalid("record_queue_depth", "must be at least 1"));
    }

    let strict = !overrides.lenient_format && config.strict_format.unwrap_or(true);
    let worker = WorkerOptions {
        policy: if strict {
            FormatPolicy::Strict
        } else {
            FormatPolicy::ClosestMatch
        },
        record_queue_depth,
        record_wait: Duration::from_millis(config.record_wait_ms.unwrap_or(200)),
        ..WorkerOptions::default()
    };

    let session = SessionOptions {
        output_dir: overrides
            .output_dir
            .clone()
            .or_else(|| config.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from(".")),
        container,
        require_all: overrides.require_all || config.require_all.unwrap_or(false),
        shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs.unwrap_or(5)),
        worker,
        ..SessionOptions::default()
    };

    Ok(Settings {
        format: StreamFormat::new(resolution, framerate, pixel_format),
        cameras: config.cameras.as_ref().map(|cameras| {
            cameras
                .iter()
                .map(|c| CameraEntry::new(c.serial.as_str(), c.name.trim()))
                .collect()
        }),
        filter: UsbFilter {
            vendor_id: overrides.vendor_id,
            product_id: overrides.product_id,
        },
        lock_focus: !overrides.no_lock_focus && config.lock_focus.unwrap_or(true),
        session,
    })
}

fn invalid(field: &'static str, message: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.to_string(),
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Format: {}", self.format)?;
        writeln!(f, "  Output: {}/*.{}", self.session.output_dir.display(), self.session.container)?;
        let policy = match self.session.worker.policy {
            FormatPolicy::Strict => "strict",
            FormatPolicy::ClosestMatch => "closest match",
        };
        writeln!(f, "  Format policy: {}", policy)?;
        writeln!(f, "  Require all cameras: {}", yes_no(self.session.require_all))?;
        writeln!(f, "  Lock focus: {}", yes_no(self.lock_focus))?;
        writeln!(f, "  Shutdown timeout: {:?}", self.session.shutdown_timeout)?;
        writeln!(
            f,
            "  Recording queue: {} frames, {:?} max wait",
            self.session.worker.record_queue_depth, self.session.worker.record_wait
        )?;
        match &self.cameras {
            Some(cameras) => {
                writeln!(f, "  Cameras (named session):")?;
                for camera in cameras {
                    writeln!(f, "    {} <- serial {}", camera.name, camera.serial)?;
                }
            }
            None => writeln!(f, "  Cameras: all connected (ad-hoc session)")?,
        }
        Ok(())
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Commented template written by `mvr config init`.
pub const TEMPLATE: &str = r#"# mvr (multiview-recorder) configuration

# Format requested from every camera
resolution = "1280x720"
framerate = 30
# mjpeg, yuyv or h264
input_format = "mjpeg"

# Recordings are written to <output_dir>/<camera name>.<container>
output_dir = "."
container = "mkv"

# Fail a camera that cannot deliver exactly this format
# (false: use its closest supported mode and report the difference)
strict_format = true
# Exit with an error unless every camera recorded successfully
require_all = false
# Switch off autofocus before recording (needs v4l2-ctl)
lock_focus = true

shutdown_timeout_secs = 5
record_queue_depth = 64
record_wait_ms = 200

# Name cameras by serial number (see `mvr list`). With at least one
# [[cameras]] entry only the listed cameras are recorded.
# [[cameras]]
# serial = "A1B2C3D4"
# name = "01_left"
#
# [[cameras]]
# serial = "E5F6A7B8"
# name = "02_right"
"#;

/// Write [`TEMPLATE`] to `path`, refusing to overwrite an existing file.
pub fn write_template(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(path, TEMPLATE).map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_to_defaults() {
        let config = Config::from_toml_str(TEMPLATE, Path::new("template.toml")).unwrap();
        assert!(config.cameras.is_none());
        let settings = resolve_settings(&config, &Overrides::default()).unwrap();
        assert_eq!(settings.format, StreamFormat::default());
        assert_eq!(settings.session.worker.policy, FormatPolicy::Strict);
        assert_eq!(settings.session.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_write_template_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        write_template(&path).unwrap();
        assert!(Config::load(Some(&path)).is_ok());
        assert!(matches!(
            write_template(&path),
            Err(ConfigError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_settings_display_lists_cameras() {
        let config = Config {
            cameras: Some(vec![CameraConfig {
                serial: "A1".to_string(),
                name: "01_left".to_string(),
            }]),
            ..Config::default()
        };
        let settings = resolve_settings(&config, &Overrides::default()).unwrap();
        let shown = settings.to_string();
        assert!(shown.contains("01_left <- serial A1"));
        assert!(shown.contains("1280x720@30 MJPEG"));
    }
}
