//! CLI argument parsing with clap.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use super::enums::InputFormat;
use crate::camera::{parse_usb_id, Resolution};
use crate::config::{Overrides, MAX_FRAMERATE};

/// Parse and validate resolution (WIDTHxHEIGHT format)
pub fn parse_resolution(s: &str) -> Result<Resolution, String> {
    s.parse::<Resolution>().map_err(|e| e.to_string())
}

/// Parse and validate framerate (1-240 fps)
pub fn parse_framerate(s: &str) -> Result<u32, String> {
    let fps: u32 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid framerate", s))?;
    if !(1..=MAX_FRAMERATE).contains(&fps) {
        return Err(format!(
            "Framerate must be between 1 and {} fps, got {}",
            MAX_FRAMERATE, fps
        ));
    }
    Ok(fps)
}

/// Parse a hexadecimal USB vendor or product ID (`046d` or `0x046d`)
pub fn parse_usb_id_arg(s: &str) -> Result<u16, String> {
    parse_usb_id(s).ok_or_else(|| format!("'{}' is not a hexadecimal USB ID (e.g. 046d)", s))
}

/// Synchronized recording from multiple USB cameras
#[derive(Parser, Debug)]
#[command(name = "mvr")]
#[command(version, about = "Record from several USB cameras at once", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Config file path
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record from every matched camera until Ctrl+C (or q + Enter)
    Record(RecordArgs),
    /// List connected capture devices
    List(FilterArgs),
    /// Show the formats, resolutions and frame rates devices support
    Capabilities {
        /// Device nodes to query (default: all discovered devices)
        devices: Vec<PathBuf>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Create a commented config file
    Init,
}

/// USB vendor/product filter.
#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterArgs {
    /// Only use devices with this USB vendor ID (hex)
    #[arg(long, value_parser = parse_usb_id_arg)]
    pub vid: Option<u16>,

    /// Only use devices with this USB product ID (hex)
    #[arg(long, value_parser = parse_usb_id_arg)]
    pub pid: Option<u16>,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct RecordArgs {
    #[command(flatten)]
    pub filter: FilterArgs,

    /// Capture resolution, e.g. 1920x1080
    #[arg(long, short, value_parser = parse_resolution)]
    pub resolution: Option<Resolution>,

    /// Capture frame rate
    #[arg(long, short, value_parser = parse_framerate)]
    pub framerate: Option<u32>,

    /// Pixel format requested from the cameras
    #[arg(long, value_enum)]
    pub input_format: Option<InputFormat>,

    /// Directory for the recordings
    #[arg(long, short)]
    pub output_dir: Option<PathBuf>,

    /// Use the closest supported mode when a camera cannot match the format exactly
    #[arg(long)]
    pub lenient_format: bool,

    /// Fail unless every camera records successfully
    #[arg(long)]
    pub require_all: bool,

    /// Preview only, do not write any files
    #[arg(long)]
    pub no_record: bool,

    /// Do not show the live status display
    #[arg(long)]
    pub no_preview: bool,

    /// Leave autofocus alone
    #[arg(long)]
    pub no_lock_focus: bool,

    /// Use N synthetic cameras instead of hardware
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..=16))]
    pub simulate: Option<u32>,
}

impl RecordArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            resolution: self.resolution,
            framerate: self.framerate,
            input_format: self.input_format.map(Into::into),
            output_dir: self.output_dir.clone(),
            vendor_id: self.filter.vid,
            product_id: self.filter.pid,
            lenient_format: self.lenient_format,
            require_all: self.require_all,
            no_lock_focus: self.no_lock_focus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PixelFormat;

    fn record(args: Args) -> RecordArgs {
        match args.command {
            Command::Record(record) => record,
            other => panic!("Expected Record subcommand, got {:?}", other),
        }
    }

    #[test]
    fn test_record_defaults() {
        let args = record(Args::parse_from(["mvr", "record"]));
        assert!(args.resolution.is_none());
        assert!(args.framerate.is_none());
        assert!(args.input_format.is_none());
        assert!(!args.lenient_format);
        assert!(!args.require_all);
        assert!(!args.no_record);
        assert!(args.simulate.is_none());
        assert_eq!(args.overrides(), Overrides::default());
    }

    #[test]
    fn test_record_overrides() {
        let args = record(Args::parse_from([
            "mvr",
            "record",
            "--vid",
            "046d",
            "--pid",
            "0x082D",
            "-r",
            "1920x1080",
            "-f",
            "60",
            "--input-format",
            "yuyv",
            "-o",
            "/data/run1",
            "--lenient-format",
            "--require-all",
        ]));
        let overrides = args.overrides();
        assert_eq!(overrides.vendor_id, Some(0x046d));
        assert_eq!(overrides.product_id, Some(0x082d));
        assert_eq!(overrides.resolution, Some(Resolution::new(1920, 1080)));
        assert_eq!(overrides.framerate, Some(60));
        assert_eq!(overrides.input_format, Some(PixelFormat::Yuyv));
        assert_eq!(overrides.output_dir, Some(PathBuf::from("/data/run1")));
        assert!(overrides.lenient_format);
        assert!(overrides.require_all);
    }

    #[test]
    fn test_input_format_alias() {
        let args = record(Args::parse_from(["mvr", "record", "--input-format", "mjpg"]));
        assert_eq!(args.input_format, Some(InputFormat::Mjpeg));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Args::try_parse_from(["mvr", "record", "-r", "1280"]).is_err());
        assert!(Args::try_parse_from(["mvr", "record", "-r", "0x720"]).is_err());
        assert!(Args::try_parse_from(["mvr", "record", "-r", "8000x5000"]).is_err());
        assert!(Args::try_parse_from(["mvr", "record", "-f", "0"]).is_err());
        assert!(Args::try_parse_from(["mvr", "record", "-f", "241"]).is_err());
        assert!(Args::try_parse_from(["mvr", "record", "--vid", "xyz"]).is_err());
        assert!(Args::try_parse_from(["mvr", "record", "--simulate", "0"]).is_err());
    }

    #[test]
    fn test_global_options() {
        let args = Args::parse_from(["mvr", "list", "-vv", "--config", "/tmp/mvr.toml"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/mvr.toml")));
        assert!(matches!(args.command, Command::List(_)));
    }

    #[test]
    fn test_capabilities_devices() {
        let args = Args::parse_from(["mvr", "capabilities", "/dev/video0", "/dev/video2"]);
        match args.command {
            Command::Capabilities { devices, filter } => {
                assert_eq!(devices.len(), 2);
                assert_eq!(filter, FilterArgs::default());
            }
            _ => panic!("Expected Capabilities subcommand"),
        }
    }

    #[test]
    fn test_config_subcommands() {
        let args = Args::parse_from(["mvr", "config", "show"]);
        assert!(matches!(
            args.command,
            Command::Config {
                action: ConfigAction::Show
            }
        ));

        let args = Args::parse_from(["mvr", "config", "init"]);
        assert!(matches!(
            args.command,
            Command::Config {
                action: ConfigAction::Init
            }
        ));
    }
}
