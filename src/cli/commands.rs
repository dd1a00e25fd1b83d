//! Subcommand handlers.
//!
//! Exit codes: 0 success, 1 runtime failure, 2 configuration or matching error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use super::args::{ConfigAction, FilterArgs, RecordArgs};
use crate::camera::{hardware_backend, CaptureBackend, DeviceIdentity, FormatPolicy, PixelFormat};
use crate::cancel::install_interrupt_handler;
use crate::config::{self, resolve_settings, Config, Overrides, Settings};
use crate::devices::{format_capabilities, format_device_table};
use crate::matcher::{self, MatchError, UsbFilter};
use crate::session::{Session, SessionError};
use crate::sim::SimBackend;
use crate::sinks::{AsciiPreview, FfmpegRecorder, PreviewSink, StatusPreview};

const EXIT_RUNTIME: u8 = 1;
const EXIT_CONFIG: u8 = 2;

fn load_settings(config_path: Option<&Path>, overrides: &Overrides) -> Result<Settings, ExitCode> {
    let config = Config::load(config_path).map_err(|e| {
        eprintln!("Error: {}", e);
        ExitCode::from(EXIT_CONFIG)
    })?;
    resolve_settings(&config, overrides).map_err(|e| {
        eprintln!("Error: {}", e);
        ExitCode::from(EXIT_CONFIG)
    })
}

fn open_hardware(lock_focus: bool) -> Result<Arc<dyn CaptureBackend>, ExitCode> {
    match hardware_backend(lock_focus) {
        Ok(backend) => Ok(Arc::from(backend)),
        Err(e) => {
            eprintln!("Error: {}", e);
            Err(ExitCode::from(EXIT_RUNTIME))
        }
    }
}

fn discover(backend: &dyn CaptureBackend, filter: &UsbFilter) -> Result<Vec<DeviceIdentity>, ExitCode> {
    match matcher::discover(backend) {
        Ok(devices) => Ok(devices.into_iter().filter(|d| filter.matches(d)).collect()),
        Err(e) => {
            eprintln!("Error: {}", e);
            Err(ExitCode::from(EXIT_RUNTIME))
        }
    }
}

/// Run a recording session.
pub fn record(args: &RecordArgs, config_path: Option<&Path>) -> ExitCode {
    let mut settings = match load_settings(config_path, &args.overrides()) {
        Ok(settings) => settings,
        Err(code) => return code,
    };

    let backend: Arc<dyn CaptureBackend> = match args.simulate {
        Some(count) => {
            log::info!("simulating {} camera(s)", count);
            settings.session.worker.policy = FormatPolicy::ClosestMatch;
            Arc::new(SimBackend::synthetic(count as usize, settings.format.framerate))
        }
        None => match open_hardware(settings.lock_focus) {
            Ok(backend) => backend,
            Err(code) => return code,
        },
    };

    let specs = match matcher::discover(backend.as_ref()).and_then(|devices| {
        matcher::resolve(
            &devices,
            settings.cameras.as_deref(),
            &settings.filter,
            settings.format,
        )
    }) {
        Ok(specs) => specs,
        Err(e) => {
            eprintln!("Error: {}", e);
            return match e {
                MatchError::Discovery(_) => ExitCode::from(EXIT_RUNTIME),
                MatchError::NoCamerasMatched { .. } => {
                    eprintln!("Run 'mvr list' to see connected cameras and their serials.");
                    ExitCode::from(EXIT_CONFIG)
                }
                _ => ExitCode::from(EXIT_CONFIG),
            };
        }
    };

    let require_all = settings.session.require_all;
    let pixel_format = settings.format.pixel_format;
    let output_dir = settings.session.output_dir.clone();
    let mut session = Session::new(backend, settings.session);
    if !args.no_record {
        session = session.with_recorder(Arc::new(FfmpegRecorder::new()));
    }
    if !args.no_preview {
        // Compressed streams would need decoding for a picture.
        let preview: Box<dyn PreviewSink> = match pixel_format {
            PixelFormat::Yuyv => {
                let (cols, rows) = AsciiPreview::DEFAULT_SIZE;
                Box::new(AsciiPreview::new(cols, rows))
            }
            PixelFormat::Mjpeg | PixelFormat::H264 => Box::new(StatusPreview::new()),
        };
        session = session.with_preview(preview);
    }
    if let Err(e) = install_interrupt_handler(session.cancel_token()) {
        log::warn!("could not install Ctrl+C handler: {}", e);
    }

    let cameras = specs.len();
    let result = match session.run(specs) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {}", e);
            return match e {
                SessionError::NoCameras | SessionError::DuplicateCameraName(_) => {
                    ExitCode::from(EXIT_CONFIG)
                }
                _ => ExitCode::from(EXIT_RUNTIME),
            };
        }
    };

    let stopped = result
        .per_camera_outcome
        .values()
        .filter(|o| o.terminal == crate::session::Terminal::Stopped)
        .count();
    if args.no_record {
        println!("{} of {} camera(s) ran to completion.", stopped, cameras);
    } else {
        println!(
            "Recorded {} of {} camera(s) into {}",
            stopped,
            cameras,
            output_dir.display()
        );
    }
    ExitCode::from(result.exit_code(require_all) as u8)
}

/// List available capture devices and print them to stdout.
pub fn list(filter: &FilterArgs) -> ExitCode {
    let backend = match open_hardware(false) {
        Ok(backend) => backend,
        Err(code) => return code,
    };
    let filter = UsbFilter {
        vendor_id: filter.vid,
        product_id: filter.pid,
    };
    let devices = match discover(backend.as_ref(), &filter) {
        Ok(devices) => devices,
        Err(code) => return code,
    };

    if devices.is_empty() {
        println!("No capture devices found.");
        println!();
        println!("Make sure the cameras are connected and you can read /dev/video*");
        println!("(on most distributions: add yourself to the 'video' group).");
    } else {
        print!("{}", format_device_table(&devices));
        println!();
        println!("Use the SERIAL column for [[cameras]] entries in the config file.");
    }
    ExitCode::SUCCESS
}

/// Print the supported modes of the given (or all discovered) devices.
pub fn capabilities(paths: &[PathBuf], filter: &FilterArgs) -> ExitCode {
    let backend = match open_hardware(false) {
        Ok(backend) => backend,
        Err(code) => return code,
    };
    let filter = UsbFilter {
        vendor_id: filter.vid,
        product_id: filter.pid,
    };
    let discovered = match discover(backend.as_ref(), &filter) {
        Ok(devices) => devices,
        Err(code) => return code,
    };

    let targets: Vec<DeviceIdentity> = if paths.is_empty() {
        discovered
    } else {
        paths
            .iter()
            .map(|path| {
                discovered
                    .iter()
                    .find(|d| &d.device_path == path)
                    .cloned()
                    .unwrap_or_else(|| DeviceIdentity::new(path.clone(), ""))
            })
            .collect()
    };
    if targets.is_empty() {
        println!("No capture devices found.");
        return ExitCode::SUCCESS;
    }

    let mut failed = false;
    for device in &targets {
        match backend.capabilities(&device.device_path) {
            Ok(modes) => print!("{}", format_capabilities(device, &modes)),
            Err(e) => {
                eprintln!("{}: {}", device.device_path.display(), e);
                failed = true;
            }
        }
    }
    if failed {
        ExitCode::from(EXIT_RUNTIME)
    } else {
        ExitCode::SUCCESS
    }
}

/// Handle config subcommand actions.
pub fn handle_config_action(action: &ConfigAction, config_path: Option<&Path>) -> ExitCode {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_path);
    match action {
        ConfigAction::Show => {
            let settings = match load_settings(config_path, &Overrides::default()) {
                Ok(settings) => settings,
                Err(code) => return code,
            };
            println!("Current configuration:");
            print!("{}", settings);
            println!();
            if path.exists() {
                println!("Config file: {} (exists)", path.display());
            } else {
                println!("Config file: {} (not found)", path.display());
            }
            ExitCode::SUCCESS
        }
        ConfigAction::Init => match config::write_template(&path) {
            Ok(()) => {
                println!("Created config file: {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("Use 'mvr config show' to view current settings.");
                ExitCode::from(EXIT_RUNTIME)
            }
        },
    }
}
