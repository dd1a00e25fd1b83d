//! Tests for configuration loading and merging with command-line overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use multiview_recorder::camera::{FormatPolicy, PixelFormat, Resolution, StreamFormat};
use multiview_recorder::config::{resolve_settings, Config, ConfigError, Overrides};
use multiview_recorder::matcher::CameraEntry;

fn parse(content: &str) -> Config {
    Config::from_toml_str(content, Path::new("test.toml")).expect("config should parse")
}

#[test]
fn test_empty_config_uses_defaults() {
    let settings = resolve_settings(&parse(""), &Overrides::default()).unwrap();
    assert_eq!(settings.format, StreamFormat::default());
    assert_eq!(settings.session.output_dir, PathBuf::from("."));
    assert_eq!(settings.session.container, "mkv");
    assert_eq!(settings.session.worker.policy, FormatPolicy::Strict);
    assert!(!settings.session.require_all);
    assert!(settings.lock_focus);
    assert!(settings.cameras.is_none());
    assert!(settings.filter.is_empty());
}

#[test]
fn test_command_line_beats_file() {
    let config = parse(
        r#"
resolution = "640x480"
framerate = 15
input_format = "yuyv"
output_dir = "/srv/recordings"
strict_format = true
lock_focus = true
"#,
    );
    let overrides = Overrides {
        resolution: Some(Resolution::new(1920, 1080)),
        framerate: Some(60),
        output_dir: Some(PathBuf::from("/tmp/run")),
        lenient_format: true,
        no_lock_focus: true,
        vendor_id: Some(0x046d),
        ..Overrides::default()
    };
    let settings = resolve_settings(&config, &overrides).unwrap();

    assert_eq!(
        settings.format,
        StreamFormat::new(Resolution::new(1920, 1080), 60, PixelFormat::Yuyv)
    );
    assert_eq!(settings.session.output_dir, PathBuf::from("/tmp/run"));
    assert_eq!(settings.session.worker.policy, FormatPolicy::ClosestMatch);
    assert!(!settings.lock_focus);
    assert_eq!(settings.filter.vendor_id, Some(0x046d));
    assert_eq!(settings.filter.product_id, None);
}

#[test]
fn test_file_values_are_applied() {
    let config = parse(
        r#"
framerate = "24"
container = "mp4"
strict_format = false
require_all = true
shutdown_timeout_secs = 10
record_queue_depth = 8
record_wait_ms = 50

[[cameras]]
serial = "A1B2"
name = "01_left"

[[cameras]]
serial = "C3D4"
name = "02_right"
"#,
    );
    let settings = resolve_settings(&config, &Overrides::default()).unwrap();

    assert_eq!(settings.format.framerate, 24);
    assert_eq!(settings.session.container, "mp4");
    assert_eq!(settings.session.worker.policy, FormatPolicy::ClosestMatch);
    assert!(settings.session.require_all);
    assert_eq!(settings.session.shutdown_timeout, Duration::from_secs(10));
    assert_eq!(settings.session.worker.record_queue_depth, 8);
    assert_eq!(settings.session.worker.record_wait, Duration::from_millis(50));
    assert_eq!(
        settings.cameras,
        Some(vec![
            CameraEntry::new("A1B2", "01_left"),
            CameraEntry::new("C3D4", "02_right"),
        ])
    );
    assert_eq!(
        settings.session.output_path("01_left"),
        PathBuf::from("./01_left.mp4")
    );
}

#[test]
fn test_invalid_values_name_the_field() {
    let cases = [
        ("resolution = \"wide\"", "resolution"),
        ("resolution = \"9000x9000\"", "resolution"),
        ("framerate = 0", "framerate"),
        ("framerate = \"fast\"", "framerate"),
        ("framerate = 500", "framerate"),
        ("input_format = \"rgb24\"", "input_format"),
        ("container = \"../x\"", "container"),
        ("record_queue_depth = 0", "record_queue_depth"),
    ];
    for (content, expected) in cases {
        match resolve_settings(&parse(content), &Overrides::default()) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected, "{}", content),
            other => panic!("{}: expected an invalid {}, got {:?}", content, expected, other),
        }
    }
}

#[test]
fn test_malformed_file_is_a_parse_error() {
    let err = Config::from_toml_str("resolution = ", Path::new("broken.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("broken.toml"));

    let err = Config::from_toml_str("[[cameras]]\nname = \"left\"\n", Path::new("c.toml"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mvr.toml");
    std::fs::write(&path, "framerate = 60\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    let settings = resolve_settings(&config, &Overrides::default()).unwrap();
    assert_eq!(settings.format.framerate, 60);
}

#[test]
fn test_configured_serials_are_kept_verbatim() {
    let config = parse(
        r#"
[[cameras]]
serial = " A1 "
name = " left "
"#,
    );
    let settings = resolve_settings(&config, &Overrides::default()).unwrap();
    assert_eq!(settings.cameras, Some(vec![CameraEntry::new(" A1 ", "left")]));
}
