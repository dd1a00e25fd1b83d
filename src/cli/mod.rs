//! Command-line interface definitions and helpers.
//!
//! This module contains all CLI argument parsing, enums, and subcommand handlers.

mod args;
mod commands;
mod enums;

pub use args::{
    parse_framerate, parse_resolution, parse_usb_id_arg, Args, Command, ConfigAction, FilterArgs,
    RecordArgs,
};
pub use commands::{capabilities, handle_config_action, list, record};
pub use enums::InputFormat;
