use clap::Parser;
use multiview_recorder::cli::{self, Args, Command};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins unless `-v` was given.
fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    let config_path = args.config.as_deref();

    match &args.command {
        Command::Record(record) => cli::record(record, config_path),
        Command::List(filter) => cli::list(filter),
        Command::Capabilities { devices, filter } => cli::capabilities(devices, filter),
        Command::Config { action } => cli::handle_config_action(action, config_path),
    }
}
