//! Hark application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Initialise tracing (RUST_LOG, else the configured level)
//! 3. Run the requested command

mod cli;
mod simulate;

use std::process::ExitCode;

use clap::Parser;
use hark_core::HarkConfig;

use cli::{CliArgs, Command};

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let config = HarkConfig::load_or_default(&config_file);
    let level = args.resolve_log_level(&config.general.log_level);

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .init();

    tracing::info!("Starting Hark v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration loaded");

    let outcome = match args.command {
        Command::Simulate(opts) => simulate::run(config, &opts),
        Command::ShowConfig => show_config(&config),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Hark exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn show_config(config: &HarkConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
