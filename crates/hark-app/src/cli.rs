//! CLI argument definitions for the Hark binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Hark - on-device wake-word orchestration.
#[derive(Parser, Debug)]
#[command(name = "hark", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive the whole stack over mock collaborators, printing events as
    /// JSON lines.
    Simulate(SimulateArgs),
    /// Print the resolved configuration as TOML.
    ShowConfig,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of wake cycles to run.
    #[arg(long, default_value_t = 1)]
    pub cycles: u32,

    /// Hold a phone call across each cycle's first detection attempt.
    #[arg(long)]
    pub with_call: bool,

    /// Capture channel count reported by the trigger layer (1..=4).
    #[arg(long, default_value_t = 1)]
    pub channels: u8,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > HARK_CONFIG env var > ~/.hark/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("HARK_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

fn default_config_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".hark").join("config.toml");
    }
    PathBuf::from("config.toml")
}
