//! Command-line argument parsing.

use clap::Parser;

/// coreup update engine - A/B system update daemon
#[derive(Parser, Debug)]
#[command(name = "coreup-engine")]
#[command(about = "coreup update engine - A/B system update daemon")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Run a single update attempt and exit
    #[arg(long)]
    pub once: bool,
}
