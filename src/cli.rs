//! CLI definitions for synwarden.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "synwarden",
    version,
    about = "SYN-flood detection daemon\n\nTracks per-source SYN rates, confirms floods against the kernel's half-open socket table, and drives a TTL-capable kernel address set that drops confirmed attackers.",
    long_about = None
)]
pub struct Cli {
    /// Path to synwarden.toml config file
    #[clap(long, short, default_value = "/etc/synwarden/synwarden.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the detection daemon (requires root or CAP_NET_ADMIN + CAP_NET_RAW)
    Run,

    /// Print an example synwarden.toml to stdout
    Init,

    /// Validate the configuration and whitelist, then exit
    Check,

    /// Show the most recent counter snapshot from the metrics log
    Status,
}
