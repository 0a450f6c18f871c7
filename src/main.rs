//! synwarden — SYN-flood detection daemon.
//!
//! Watches inbound SYN traffic from a netfilter queue (or a filtered raw
//! socket), tracks per-source rates, confirms suspected floods against the
//! kernel's half-open socket table, and blocks confirmed attackers through
//! a TTL-capable kernel address set. Run `synwarden --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod run;
mod status;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run::run(&cli.config),
        Commands::Init => {
            let example = config::DaemonConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
            Ok(())
        }
        Commands::Check => run::check(&cli.config),
        Commands::Status => status::run(&cli.config),
    }
}
