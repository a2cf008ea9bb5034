//! Command-line argument parsing shared by the cosim binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Cosim command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "cosim", about = "Lock-step co-simulation bridge")]
pub struct CliArgs {
    /// Server host (client side).
    #[arg(long)]
    pub host: Option<String>,

    /// Server port (both sides).
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind (server side).
    #[arg(long)]
    pub bind: Option<String>,

    /// Poll timeout in milliseconds (both sides).
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Retry budget (both sides).
    #[arg(long)]
    pub retries: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref host) = args.host {
            self.client.host = host.clone();
        }
        if let Some(port) = args.port {
            self.client.port = port;
            self.server.port = port;
        }
        if let Some(ref bind) = args.bind {
            self.server.bind_host = bind.clone();
        }
        if let Some(ms) = args.poll_timeout_ms {
            self.client.poll_timeout_ms = ms;
            self.server.poll_timeout_ms = ms;
        }
        if let Some(retries) = args.retries {
            self.client.retry_budget = retries;
            self.server.retry_budget = retries;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}
