//! Configuration for the cosim client, server and logging.
//!
//! Settings persist to disk as `config.ron`. Every section is
//! `#[serde(default)]`, so older or partial files keep loading, and command
//! line flags override whatever the file says.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE, ClientConfig, Config, LogConfig, ServerConfig, default_config_dir,
};
pub use error::ConfigError;
