//! EWMA computation server and gateway for the cosim protocol.
//!
//! The library half holds everything the two binaries share: the served
//! [`EwmaModel`], config-to-settings conversion, and the one-shot gateway
//! exchange. The binaries only parse arguments, set up logging and drive a
//! current-thread runtime.

pub mod error;
pub mod ewma;
pub mod gateway;

use std::path::PathBuf;

use cosim_config::{CliArgs, ClientConfig, Config, ServerConfig, default_config_dir};
use cosim_net::{FramingConfig, PolicyError, RetryPolicy, ServerLoop, ServerSettings};

pub use error::AppError;
pub use ewma::{EWMA_FUNCTION, EwmaModel, ewma};
pub use gateway::{GatewayReport, run_gateway};

/// Server loop settings from the `server` config section.
pub fn server_settings(config: &ServerConfig) -> ServerSettings {
    ServerSettings {
        poll_timeout: config.poll_timeout(),
        retry_budget: config.retry_budget,
        framing: FramingConfig {
            max_frame_len: config.max_frame_size,
        },
        ..Default::default()
    }
}

/// Client retry policy from the `client` config section.
pub fn client_policy(config: &ClientConfig) -> Result<RetryPolicy, PolicyError> {
    RetryPolicy::new(config.poll_timeout(), config.retry_budget)
}

/// Bind the configured address and wrap a default [`EwmaModel`].
///
/// Must be called inside a tokio runtime.
pub fn bind_server(config: &ServerConfig) -> Result<ServerLoop<EwmaModel>, AppError> {
    let addr = config.bind_addr()?;
    let server = ServerLoop::bind(addr, server_settings(config), EwmaModel::default())?;
    Ok(server)
}

/// Resolve the config directory, load the config and apply CLI overrides.
///
/// A config file that cannot be read falls back to defaults. Runs before
/// logging is set up, so problems go to stderr.
pub fn load_config(args: &CliArgs) -> (Config, PathBuf) {
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(args);
    (config, config_dir)
}
