//! Gateway client: one EWMA call against a running server, then terminate it.
//!
//! Run with: `cargo run -p cosim-server --bin cosim-gateway -- --port 5555`

use std::process::ExitCode;

use clap::Parser;
use cosim_config::{CliArgs, Config};
use cosim_server::{AppError, GatewayReport, load_config, run_gateway};
use tracing::{error, info};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let (config, config_dir) = load_config(&args);

    let log_dir = config_dir.join("logs");
    cosim_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    match run(&config) {
        Ok(report) => {
            info!(
                "ewma = {:?}, round trip {:.3} ms",
                report.ewma,
                report.elapsed.as_secs_f64() * 1e3
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("gateway failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> Result<GatewayReport, AppError> {
    config.validate()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(AppError::Runtime)?;
    info!(address = %config.client.address(), "connecting");
    runtime.block_on(run_gateway(&config.client))
}
