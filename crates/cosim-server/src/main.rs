//! EWMA computation server.
//!
//! Run with: `cargo run -p cosim-server -- --bind 127.0.0.1 --port 5555`

use std::process::ExitCode;

use clap::Parser;
use cosim_config::CliArgs;
use cosim_server::{AppError, bind_server, load_config};
use tracing::{error, info};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let (config, config_dir) = load_config(&args);

    let log_dir = config_dir.join("logs");
    cosim_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    match serve(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server stopped: {e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(config: &cosim_config::Config) -> Result<(), AppError> {
    config.validate()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(AppError::Runtime)?;

    runtime.block_on(async {
        let server = bind_server(&config.server)?;
        let model = server.run().await?;
        info!(
            iterations = model.iterations(),
            average = model.average(),
            "server finished"
        );
        Ok::<(), AppError>(())
    })
}
