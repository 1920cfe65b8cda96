//! wcd - WalletConnect v2 pairing daemon

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wcd::{Config, Daemon};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_filter = if config.verbose {
        "wcd=debug,wc_core=debug,wc_transport=debug"
    } else {
        "wcd=info,wc_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let json = config.log_format == "json";
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e:#}");
        return ExitCode::FAILURE;
    }

    info!("wcd v{} - WalletConnect pairing daemon", env!("CARGO_PKG_VERSION"));

    let daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = daemon.run().await {
        error!("{e:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
