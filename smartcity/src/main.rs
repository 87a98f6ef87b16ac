use std::process::ExitCode;

use smartcity_core::Error;
use smartcity_core::config::Settings;
use tracing::{error, info};

mod cmdline;
mod setup_tracing;

/// At least one chain ended in Failed.
const EXIT_CHAIN_FAILED: u8 = 1;
/// The configuration was rejected before any chain started.
const EXIT_CONFIG_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cmdline::root_cli().get_matches();
    setup_tracing::register();

    let settings = match Settings::load(std::env::vars()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(?e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    if matches.get_flag(cmdline::VALIDATE_CONFIG) {
        info!("Configuration is valid");
        return ExitCode::SUCCESS;
    }

    match smartcity_core::ingest(settings).await {
        Ok(report) if report.is_success() => {
            info!("Exiting...");
            ExitCode::SUCCESS
        }
        Ok(report) => {
            for chain in report.chains.iter().filter(|chain| chain.error.is_some()) {
                error!(%chain, "Stream chain failed");
            }
            ExitCode::from(EXIT_CHAIN_FAILED)
        }
        Err(e @ Error::Config(_)) => {
            error!(?e, "Invalid configuration");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
        Err(e) => {
            error!(?e, "Application error");
            ExitCode::from(EXIT_CHAIN_FAILED)
        }
    }
}
