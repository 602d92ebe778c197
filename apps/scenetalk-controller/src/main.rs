use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use scenetalk_controller::{logging, Cli, ControllerConfig, ControllerContext};
use tracing::{error, info};

/// How long blocking-pool work may linger once the controller has stopped.
/// A pending stdin read never finishes on its own.
const BLOCKING_DRAIN: Duration = Duration::from_millis(250);

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("scenetalk-controller: tokio runtime init failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(start(cli));
    runtime.shutdown_timeout(BLOCKING_DRAIN);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "controller exited with error");
            eprintln!("scenetalk-controller: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn start(cli: Cli) -> Result<()> {
    let config = ControllerConfig::try_from(cli).context("invalid configuration")?;
    logging::init(&config.log).context("failed to initialise logging")?;
    info!(
        worker = ?config.worker,
        admin = %config.admin_endpoint(),
        stdin = config.stdin,
        advertise = ?config.advertise,
        "starting scenetalk controller"
    );
    let context = ControllerContext::new(config)?;
    scenetalk_controller::run(context).await
}
