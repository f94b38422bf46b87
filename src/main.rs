#![doc = include_str!("../README.md")]

/*
 * SBP-SURVEY establishes the surveyed position of a fixed GNSS base
 * station speaking the SBP protocol.
 * This tool is shipped under Mozilla Public V2 license.
 */

use env_logger::{Builder, Target};
use log::{error, info, warn};

use tokio::{signal, sync::watch};

mod cli;
mod config;
mod recorder;
mod report;
mod runtime;
mod sbp;
mod service;
mod session;
mod settings;

#[cfg(test)]
mod testutil;

use crate::{cli::Cli, runtime::Runtime, service::OpusDropBox};

#[tokio::main]
pub async fn main() {
    let mut builder = Builder::from_default_env();

    builder
        .target(Target::Stdout)
        .format_timestamp_secs()
        .format_module_path(false)
        .init();

    let cli = Cli::new();
    let config = cli.config();

    // operator abort: first ctrl-c stops the capture cleanly
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting the run");
            let _ = shutdown_tx.send(true);
        }
    });

    info!(
        "surveying in base station at {}:{} ({:?} capture window)",
        config.host, config.port, config.capture_duration
    );

    let service = OpusDropBox::new(&config);
    let mut runtime = Runtime::new(config, service, shutdown_rx);

    if let Err(e) = runtime.run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}
