mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use beanbridge::backend::memory::MemoryBackend;
use beanbridge::config::Config;
use beanbridge::server::Server;
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let config = match args.resolve_config() {
        Ok(config) => config,
        Err(error) => {
            error!(error = %format!("{error:#}"), "invalid configuration");
            return ExitCode::from(2);
        },
    };

    // Cancellation and termination channel.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            info!("shutting down");
            cancel.cancel();
        });
    }

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code = if let Err(error) = begin(config, cancel, shutdown_hold).await
    {
        error!(error = %format!("{error:#}"), "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    };

    // Resolves once every connection task has dropped its sender.
    shutdown_wait.recv().await;

    exit_code
}

async fn begin(
    config: Config,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let sweeper =
        backend.spawn_sweeper(config.sweep_interval(), cancel.clone());

    let server =
        Server::bind(config.addr(), backend, config.max_job_size).await?;
    let ret = server.serve(cancel.clone(), shutdown_hold).await;

    // serve() only returns early on error; stop the sweeper either way.
    cancel.cancel();
    if let Err(error) = sweeper.await {
        warn!(%error, "sweeper task failed");
    }

    ret
}
