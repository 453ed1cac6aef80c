//! tether entry point: session daemon, attach client, or both at once.

mod args;
mod config;
mod daemon;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use tether_core::WindowSize;

use crate::args::Cli;
use crate::config::{Config, Mode};
use crate::daemon::client;
use crate::daemon::SessionDaemon;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = Config::from_cli(&cli).and_then(|config| match config.mode {
        Mode::Daemon => run_daemon(&cli, &config),
        Mode::AttachOnly => run_attach(&config),
        Mode::Launch => run_launch(&config),
    });

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

/// One event loop per process; neither side wants worker threads.
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the event loop")
}

/// Run the session daemon in the foreground until its command exits or a
/// termination signal lands. Either way the daemon value is dropped and
/// the rendezvous files are removed.
fn run_daemon(cli: &Cli, config: &Config) -> Result<()> {
    let size = WindowSize {
        rows: cli.rows.unwrap_or(24),
        cols: cli.cols.unwrap_or(80),
        xpixel: 0,
        ypixel: 0,
    };

    runtime()?.block_on(async {
        let mut daemon = SessionDaemon::launch(config, size).await?;

        tokio::select! {
            result = daemon.run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                Ok(())
            }
            _ = sigterm() => {
                info!("terminated, shutting down");
                Ok(())
            }
        }
    })
}

/// Attach to an existing session; hard failure if it is not there.
fn run_attach(config: &Config) -> Result<()> {
    runtime()?.block_on(async {
        let stream = client::connect(&config.socket_path).await?;
        client::run(stream).await
    })
}

/// Start a session, daemon and all, and attach to it. If the session
/// already exists this just attaches.
fn run_launch(config: &Config) -> Result<()> {
    let size = client::window_size().unwrap_or(WindowSize {
        rows: 24,
        cols: 80,
        xpixel: 0,
        ypixel: 0,
    });

    runtime()?.block_on(async {
        let stream = client::connect_or_launch(config, size).await?;
        client::run(stream).await
    })
}

/// Wait for SIGTERM. If registration fails, log it and wait forever so
/// the daemon still answers SIGINT.
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("failed to register the SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}
