//! The stratum switcher daemon.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use stratum_switcher::config::Config;
use stratum_switcher::manager::SessionManager;
use stratum_switcher::tracing::{self, prelude::*};
use stratum_switcher::upgrade::RuntimeData;
use stratum_switcher::{api, watch};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stratum switcher daemon", long_about = None)]
struct Args {
    #[arg(
        short = 'c',
        long = "config",
        help = "Path to the JSON configuration file",
        default_value = "./config.json"
    )]
    config: PathBuf,

    #[arg(
        long = "runtime",
        help = "Runtime data left by a live upgrade; restores its sessions"
    )]
    runtime: Option<PathBuf>,
}

#[cfg(unix)]
async fn terminated() -> Result<()> {
    use tokio::signal::unix::{self, SignalKind};

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn terminated() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load_from(&args.config)?;
    tracing::init_journald_or_stdout(config.log_level());

    let runtime = args
        .runtime
        .as_deref()
        .map(RuntimeData::load_from)
        .transpose()
        .context("loading runtime data")?;

    let store = watch::connect(&config).await?;
    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    let manager = match &runtime {
        Some(runtime) => {
            SessionManager::restoring(config, store, running.clone(), tracker.clone(), runtime)
                .await?
        }
        None => SessionManager::new(config, store, running.clone(), tracker.clone()).await?,
    };
    let ctx = manager.context().clone();

    if ctx.config.enable_http_debug {
        let listener = TcpListener::bind(&ctx.config.http_debug_listen_addr)
            .await
            .with_context(|| format!("binding {}", ctx.config.http_debug_listen_addr))?;
        let (ctx, running) = (ctx.clone(), running.clone());
        tracker.spawn(async move {
            if let Err(e) = api::serve(listener, ctx, running).await {
                error!(error = %e, "Debug HTTP server failed.");
            }
        });
    }

    let inherited = match runtime {
        Some(runtime) => manager.restore(runtime)?,
        None => None,
    };
    let listener = match inherited {
        Some(listener) => listener,
        None => manager.bind().await?,
    };
    info!(server_id = manager.server_id(), "Started.");

    let result = tokio::select! {
        result = manager.run(listener) => result.map_err(anyhow::Error::from),
        result = terminated() => result,
    };

    trace!("Shutting down.");
    manager.stop_all();
    running.cancel();

    tracker.close();
    tracker.wait().await;
    info!("Exiting.");
    result
}
