//! batch-replicator daemon entry point.
//!
//! Usage:
//!   batch-replicator                  # Use ./config.json
//!   batch-replicator -c <config>      # Use the given configuration file
//!
//! Logging respects `RUST_LOG`; the default is `batch_replicator=info`.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use batch_replicator::{ConfigWatcher, ReplicationDaemon, SyncConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_CONFIG: &str = "config.json";

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("batch_replicator=info")),
        )
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().collect();

    let config_path = match args.get(1).map(|s| s.as_str()) {
        None => PathBuf::from(DEFAULT_CONFIG),
        Some("--help" | "-h") => {
            print_help();
            return Ok(ExitCode::SUCCESS);
        }
        Some("--version" | "-V") => {
            println!("batch-replicator {}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        Some("-c") => PathBuf::from(args.get(2).context("-c requires a configuration path")?),
        Some(unknown) => {
            eprintln!("Unknown option: {unknown}");
            eprintln!("Run 'batch-replicator --help' for usage.");
            return Ok(ExitCode::FAILURE);
        }
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(serve(config_path))?;
    Ok(ExitCode::SUCCESS)
}

fn print_help() {
    println!(
        r#"batch-replicator v{}

Usage:
  batch-replicator [-c <config.json>]

Options:
  -c <path>        Configuration file (default: ./{})
  -h, --help       Show this help
  -V, --version    Show version
"#,
        env!("CARGO_PKG_VERSION"),
        DEFAULT_CONFIG
    );
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = SyncConfig::load(&config_path)
        .await
        .with_context(|| format!("Could not load config {}", config_path.display()))?;

    if config.dry_run {
        info!("Started in dry-run mode");
    } else {
        info!("Started");
    }

    let (config_tx, config_rx) = watch::channel(config.clone());
    let mut daemon = ReplicationDaemon::new(config.clone(), config_rx)?;

    let (watch_stop_tx, watch_stop_rx) = watch::channel(false);
    let watcher = ConfigWatcher::new(&config_path, config.scan_time(), config_tx);
    let watcher_handle = tokio::spawn(watcher.run(watch_stop_rx));

    let trigger = daemon.shutdown_trigger();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.trigger();
    });

    daemon.run().await?;

    watch_stop_tx.send_replace(true);
    if let Err(e) = watcher_handle.await {
        warn!(error = %e, "Configuration watcher did not stop cleanly");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = term.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT stops the daemon");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
