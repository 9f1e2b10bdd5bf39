//! mscope-ac daemon
//!
//! Opens the root folder, runs a reconciliation pass at startup, then keeps
//! reconciling on the configured interval until Ctrl+C or SIGTERM.
//! `--once` and `--verify` run a single pass (or a read-only check), print
//! the report as JSON and exit.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mscope_ac::IntegrityService;
use mscope_common::config::{ensure_toml_config, load_toml_config, resolve_root_folder, RootLayout};
use mscope_common::events::EventBus;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for mscope-ac
#[derive(Parser, Debug)]
#[command(name = "mscope-ac")]
#[command(about = "Artifact consistency and recovery for mutation analyses")]
#[command(version)]
struct Args {
    /// Root folder holding mscope.db, artifacts/ and backups/
    /// (falls back to MSCOPE_ROOT_FOLDER, then the config file)
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Bootstrap config file (default: ~/.config/mscope/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single reconciliation pass, print the report and exit
    #[arg(long)]
    once: bool,

    /// Print a read-only consistency report and exit (non-zero if inconsistent)
    #[arg(long, conflicts_with = "once")]
    verify: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config = load_toml_config(args.config.as_deref()).context("Failed to load config file")?;

    // RUST_LOG overrides the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&toml_config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting mscope-ac {}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = ensure_toml_config(args.config.as_deref()) {
        warn!("Could not write default config file: {}", e);
    }

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    info!("Root folder: {}", root_folder.display());

    let layout = RootLayout::new(root_folder);
    let events = EventBus::new(100);
    let service = IntegrityService::open(&layout, events)
        .await
        .context("Failed to open root folder")?;

    if args.verify {
        let report = service.verify().await.context("Verification failed")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.is_consistent() {
            warn!(issues = report.issues.len(), "Inconsistencies found");
            std::process::exit(1);
        }
        return Ok(());
    }

    let report = service.reconcile_now().await.context("Startup reconciliation failed")?;
    if args.once {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let handle = service.reconciler().run(cancel.clone());

    shutdown_signal().await;
    cancel.cancel();
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            error!("Reconciliation task ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
