//! Ensemble Coordination command line
//!
//! Operates on the shared store that cooperating agents coordinate
//! through. Every command is a short-lived participant except `monitor`
//! and `log --follow`, which run until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use ensemble_coord_cli::commands::{self, Command};
use ensemble_coord_cli::config::{Config, LogFormat};
use ensemble_coord_cli::logging;
use ensemble_coord_storage::Coordinator;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Ensemble Coordination operator tool
#[derive(Parser)]
#[command(name = "ensemble-coord")]
#[command(about = "Inspect and administer a shared agent coordination store")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the shared store directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Override the log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };
    apply_cli_overrides(&mut config, &cli);

    let _guard = logging::init(&config.logging)?;
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let coordinator = Coordinator::open_dir(&config.storage.root, config.coordination.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to open coordination store at {}",
                config.storage.root.display()
            )
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    let mut stdout = std::io::stdout();
    if let Err(e) = commands::execute(&cli.command, &coordinator, &mut stdout, shutdown_rx).await {
        error!("Command failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

/// Apply CLI argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(root) = &cli.root {
        config.storage.root = root.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
