//! nest-rtsp daemon entry point

use anyhow::{Context, Result};
use clap::Parser;
use nest_rtsp::{init_tracing, App, Config};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Republish cloud camera streams at local RTSP mounts")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Control socket address (overrides the config file).
    #[arg(long)]
    listen: Option<String>,

    /// Settings database path (overrides the config file).
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.control.addr = listen;
    }
    if let Some(database) = args.database {
        config.db_path = database;
    }

    let app = App::build(config).await.context("failed to start daemon")?;
    app.run_until(shutdown_signal()).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
