//! Entry point: load the configuration, start the replica, wait for shutdown.

mod config;
mod kv_service;
mod metrics;
mod raft;
mod raft_client;
mod raft_service;
mod server;

use clap::Parser;
use tokio::signal;

/// Handles graceful shutdown signals
///
/// Listens for Ctrl+C and SIGTERM on Unix systems, allowing the replica to
/// shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Command line arguments for the replica
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = config::RuntimeConfig::from_toml(&args.config).expect("configuration is missing");
    let level = config
        .log_level
        .as_deref()
        .unwrap_or("info")
        .parse()
        .unwrap_or(log::LevelFilter::Info);
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init()
        .unwrap_or_default();

    log::info!("starting node {}", config.id);
    {
        server::instance().lock().await.start().await;
    }
    shutdown_signal().await;
    {
        server::instance().lock().await.stop();
    }
    Ok(())
}
