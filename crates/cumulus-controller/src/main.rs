//! # Cumulus Controller
//!
//! Coordinates the compute grid. Tracks nodes through UDP heartbeats,
//! authenticates clients, and dispatches their terms to the least-used
//! capable node.
//!
//! ## Architecture
//! ```text
//! Client ══(encrypted session)══> Controller ──(tagged steps)──> Nodes
//!                                     ^
//!                                     └──(UDP !alive / !hello)── Nodes
//! ```

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod accounts;
mod cluster;
mod config;
mod dispatch;
mod session;
mod shell;
mod state;

use config::ControllerConfig;
use state::ControllerState;

/// Cumulus Controller - node membership, dispatch, and client accounts
#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/controller.toml")]
    config: String,

    /// Client TCP port (overrides config)
    #[arg(long, env = "CUMULUS_TCP_PORT")]
    tcp_port: Option<u16>,

    /// Heartbeat UDP port (overrides config)
    #[arg(long, env = "CUMULUS_UDP_PORT")]
    udp_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("☁️ Starting Cumulus Controller v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ControllerConfig::load(&args.config, &args)?;
    info!("📋 Configuration loaded from {}", args.config);

    // Key material problems stop us here
    let state = ControllerState::from_config(config).await?;

    let udp = cluster::listener::bind(state.config.udp_port).await?;
    let tcp = session::bind(state.config.tcp_port).await?;

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let membership = state.membership.clone();
    let receiver_shutdown = state.shutdown.subscribe();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = cluster::listener::run_receiver(udp, membership, receiver_shutdown).await {
            tracing::error!(error = %e, "Heartbeat receiver failed");
        }
    }));

    tasks.push(tokio::spawn(cluster::listener::run_sweeper(
        state.membership.clone(),
        state.shutdown.subscribe(),
    )));

    let server_state = state.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = session::run_server(tcp, server_state).await {
            tracing::error!(error = %e, "Session server failed");
        }
    }));

    tasks.push(tokio::spawn(shell::run_shell(state.clone())));

    // Wait for Ctrl+C or `!exit`
    let mut shutdown_rx = state.shutdown.subscribe();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("🛑 Shutdown signal received");
            let _ = state.shutdown.send(());
        }
        _ = shutdown_rx.recv() => {
            info!("🛑 Shutdown requested by operator");
        }
    }

    if !state.sessions.wait_idle(Duration::from_secs(2)).await {
        tracing::warn!(open = state.sessions.count(), "Sessions still open at shutdown");
    }
    state.ledger.logout_all().await;

    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    info!("👋 Controller shutdown complete");

    // A blocking stdin read cannot be cancelled and would hold the runtime open
    std::process::exit(0)
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
