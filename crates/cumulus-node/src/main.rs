//! # Cumulus Node
//!
//! Worker in the compute grid. On startup it runs resource admission against
//! the current fleet; once admitted it serves integrity-tagged arithmetic
//! steps and announces itself to the controller with heartbeats.
//!
//! ## Architecture
//! ```text
//! Controller ──(tagged !compute)──> Node ──(tagged !result)──> Controller
//! Node ──(!alive every interval)──> Controller
//! Joining node ──(!share / !commit / !rollback)──> Node
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cumulus_common::wire::Heartbeat;

mod admission;
mod config;
mod heartbeat;
mod log;
mod resources;
mod server;
mod shell;
mod state;

use admission::Admission;
use config::NodeConfig;
use state::NodeState;

/// Cumulus Node - resource admission, heartbeats, and tagged arithmetic
#[derive(Parser, Debug)]
#[command(name = "node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/node.toml")]
    config: String,

    /// Node name (overrides config)
    #[arg(long, env = "CUMULUS_NODE_NAME")]
    name: Option<String>,

    /// Compute TCP port (overrides config)
    #[arg(long, env = "CUMULUS_NODE_TCP_PORT")]
    tcp_port: Option<u16>,

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

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("⚙️ Starting Cumulus Node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    info!("📋 Configuration loaded from {}", args.config);

    let state = NodeState::from_config(config)?;
    let controller = resolve_controller(&state.config).await?;

    // A busy port fails here, before any peer is asked
    let tcp = server::bind(state.config.tcp_port).await?;

    let admission = Admission::new(
        controller,
        state.resources.clone(),
        state.config.probe_timeout(),
        state.config.vote_timeout(),
    );

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    match admission.run().await {
        Ok(offer) => {
            *state.peers.write().await = offer.peers;

            let server_state = state.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server::run_server(tcp, server_state).await {
                    tracing::error!(error = %e, "Compute server failed");
                }
            }));

            let beat = Heartbeat::new(state.config.tcp_port, state.operators.clone());
            let interval = state.config.heartbeat_interval();
            let shutdown = state.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let sent = heartbeat::run_heartbeat(controller, beat, interval, shutdown).await;
                if let Err(e) = sent {
                    tracing::error!(error = %e, "Heartbeat sender failed");
                }
            }));
        }
        Err(e) => {
            drop(tcp);
            warn!(error = %e, "Not joining the fleet, serving the shell only");
            println!(
                "{} would require too many resources! Enter !exit",
                state.config.name
            );
        }
    }

    tasks.push(tokio::spawn(shell::run_shell(state.clone())));

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

    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    info!("👋 Node shutdown complete");

    // A blocking stdin read cannot be cancelled and would hold the runtime open
    std::process::exit(0)
}

/// Resolve the controller's UDP address from config
async fn resolve_controller(config: &NodeConfig) -> Result<SocketAddr> {
    let target = (config.controller_host.as_str(), config.controller_udp_port);
    tokio::net::lookup_host(target)
        .await
        .with_context(|| format!("Failed to resolve controller {}", config.controller_host))?
        .next()
        .with_context(|| format!("No address for controller {}", config.controller_host))
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
