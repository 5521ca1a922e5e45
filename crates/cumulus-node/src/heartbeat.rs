//! Periodic `!alive` datagrams to the controller.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use cumulus_common::wire::Heartbeat;

/// Send `heartbeat` to `controller` every `interval` until shutdown.
///
/// The first datagram goes out immediately so the controller sees the node
/// as soon as it has been admitted.
pub async fn run_heartbeat(
    controller: SocketAddr,
    heartbeat: Heartbeat,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("Failed to bind heartbeat socket")?;
    let datagram = heartbeat.encode();
    let mut ticker = tokio::time::interval(interval);

    tracing::info!(
        controller = %controller,
        interval = ?interval,
        "💓 Heartbeat sender started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(datagram.as_bytes(), controller).await {
                    tracing::warn!(
                        controller = %controller,
                        error = %e,
                        "Failed to send heartbeat"
                    );
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("💓 Heartbeat sender shutting down");
                break;
            }
        }
    }

    Ok(())
}
