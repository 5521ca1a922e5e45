//! UDP side of membership: heartbeat/probe receiver and the sweep timer.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use cumulus_common::constants::MAX_DATAGRAM_LEN;
use cumulus_common::wire::Datagram;

use super::membership::MembershipTracker;

/// Bind the controller's UDP socket
pub async fn bind(port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    UdpSocket::bind(addr)
        .await
        .with_context(|| format!("Failed to bind UDP socket on {}", addr))
}

/// Receive heartbeats and join probes until shutdown
pub async fn run_receiver(
    socket: UdpSocket,
    tracker: Arc<MembershipTracker>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    tracing::info!(
        addr = %socket.local_addr().context("UDP socket has no local address")?,
        "👂 Heartbeat receiver started"
    );

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, addr)) => {
                        handle_datagram(&socket, &tracker, &buf[..len], addr).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Heartbeat receive error");
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("👂 Heartbeat receiver shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_datagram(
    socket: &UdpSocket,
    tracker: &MembershipTracker,
    data: &[u8],
    addr: SocketAddr,
) {
    let text = String::from_utf8_lossy(data);
    let datagram = match Datagram::parse(text.trim_matches(char::from(0)).trim()) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(addr = %addr, error = %e, "Invalid datagram");
            return;
        }
    };

    match datagram {
        Datagram::Alive(heartbeat) => tracker.on_heartbeat(addr.ip(), &heartbeat).await,
        Datagram::Hello => {
            let offer = match tracker.on_join_probe(addr).await.to_datagram() {
                Ok(offer) => offer,
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "Join offer does not fit a datagram");
                    return;
                }
            };
            if let Err(e) = socket.send_to(offer.as_bytes(), addr).await {
                tracing::warn!(addr = %addr, error = %e, "Failed to answer join probe");
            }
        }
    }
}

/// Periodic membership sweep until shutdown
pub async fn run_sweeper(tracker: Arc<MembershipTracker>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(tracker.check_period());
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = tracker.sweep().await;
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "Sweep expired nodes");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Membership sweeper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_common::constants::MAX_JOIN_OFFER_LEN;
    use cumulus_common::wire::{Heartbeat, JoinOffer};
    use cumulus_common::{OperatorSet, Status};
    use std::time::Duration;

    #[tokio::test]
    async fn test_receiver_handles_heartbeat_and_probe() {
        let tracker = Arc::new(MembershipTracker::new(
            Duration::from_secs(1),
            Duration::from_secs(3),
            400,
        ));
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let controller = socket.local_addr().unwrap();
        let (tx, _) = broadcast::channel(1);
        let task = tokio::spawn(run_receiver(socket, tracker.clone(), tx.subscribe()));

        let node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        node.send_to(b"!alive 15001 +*", controller).await.unwrap();
        node.send_to(b"garbage", controller).await.unwrap();
        node.send_to(b"!hello", controller).await.unwrap();

        let mut buf = vec![0u8; MAX_JOIN_OFFER_LEN];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), node.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let offer = JoinOffer::parse(std::str::from_utf8(&buf[..len]).unwrap()).unwrap();
        assert_eq!(offer.peers, vec!["127.0.0.1:15001".parse::<SocketAddr>().unwrap()]);
        assert_eq!(offer.proposed_level(), 200);

        let nodes = tracker.list().await;
        assert_eq!(nodes[0].status, Status::Online);
        assert_eq!(nodes[0].operators.to_token(), "+*");

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_expires_silent_nodes() {
        let tracker = Arc::new(MembershipTracker::new(
            Duration::from_millis(20),
            Duration::from_millis(40),
            0,
        ));
        tracker
            .on_heartbeat(
                "127.0.0.1".parse().unwrap(),
                &Heartbeat::new(1, OperatorSet::from_token("+")),
            )
            .await;

        let (tx, _) = broadcast::channel(1);
        let task = tokio::spawn(run_sweeper(tracker.clone(), tx.subscribe()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.list().await[0].status, Status::Offline);

        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
