//! Joining side of the two-phase resource admission.
//!
//! ```text
//! node ── !hello ──────────> controller      (UDP)
//! node <── peers + budget ── controller
//! node ── !share L ────────> every peer      (TCP, phase 1)
//! node <── !ok | !nok ────── every peer      (bounded wait)
//! node ── !commit L ───────> ok voters       (all ok, phase 2)
//! node ── !rollback ───────> contacted peers (otherwise)
//! ```
//!
//! The joining node adopts `L` only after a global commit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cumulus_common::constants::{MAX_FRAME_LEN, MAX_JOIN_OFFER_LEN, wire};
use cumulus_common::wire::{JoinOffer, PeerCommand, Vote, parse_resources_reply, read_frame};
use cumulus_common::{GridError, Result};

use crate::resources::Resources;

/// Open TCP connection to one peer, kept across both phases
struct PeerLink {
    read: BufReader<OwnedReadHalf>,
    write: OwnedWriteHalf,
}

impl PeerLink {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let (read, write) = TcpStream::connect(addr).await?.into_split();
        Ok(Self {
            read: BufReader::new(read),
            write,
        })
    }

    async fn send(&mut self, command: PeerCommand) -> Result<()> {
        self.write
            .write_all(format!("{}\n", command.encode()).as_bytes())
            .await?;
        self.write.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        read_frame(&mut self.read, MAX_FRAME_LEN).await
    }

    async fn close(mut self) {
        let _ = self.write.shutdown().await;
    }
}

/// A peer's phase 1 outcome
struct Ballot {
    peer: SocketAddr,
    /// `None` if the peer could not be reached at all
    link: Option<PeerLink>,
    vote: Vote,
}

/// Runs admission for this node against the current fleet
pub struct Admission {
    controller: SocketAddr,
    resources: Arc<Resources>,
    probe_timeout: Duration,
    vote_timeout: Duration,
}

impl Admission {
    pub fn new(
        controller: SocketAddr,
        resources: Arc<Resources>,
        probe_timeout: Duration,
        vote_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            resources,
            probe_timeout,
            vote_timeout,
        }
    }

    /// Ask the controller for the peer list and budget
    pub async fn probe(&self) -> Result<JoinOffer> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(wire::HELLO.as_bytes(), self.controller).await?;

        // One spare byte exposes an offer cut short by the buffer
        let mut buf = vec![0u8; MAX_JOIN_OFFER_LEN + 1];
        let (len, _) = tokio::time::timeout(self.probe_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| {
                GridError::AdmissionRejected(format!("no join offer from {}", self.controller))
            })??;
        if len > MAX_JOIN_OFFER_LEN {
            return Err(GridError::Protocol(format!(
                "join offer from {} exceeds {} bytes",
                self.controller, MAX_JOIN_OFFER_LEN
            )));
        }

        JoinOffer::parse(&String::from_utf8_lossy(&buf[..len]))
    }

    /// Join the fleet. Returns the accepted offer on commit and
    /// `AdmissionRejected` on rollback.
    pub async fn run(&self) -> Result<JoinOffer> {
        let offer = self.probe().await?;
        let level = offer.proposed_level();
        let min_level = self.resources.min_level();

        info!(
            peers = offer.peers.len(),
            budget = offer.total_budget,
            level,
            "📨 Join offer received"
        );

        if level < min_level {
            return Err(GridError::AdmissionRejected(format!(
                "proposed level {} is below the minimum of {}",
                level, min_level
            )));
        }

        // Phase 1
        let deadline = Instant::now() + self.vote_timeout;
        let ballots = futures::future::join_all(
            offer
                .peers
                .iter()
                .map(|&peer| request_vote(peer, level, deadline)),
        )
        .await;

        let refused: Vec<SocketAddr> = ballots
            .iter()
            .filter(|b| b.vote == Vote::Nok)
            .map(|b| b.peer)
            .collect();

        // Phase 2
        if refused.is_empty() {
            resolve(ballots, PeerCommand::Commit(level)).await;
            self.resources.adopt(level).await;
            info!(level, peers = offer.peers.len(), "✅ Admission committed");
            Ok(offer)
        } else {
            resolve(ballots, PeerCommand::Rollback).await;
            warn!(level, refused = ?refused, "Admission rolled back");
            Err(GridError::AdmissionRejected(format!(
                "{} of {} peers refused level {}",
                refused.len(),
                offer.peers.len(),
                level
            )))
        }
    }
}

/// Phase 1 for one peer. Anything short of a timely `!ok` counts as `!nok`.
async fn request_vote(peer: SocketAddr, level: i64, deadline: Instant) -> Ballot {
    let mut link = match tokio::time::timeout_at(deadline, PeerLink::connect(peer)).await {
        Ok(Ok(link)) => link,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "Peer unreachable");
            return Ballot {
                peer,
                link: None,
                vote: Vote::Nok,
            };
        }
        Err(_) => {
            debug!(peer = %peer, "Peer connect timed out");
            return Ballot {
                peer,
                link: None,
                vote: Vote::Nok,
            };
        }
    };

    let exchange = async {
        link.send(PeerCommand::Share(level)).await?;
        link.read_line().await
    };
    let vote = match tokio::time::timeout_at(deadline, exchange).await {
        Ok(Ok(Some(line))) => Vote::parse(&line).unwrap_or_else(|e| {
            debug!(peer = %peer, error = %e, "Unreadable vote");
            Vote::Nok
        }),
        Ok(Ok(None)) => Vote::Nok,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "Vote exchange failed");
            Vote::Nok
        }
        Err(_) => {
            debug!(peer = %peer, "Vote timed out");
            Vote::Nok
        }
    };

    debug!(peer = %peer, vote = vote.encode(), "Vote collected");
    Ballot {
        peer,
        link: Some(link),
        vote,
    }
}

/// Phase 2: commit goes to `!ok` voters, rollback to every contacted peer
async fn resolve(ballots: Vec<Ballot>, decision: PeerCommand) {
    let sends = ballots.into_iter().filter_map(|ballot| {
        let Ballot { peer, link, vote } = ballot;
        let mut link = link?;
        if matches!(decision, PeerCommand::Commit(_)) && vote != Vote::Ok {
            return None;
        }
        Some(async move {
            if let Err(e) = link.send(decision).await {
                warn!(peer = %peer, error = %e, "Failed to deliver admission decision");
            }
            link.close().await;
        })
    });
    futures::future::join_all(sends).await;
}

/// Ask a peer for its current level (`!resources`)
pub async fn query_resources(peer: SocketAddr, limit: Duration) -> Result<i64> {
    let exchange = async {
        let mut link = PeerLink::connect(peer).await?;
        link.send(PeerCommand::Resources).await?;
        let line = link.read_line().await?;
        link.close().await;
        Ok::<_, GridError>(line)
    };

    let line = tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| GridError::NodeUnavailable {
            node: peer.to_string(),
            reason: "timeout".to_string(),
        })??
        .ok_or_else(|| GridError::NodeUnavailable {
            node: peer.to_string(),
            reason: "connection closed without reply".to_string(),
        })?;

    parse_resources_reply(&line)
}
