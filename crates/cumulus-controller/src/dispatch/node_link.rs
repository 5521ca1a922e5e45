//! Short-lived TCP exchanges between the controller and compute nodes.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use cumulus_common::wire::{ComputeReply, ComputeStep, PeerCommand};
use cumulus_common::{ComputationRecord, GridError, IntegrityKey, Result};

/// Connection settings for talking to nodes
#[derive(Debug, Clone)]
pub struct NodeLink {
    integrity: IntegrityKey,
    io_timeout: Duration,
}

fn unavailable(addr: SocketAddr, reason: impl ToString) -> GridError {
    GridError::NodeUnavailable {
        node: addr.to_string(),
        reason: reason.to_string(),
    }
}

impl NodeLink {
    pub fn new(integrity: IntegrityKey, io_timeout: Duration) -> Self {
        Self {
            integrity,
            io_timeout,
        }
    }

    /// Send one tagged step and return the node's verified answer.
    ///
    /// A reply whose tag does not verify comes back as `Tampered`.
    pub async fn send_step(&self, addr: SocketAddr, step: &ComputeStep) -> Result<ComputeReply> {
        let request = self.integrity.seal(&step.encode());

        let line = tokio::time::timeout(self.io_timeout, async {
            let stream = TcpStream::connect(addr).await?;
            let (read, mut write) = stream.into_split();
            write.write_all(format!("{}\n", request).as_bytes()).await?;
            write.flush().await?;

            let mut line = String::new();
            BufReader::new(read).read_line(&mut line).await?;
            Ok::<_, std::io::Error>(line)
        })
        .await
        .map_err(|_| unavailable(addr, "timeout"))?
        .map_err(|e| unavailable(addr, e))?;

        if line.is_empty() {
            return Err(unavailable(addr, "connection closed without reply"));
        }

        let payload = match self.integrity.open(&line) {
            Ok(payload) => payload,
            Err(e @ GridError::Tampered { .. }) => return Err(e),
            Err(e) => return Err(unavailable(addr, e)),
        };
        ComputeReply::parse(payload).map_err(|e| unavailable(addr, e))
    }

    /// Pull a node's computation log (`!getLogs`, one JSON record per line)
    pub async fn fetch_logs(&self, addr: SocketAddr) -> Result<Vec<ComputationRecord>> {
        let body = tokio::time::timeout(self.io_timeout, async {
            let stream = TcpStream::connect(addr).await?;
            let (read, mut write) = stream.into_split();
            write
                .write_all(format!("{}\n", PeerCommand::GetLogs.encode()).as_bytes())
                .await?;
            write.flush().await?;

            let mut lines = BufReader::new(read).lines();
            let mut body = Vec::new();
            while let Some(line) = lines.next_line().await? {
                body.push(line);
            }
            Ok::<_, std::io::Error>(body)
        })
        .await
        .map_err(|_| unavailable(addr, "timeout"))?
        .map_err(|e| unavailable(addr, e))?;

        body.iter()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<ComputationRecord>(line)
                    .map_err(|e| unavailable(addr, format!("bad log record: {}", e)))
            })
            .collect()
    }
}
