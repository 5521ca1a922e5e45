//! Compute and peer command server.
//!
//! One task per connection, one request per line. Lines starting with `!` are
//! untagged peer commands; anything else is a tagged compute step from the
//! controller.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use cumulus_common::GridError;
use cumulus_common::constants::MAX_FRAME_LEN;
use cumulus_common::wire::{ComputeReply, ComputeStep, PeerCommand, read_frame};

use crate::state::NodeState;

/// What to do with the connection after a request
#[derive(Debug, PartialEq, Eq)]
enum Response {
    /// Write one line and keep reading
    Line(String),
    /// Nothing to write
    Silent,
    /// Write the body and close
    Final(String),
}

/// Bind the node's TCP listener
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {}", addr))
}

/// Accept connections until shutdown
pub async fn run_server(listener: TcpListener, state: NodeState) -> Result<()> {
    let mut shutdown = state.shutdown.subscribe();

    tracing::info!(
        addr = %listener.local_addr().context("TCP listener has no local address")?,
        operators = %state.operators,
        "🚀 Compute server listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &state).await {
                                tracing::debug!(
                                    peer = %peer,
                                    error = %e,
                                    "Connection ended with error"
                                );
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Compute server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, state: &NodeState) -> cumulus_common::Result<()> {
    let mut shutdown = state.shutdown.subscribe();
    let (read, mut write) = stream.into_split();
    let mut read = BufReader::new(read);

    loop {
        let line = tokio::select! {
            line = read_frame(&mut read, MAX_FRAME_LEN) => line?,
            _ = shutdown.recv() => break,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match handle_line(state, &line).await {
            Response::Line(reply) => {
                write.write_all(format!("{}\n", reply).as_bytes()).await?;
                write.flush().await?;
            }
            Response::Silent => {}
            Response::Final(body) => {
                write.write_all(body.as_bytes()).await?;
                write.flush().await?;
                break;
            }
        }
    }

    write.shutdown().await?;
    Ok(())
}

async fn handle_line(state: &NodeState, line: &str) -> Response {
    if line.starts_with('!') {
        handle_command(state, line).await
    } else {
        Response::Line(handle_compute(state, line).await)
    }
}

async fn handle_command(state: &NodeState, line: &str) -> Response {
    let command = match PeerCommand::parse(line) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!(line = %line, error = %e, "Rejected peer command");
            return Response::Line(e.user_message());
        }
    };

    match command {
        PeerCommand::Share(level) => {
            let vote = state.resources.vote(level).await;
            Response::Line(vote.encode().to_string())
        }
        PeerCommand::Commit(level) => {
            state.resources.commit(level).await;
            Response::Silent
        }
        PeerCommand::Rollback => {
            state.resources.rollback().await;
            Response::Silent
        }
        PeerCommand::Resources => {
            let level = state.resources.current().await;
            Response::Line(format!("{} {}", PeerCommand::Resources.encode(), level))
        }
        PeerCommand::GetLogs => match state.log.to_json_lines().await {
            Ok(body) => Response::Final(body),
            Err(e) => {
                tracing::error!(error = %e, "Failed to export computation log");
                Response::Final(String::new())
            }
        },
    }
}

/// Verify, evaluate, and answer one tagged compute step
async fn handle_compute(state: &NodeState, line: &str) -> String {
    let reply = match state.integrity.open(line) {
        Ok(payload) => evaluate(state, payload).await,
        Err(GridError::Tampered { payload }) => {
            tracing::warn!(payload = %payload, "Rejected compute step with bad tag");
            ComputeReply::Tampered(payload)
        }
        Err(e) => ComputeReply::Error(e.to_string()),
    };
    state.integrity.seal(&reply.encode())
}

async fn evaluate(state: &NodeState, payload: &str) -> ComputeReply {
    let step = match ComputeStep::parse(payload) {
        Ok(step) => step,
        Err(e) => return ComputeReply::Error(e.to_string()),
    };
    if !state.operators.contains(step.op) {
        return ComputeReply::Error(GridError::UnsupportedOperator(step.op.symbol()).to_string());
    }

    let term = step.term();
    match step.op.apply(step.lhs, step.rhs) {
        Ok(value) => {
            let value = value.to_string();
            state.log.append(&term, &value).await;
            ComputeReply::Result(value)
        }
        Err(e) => {
            let message = e.to_string();
            state.log.append(&term, &message).await;
            ComputeReply::Error(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use cumulus_common::wire::{Vote, parse_resources_reply};
    use tokio::io::AsyncBufReadExt;
    use cumulus_common::{ComputationRecord, IntegrityKey, Operator};

    fn integrity() -> IntegrityKey {
        IntegrityKey::new(b"node-server-test".to_vec()).unwrap()
    }

    fn state(operators: &str, min_resources: i64) -> NodeState {
        let config = NodeConfig {
            name: "node1".to_string(),
            operators: operators.to_string(),
            min_resources,
            ..NodeConfig::default()
        };
        NodeState::new(config, integrity())
    }

    async fn spawn(state: NodeState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_server(listener, state));
        addr
    }

    struct Peer {
        lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        write: tokio::net::tcp::OwnedWriteHalf,
    }

    impl Peer {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, write) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn send(&mut self, line: &str) {
            self.write.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        }

        async fn ask(&mut self, line: &str) -> String {
            self.send(line).await;
            self.lines.next_line().await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_compute_step_is_tagged_and_logged() {
        let state = state("+-", 0);
        let addr = spawn(state.clone()).await;
        let key = integrity();

        let mut peer = Peer::connect(addr).await;
        let step = ComputeStep {
            lhs: 3,
            op: Operator::ADD,
            rhs: 4,
        };
        let reply = peer.ask(&key.seal(&step.encode())).await;
        let payload = key.open(&reply).unwrap();
        assert_eq!(ComputeReply::parse(payload).unwrap(), ComputeReply::Result("7".into()));

        let records = state.log.snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].term, "3 + 4");
        assert_eq!(records[0].result, "7");
    }

    #[tokio::test]
    async fn test_bad_tag_gets_tampered_reply() {
        let addr = spawn(state("+", 0)).await;
        let key = integrity();

        let mut peer = Peer::connect(addr).await;
        let forged = format!("{} !compute 1 + 1", key.tag("!compute 1 + 2"));
        let reply = peer.ask(&forged).await;
        let payload = key.open(&reply).unwrap();
        assert_eq!(
            ComputeReply::parse(payload).unwrap(),
            ComputeReply::Tampered("!compute 1 + 1".into())
        );
    }

    #[tokio::test]
    async fn test_division_by_zero_and_unsupported_operator() {
        let addr = spawn(state("/", 0)).await;
        let key = integrity();
        let mut peer = Peer::connect(addr).await;

        let reply = peer.ask(&key.seal("!compute 5 / 0")).await;
        assert_eq!(
            ComputeReply::parse(key.open(&reply).unwrap()).unwrap(),
            ComputeReply::Error("division by 0".into())
        );

        let reply = peer.ask(&key.seal("!compute 5 / 2")).await;
        assert_eq!(
            ComputeReply::parse(key.open(&reply).unwrap()).unwrap(),
            ComputeReply::Result("3".into())
        );

        let reply = peer.ask(&key.seal("!compute 5 * 2")).await;
        assert_eq!(
            ComputeReply::parse(key.open(&reply).unwrap()).unwrap(),
            ComputeReply::Error("Operation * is not supported".into())
        );
    }

    #[tokio::test]
    async fn test_share_commit_and_resources() {
        let state = state("+", 40);
        state.resources.adopt(100).await;
        let addr = spawn(state.clone()).await;
        let mut peer = Peer::connect(addr).await;

        assert_eq!(Vote::parse(&peer.ask("!share 30").await).unwrap(), Vote::Nok);
        assert_eq!(Vote::parse(&peer.ask("!share 75").await).unwrap(), Vote::Ok);
        peer.send("!commit 75").await;
        // Replies are in request order, so this one sees the commit applied
        assert_eq!(parse_resources_reply(&peer.ask("!resources").await).unwrap(), 75);

        peer.ask("!share 60").await;
        peer.send("!rollback").await;
        assert_eq!(parse_resources_reply(&peer.ask("!resources").await).unwrap(), 75);
    }

    #[tokio::test]
    async fn test_get_logs_streams_json_and_closes() {
        let state = state("+", 0);
        state.log.append("1 + 1", "2").await;
        state.log.append("2 + 2", "4").await;
        let addr = spawn(state).await;

        let mut peer = Peer::connect(addr).await;
        peer.send("!getLogs").await;
        let mut records = Vec::new();
        while let Some(line) = peer.lines.next_line().await.unwrap() {
            records.push(serde_json::from_str::<ComputationRecord>(&line).unwrap());
        }
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].result, "4");
    }

    #[tokio::test]
    async fn test_oversized_line_drops_connection() {
        let state = state("+", 0);
        let addr = spawn(state.clone()).await;

        let mut peer = Peer::connect(addr).await;
        // The server may reset the connection before the whole line is written
        let _ = peer.write.write_all(&vec![b'7'; MAX_FRAME_LEN + 100]).await;
        assert!(!matches!(peer.lines.next_line().await, Ok(Some(_))));
        assert!(state.log.snapshot().await.is_empty());

        let mut fresh = Peer::connect(addr).await;
        assert_eq!(parse_resources_reply(&fresh.ask("!resources").await).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let addr = spawn(state("+", 0)).await;
        let mut peer = Peer::connect(addr).await;
        assert!(peer.ask("!dance").await.starts_with("Error:"));
    }
}
