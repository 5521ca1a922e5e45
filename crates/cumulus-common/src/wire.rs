//! Line-oriented wire grammar spoken between controller, nodes and peers.
//!
//! ```text
//! UDP  node -> controller   !alive <tcpPort> <operators>
//! UDP  node -> controller   !hello
//! UDP  controller -> node   <host:port>\n...<totalBudget>
//! TCP  node -> peer         !share <level> | !commit <level> | !rollback | !resources
//! TCP  peer -> node         !ok | !nok | !resources <level>
//! TCP  controller -> node   <tag> !compute <lhs> <op> <rhs>   (tagged, see integrity)
//! TCP  node -> controller   <tag> !result <value> | <tag> !tampered <payload> | <tag> !error <msg>
//! ```

use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::constants::{MAX_JOIN_OFFER_LEN, wire};
use crate::error::{GridError, Result};
use crate::types::{Operator, OperatorSet};

/// Liveness datagram sent periodically by every admitted node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// TCP port the node accepts compute connections on
    pub tcp_port: u16,
    /// Operators the node offers
    pub operators: OperatorSet,
}

impl Heartbeat {
    pub fn new(tcp_port: u16, operators: OperatorSet) -> Self {
        Self {
            tcp_port,
            operators,
        }
    }

    pub fn encode(&self) -> String {
        format!("{} {} {}", wire::ALIVE, self.tcp_port, self.operators)
    }
}

/// Datagram received on the controller's UDP socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Alive(Heartbeat),
    Hello,
}

impl Datagram {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split_whitespace();
        match parts.next() {
            Some(wire::ALIVE) => {
                let port = parts
                    .next()
                    .ok_or_else(|| GridError::Protocol("heartbeat without port".to_string()))?;
                let tcp_port = port
                    .parse::<u16>()
                    .map_err(|_| GridError::Protocol(format!("invalid heartbeat port: {}", port)))?;
                let operators = OperatorSet::from_token(parts.next().unwrap_or_default());
                Ok(Self::Alive(Heartbeat::new(tcp_port, operators)))
            }
            Some(wire::HELLO) => Ok(Self::Hello),
            Some(other) => Err(GridError::Protocol(format!("unknown datagram: {}", other))),
            None => Err(GridError::Protocol("empty datagram".to_string())),
        }
    }
}

/// Controller's answer to a join probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOffer {
    /// Addresses of every Online node
    pub peers: Vec<SocketAddr>,
    /// Raw fleet-wide resource budget
    pub total_budget: i64,
}

impl JoinOffer {
    /// Level each node would run at once the joining node is counted in
    pub fn proposed_level(&self) -> i64 {
        self.total_budget / (self.peers.len() as i64 + 1)
    }

    pub fn encode(&self) -> String {
        let mut lines: Vec<String> = self.peers.iter().map(|p| p.to_string()).collect();
        lines.push(self.total_budget.to_string());
        lines.join("\n")
    }

    /// Encoded offer, refused if it would not fit in one datagram
    pub fn to_datagram(&self) -> Result<String> {
        let encoded = self.encode();
        if encoded.len() > MAX_JOIN_OFFER_LEN {
            return Err(GridError::Protocol(format!(
                "join offer for {} peers is {} bytes, limit is {}",
                self.peers.len(),
                encoded.len(),
                MAX_JOIN_OFFER_LEN
            )));
        }
        Ok(encoded)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let lines: Vec<&str> = text
            .trim_matches(char::from(0))
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let (budget, peer_lines) = lines
            .split_last()
            .ok_or_else(|| GridError::Protocol("empty join offer".to_string()))?;

        let total_budget = budget
            .parse::<i64>()
            .map_err(|_| GridError::Protocol(format!("invalid budget line: {}", budget)))?;

        let peers = peer_lines
            .iter()
            .map(|line| {
                line.parse::<SocketAddr>()
                    .map_err(|_| GridError::Protocol(format!("invalid peer address: {}", line)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            peers,
            total_budget,
        })
    }
}

/// Untagged node-to-node and controller-to-node commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    Share(i64),
    Commit(i64),
    Rollback,
    Resources,
    GetLogs,
}

impl PeerCommand {
    pub fn encode(&self) -> String {
        match self {
            Self::Share(level) => format!("{} {}", wire::SHARE, level),
            Self::Commit(level) => format!("{} {}", wire::COMMIT, level),
            Self::Rollback => wire::ROLLBACK.to_string(),
            Self::Resources => wire::RESOURCES.to_string(),
            Self::GetLogs => wire::GET_LOGS.to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| GridError::Protocol("empty command".to_string()))?;
        let mut level = || -> Result<i64> {
            let raw = parts
                .next()
                .ok_or_else(|| GridError::Protocol(format!("{} without level", keyword)))?;
            raw.parse::<i64>()
                .map_err(|_| GridError::Protocol(format!("invalid level: {}", raw)))
        };

        match keyword {
            wire::SHARE => Ok(Self::Share(level()?)),
            wire::COMMIT => Ok(Self::Commit(level()?)),
            wire::ROLLBACK => Ok(Self::Rollback),
            wire::RESOURCES => Ok(Self::Resources),
            wire::GET_LOGS => Ok(Self::GetLogs),
            other => Err(GridError::Protocol(format!("unknown command: {}", other))),
        }
    }
}

/// A peer's answer to `!share`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Ok,
    Nok,
}

impl Vote {
    pub fn encode(&self) -> &'static str {
        match self {
            Self::Ok => wire::OK,
            Self::Nok => wire::NOK,
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        match line.trim() {
            wire::OK => Ok(Self::Ok),
            wire::NOK => Ok(Self::Nok),
            other => Err(GridError::Protocol(format!("unexpected vote: {}", other))),
        }
    }
}

/// Parse a `!resources <level>` answer
pub fn parse_resources_reply(line: &str) -> Result<i64> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(wire::RESOURCES), Some(level)) => level
            .parse::<i64>()
            .map_err(|_| GridError::Protocol(format!("invalid level: {}", level))),
        _ => Err(GridError::Protocol(format!("unexpected reply: {}", line))),
    }
}

/// One binary step of a term, sent from the dispatcher to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeStep {
    pub lhs: i64,
    pub op: Operator,
    pub rhs: i64,
}

impl ComputeStep {
    /// Payload text the integrity tag is computed over
    pub fn encode(&self) -> String {
        format!("{} {}", wire::COMPUTE, self.term())
    }

    /// Human-readable term, e.g. `3 + 4`
    pub fn term(&self) -> String {
        format!("{} {} {}", self.lhs, self.op, self.rhs)
    }

    pub fn parse(payload: &str) -> Result<Self> {
        let parts: Vec<&str> = payload.split_whitespace().collect();
        let [keyword, lhs, op, rhs] = parts.as_slice() else {
            return Err(GridError::Protocol(format!("malformed compute: {}", payload)));
        };
        if *keyword != wire::COMPUTE {
            return Err(GridError::Protocol(format!("not a compute request: {}", payload)));
        }

        let number = |raw: &str| {
            raw.parse::<i64>()
                .map_err(|_| GridError::Protocol(format!("invalid operand: {}", raw)))
        };
        let mut symbols = op.chars();
        let op = match (symbols.next(), symbols.next()) {
            (Some(symbol), None) => Operator::try_from(symbol)?,
            _ => return Err(GridError::Protocol(format!("invalid operator: {}", op))),
        };

        Ok(Self {
            lhs: number(*lhs)?,
            op,
            rhs: number(*rhs)?,
        })
    }
}

/// A node's answer to a compute step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeReply {
    /// Result value as text
    Result(String),
    /// The request's tag did not verify; carries the offending payload
    Tampered(String),
    /// Arithmetic failure
    Error(String),
}

impl ComputeReply {
    pub fn encode(&self) -> String {
        match self {
            Self::Result(value) => format!("{} {}", wire::RESULT, value),
            Self::Tampered(payload) => format!("{} {}", wire::TAMPERED, payload),
            Self::Error(message) => format!("{} {}", wire::ERROR, message),
        }
    }

    pub fn parse(payload: &str) -> Result<Self> {
        let (keyword, rest) = payload
            .split_once(' ')
            .unwrap_or((payload, ""));
        let rest = rest.trim().to_string();
        match keyword {
            wire::RESULT if !rest.is_empty() => Ok(Self::Result(rest)),
            wire::TAMPERED => Ok(Self::Tampered(rest)),
            wire::ERROR => Ok(Self::Error(rest)),
            _ => Err(GridError::Protocol(format!("malformed reply: {}", payload))),
        }
    }
}

/// Read one line of at most `max` bytes, terminator stripped.
///
/// `None` at end of stream. A longer line is a protocol error and leaves the
/// stream mid-frame, so the caller must drop the connection.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader.take(max as u64 + 1).read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && read > max {
        return Err(GridError::Protocol(format!("line exceeds {} bytes", max)));
    }

    let len = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(len);
    Ok(Some(line))
}
