//! Node membership tracking.
//!
//! Nodes announce themselves with `!alive` heartbeats. Records are kept in
//! first-heartbeat order and never removed; a periodic sweep is the only
//! thing that marks a node offline, and the next heartbeat brings it back.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use cumulus_common::wire::{Heartbeat, JoinOffer};
use cumulus_common::{Operator, OperatorSet, Status};

/// A compute node as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Source IP of the heartbeat plus the TCP port it declared
    pub addr: SocketAddr,
    pub status: Status,
    /// Accumulated cost of results this node produced
    pub usage: u64,
    /// Sweeps since the last heartbeat
    pub missed_intervals: u32,
    pub operators: OperatorSet,
}

impl NodeRecord {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            status: Status::Online,
            usage: 0,
            missed_intervals: 0,
            operators: OperatorSet::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == Status::Online
    }
}

impl std::fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IP: {} Port: {} {} Usage: {}",
            self.addr.ip(),
            self.addr.port(),
            self.status,
            self.usage
        )
    }
}

/// Registry of compute nodes
pub struct MembershipTracker {
    nodes: RwLock<Vec<NodeRecord>>,
    check_period: Duration,
    timeout: Duration,
    total_budget: i64,
}

impl MembershipTracker {
    pub fn new(check_period: Duration, timeout: Duration, total_budget: i64) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            check_period,
            timeout,
            total_budget,
        }
    }

    pub fn check_period(&self) -> Duration {
        self.check_period
    }

    /// Upsert the record for `(source, heartbeat.tcp_port)`
    pub async fn on_heartbeat(&self, source: IpAddr, heartbeat: &Heartbeat) {
        let addr = SocketAddr::new(source, heartbeat.tcp_port);
        let mut nodes = self.nodes.write().await;

        let record = match nodes.iter().position(|n| n.addr == addr) {
            Some(index) => &mut nodes[index],
            None => {
                info!(node = %addr, operators = %heartbeat.operators, "New node registered");
                nodes.push(NodeRecord::new(addr));
                let last = nodes.len() - 1;
                &mut nodes[last]
            }
        };

        if record.status == Status::Offline {
            info!(node = %addr, "Node back online");
        }
        record.status = Status::Online;
        record.missed_intervals = 0;
        record.operators.merge(&heartbeat.operators);

        debug!(node = %addr, "Heartbeat");
    }

    /// One sweep tick. Returns the nodes that just went offline.
    pub async fn sweep(&self) -> Vec<SocketAddr> {
        let mut expired = Vec::new();
        let mut nodes = self.nodes.write().await;

        for record in nodes.iter_mut().filter(|n| n.is_online()) {
            record.missed_intervals = record.missed_intervals.saturating_add(1);
            let silent_for = self
                .check_period
                .checked_mul(record.missed_intervals)
                .unwrap_or(Duration::MAX);

            if silent_for >= self.timeout {
                warn!(
                    node = %record.addr,
                    missed = record.missed_intervals,
                    "Node marked offline (timeout)"
                );
                record.status = Status::Offline;
                expired.push(record.addr);
            }
        }

        expired
    }

    /// Online nodes offering `op`, in registration order
    pub async fn snapshot_online(&self, op: Operator) -> Vec<NodeRecord> {
        self.nodes
            .read()
            .await
            .iter()
            .filter(|n| n.is_online() && n.operators.contains(op))
            .cloned()
            .collect()
    }

    /// Union of the operators of all Online nodes
    pub async fn online_operators(&self) -> OperatorSet {
        let nodes = self.nodes.read().await;
        let mut operators = OperatorSet::new();
        for node in nodes.iter().filter(|n| n.is_online()) {
            operators.merge(&node.operators);
        }
        operators
    }

    pub async fn online_addrs(&self) -> Vec<SocketAddr> {
        self.nodes
            .read()
            .await
            .iter()
            .filter(|n| n.is_online())
            .map(|n| n.addr)
            .collect()
    }

    /// Answer to a `!hello` probe: every Online peer and the raw budget.
    ///
    /// The joining node divides the budget by `peers + 1` itself.
    pub async fn on_join_probe(&self, from: SocketAddr) -> JoinOffer {
        let offer = JoinOffer {
            peers: self.online_addrs().await,
            total_budget: self.total_budget,
        };
        info!(
            from = %from,
            peers = offer.peers.len(),
            level = offer.proposed_level(),
            "Join probe answered"
        );
        offer
    }

    /// Add usage to a node that is still Online. Returns false otherwise.
    pub async fn add_usage(&self, addr: SocketAddr, amount: u64) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.iter_mut().find(|n| n.addr == addr && n.is_online()) {
            Some(record) => {
                record.usage = record.usage.saturating_add(amount);
                true
            }
            None => {
                debug!(node = %addr, amount, "Usage dropped for offline node");
                false
            }
        }
    }

    /// All records, online or not
    pub async fn list(&self) -> Vec<NodeRecord> {
        self.nodes.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn tracker() -> MembershipTracker {
        MembershipTracker::new(Duration::from_millis(1000), Duration::from_millis(3000), 300)
    }

    fn beat(port: u16, ops: &str) -> Heartbeat {
        Heartbeat::new(port, OperatorSet::from_token(ops))
    }

    #[tokio::test]
    async fn test_heartbeat_registers_and_merges_operators() {
        let tracker = tracker();
        tracker.on_heartbeat(LOCAL, &beat(15000, "+")).await;
        tracker.on_heartbeat(LOCAL, &beat(15000, "-")).await;

        let nodes = tracker.list().await;
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_online());
        assert_eq!(nodes[0].operators.to_token(), "+-");
    }

    #[tokio::test]
    async fn test_offline_after_ceil_timeout_over_period() {
        // 3000 / 1000 = 3 silent sweeps
        let tracker = tracker();
        tracker.on_heartbeat(LOCAL, &beat(15000, "+")).await;

        assert!(tracker.sweep().await.is_empty());
        assert!(tracker.sweep().await.is_empty());
        assert_eq!(tracker.sweep().await.len(), 1);
        assert_eq!(tracker.list().await[0].status, Status::Offline);

        // Stays offline without heartbeats
        assert!(tracker.sweep().await.is_empty());
        assert_eq!(tracker.list().await[0].status, Status::Offline);
    }

    #[tokio::test]
    async fn test_uneven_timeout_rounds_up() {
        let tracker =
            MembershipTracker::new(Duration::from_millis(1000), Duration::from_millis(2500), 0);
        tracker.on_heartbeat(LOCAL, &beat(1, "+")).await;
        tracker.sweep().await;
        tracker.sweep().await;
        assert!(tracker.list().await[0].is_online());
        tracker.sweep().await;
        assert!(!tracker.list().await[0].is_online());
    }

    #[tokio::test]
    async fn test_heartbeat_resets_missed_and_resurrects() {
        let tracker = tracker();
        tracker.on_heartbeat(LOCAL, &beat(15000, "+")).await;
        tracker.sweep().await;
        tracker.sweep().await;
        tracker.on_heartbeat(LOCAL, &beat(15000, "")).await;
        tracker.sweep().await;
        tracker.sweep().await;
        assert!(tracker.list().await[0].is_online());

        tracker.sweep().await;
        assert!(!tracker.list().await[0].is_online());

        tracker.add_usage("127.0.0.1:15000".parse().unwrap(), 50).await;
        tracker.on_heartbeat(LOCAL, &beat(15000, "")).await;
        let node = &tracker.list().await[0];
        assert!(node.is_online());
        assert_eq!(node.usage, 0);
        assert_eq!(node.operators.to_token(), "+");
    }

    #[tokio::test]
    async fn test_snapshot_filters_by_operator_in_order() {
        let tracker = tracker();
        tracker.on_heartbeat(LOCAL, &beat(3, "+-")).await;
        tracker.on_heartbeat(LOCAL, &beat(1, "*")).await;
        tracker.on_heartbeat(LOCAL, &beat(2, "+")).await;

        let ports: Vec<u16> = tracker
            .snapshot_online(Operator::ADD)
            .await
            .iter()
            .map(|n| n.addr.port())
            .collect();
        assert_eq!(ports, vec![3, 2]);
        assert_eq!(tracker.online_operators().await.to_token(), "+-*");
    }

    #[tokio::test]
    async fn test_join_offer_lists_online_only() {
        let tracker = tracker();
        tracker.on_heartbeat(LOCAL, &beat(1, "+")).await;
        tracker.on_heartbeat(LOCAL, &beat(2, "+")).await;
        for _ in 0..3 {
            tracker.sweep().await;
        }
        tracker.on_heartbeat(LOCAL, &beat(2, "+")).await;

        let offer = tracker.on_join_probe("127.0.0.1:9".parse().unwrap()).await;
        assert_eq!(offer.peers, vec!["127.0.0.1:2".parse::<SocketAddr>().unwrap()]);
        assert_eq!(offer.proposed_level(), 150);
    }

    #[tokio::test]
    async fn test_usage_only_while_online() {
        let tracker = tracker();
        let addr: SocketAddr = "127.0.0.1:7".parse().unwrap();
        assert!(!tracker.add_usage(addr, 10).await);

        tracker.on_heartbeat(LOCAL, &beat(7, "+")).await;
        assert!(tracker.add_usage(addr, 10).await);
        assert!(tracker.add_usage(addr, 5).await);
        assert_eq!(tracker.list().await[0].usage, 15);
        assert_eq!(
            tracker.list().await[0].to_string(),
            "IP: 127.0.0.1 Port: 7 online Usage: 15"
        );
    }
}
