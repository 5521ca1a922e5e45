//! Least-usage dispatch of client terms across the fleet.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use cumulus_common::wire::{ComputeReply, ComputeStep};
use cumulus_common::{ComputationRecord, GridError, Operator, Result};

use super::node_link::NodeLink;
use super::term::Term;
use crate::accounts::AccountLedger;
use crate::cluster::{MembershipTracker, NodeRecord};

/// Pricing knobs
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    /// Credits per completed step
    pub cost_per_operator: i64,
    /// Node usage per character of a returned result
    pub cost_per_result_char: u64,
}

/// Routes each step of a term to the least-used capable node
pub struct Dispatcher {
    membership: Arc<MembershipTracker>,
    ledger: Arc<AccountLedger>,
    link: NodeLink,
    pricing: Pricing,
    /// Requested operator counts, first request first
    operator_stats: Mutex<Vec<(char, u64)>>,
}

impl Dispatcher {
    pub fn new(
        membership: Arc<MembershipTracker>,
        ledger: Arc<AccountLedger>,
        link: NodeLink,
        pricing: Pricing,
    ) -> Self {
        Self {
            membership,
            ledger,
            link,
            pricing,
            operator_stats: Mutex::new(Vec::new()),
        }
    }

    /// Online node offering `op` with the smallest usage; the first one wins ties
    pub async fn select_node(&self, op: Operator) -> Option<NodeRecord> {
        self.membership
            .snapshot_online(op)
            .await
            .into_iter()
            .min_by_key(|node| node.usage)
    }

    /// Evaluate a client term on behalf of `user` and return the result text.
    ///
    /// The client is only charged when every step succeeded.
    pub async fn compute(&self, user: &str, text: &str) -> Result<String> {
        self.record_operators(text).await;

        let term = Term::parse(text)?;

        let supported = self.membership.online_operators().await;
        if let Some((op, _)) = term.steps.iter().find(|(op, _)| !supported.contains(*op)) {
            return Err(GridError::UnsupportedOperator(op.symbol()));
        }

        let price = self.pricing.cost_per_operator * term.step_count() as i64;
        self.ledger.ensure_covers(user, price).await?;

        let mut running = term.first;
        let mut completed: i64 = 0;
        for (op, rhs) in &term.steps {
            let node = self
                .select_node(*op)
                .await
                .ok_or(GridError::NoCapableNode(op.symbol()))?;

            let step = ComputeStep {
                lhs: running,
                op: *op,
                rhs: *rhs,
            };
            running = self.run_step(&node, &step).await?;
            completed += 1;
        }

        let charge = completed * self.pricing.cost_per_operator;
        let balance = self.ledger.subtract_credits(user, charge).await;
        info!(user = %user, steps = completed, charge, balance = ?balance, "Term computed");

        Ok(running.to_string())
    }

    async fn run_step(&self, node: &NodeRecord, step: &ComputeStep) -> Result<i64> {
        match self.link.send_step(node.addr, step).await {
            Ok(ComputeReply::Result(value)) => {
                let parsed = value.parse::<i64>().map_err(|_| GridError::NodeUnavailable {
                    node: node.addr.to_string(),
                    reason: format!("malformed result '{}'", value),
                })?;
                let usage = value.len() as u64 * self.pricing.cost_per_result_char;
                self.membership.add_usage(node.addr, usage).await;
                info!(node = %node.addr, term = %step.term(), result = %value, "Step completed");
                Ok(parsed)
            }
            Ok(ComputeReply::Tampered(payload)) => {
                warn!(node = %node.addr, payload = %payload, "Node rejected request tag");
                Err(GridError::Tampered { payload })
            }
            Ok(ComputeReply::Error(message)) => Err(GridError::Computation(message)),
            Err(e) => {
                warn!(node = %node.addr, term = %step.term(), error = %e, "Step failed");
                Err(e)
            }
        }
    }

    async fn record_operators(&self, text: &str) {
        let mut stats = self.operator_stats.lock().await;
        for symbol in Term::symbols(text) {
            match stats.iter_mut().find(|(s, _)| *s == symbol) {
                Some((_, count)) => *count += 1,
                None => stats.push((symbol, 1)),
            }
        }
    }

    /// Requested operator counts, most requested first
    pub async fn operator_stats(&self) -> Vec<(char, u64)> {
        let mut stats = self.operator_stats.lock().await.clone();
        // Stable: equal counts keep first-request order
        stats.sort_by(|a, b| b.1.cmp(&a.1));
        stats
    }

    /// Computation logs of every Online node, oldest first
    pub async fn collect_logs(&self) -> Vec<ComputationRecord> {
        let addrs = self.membership.online_addrs().await;
        let fetched = futures::future::join_all(
            addrs.iter().map(|&addr| async move { (addr, self.link.fetch_logs(addr).await) }),
        )
        .await;

        let mut records = Vec::new();
        for (addr, result) in fetched {
            match result {
                Ok(mut logs) => records.append(&mut logs),
                Err(e) => warn!(node = %addr, error = %e, "Failed to fetch logs"),
            }
        }
        records.sort_by_key(|r| r.timestamp);
        records
    }
}
