//! In-memory computation log.

use std::collections::VecDeque;
use tokio::sync::Mutex;

use cumulus_common::ComputationRecord;

/// Oldest records are dropped past this many entries
const MAX_RECORDS: usize = 10_000;

/// Log sink for completed computations
pub struct ComputationLog {
    node_name: String,
    records: Mutex<VecDeque<ComputationRecord>>,
}

impl ComputationLog {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn append(&self, term: &str, result: &str) {
        let record = ComputationRecord::new(&self.node_name, term, result);
        tracing::info!(
            node = %self.node_name,
            term = %term,
            result = %result,
            "Computation logged"
        );

        let mut records = self.records.lock().await;
        if records.len() == MAX_RECORDS {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub async fn snapshot(&self) -> Vec<ComputationRecord> {
        self.records.lock().await.iter().cloned().collect()
    }

    /// One JSON object per line, oldest first
    pub async fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for record in self.snapshot().await {
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        Ok(out)
    }
}
