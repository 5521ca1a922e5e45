//! Resource level bookkeeping, participant side of admission.

use tokio::sync::Mutex;
use tracing::{debug, info};

use cumulus_common::wire::Vote;

#[derive(Debug, Default)]
struct Levels {
    current: i64,
    /// Level this node last voted `!ok` for
    pending: Option<i64>,
}

/// Current and pending resource level of this node
#[derive(Debug)]
pub struct Resources {
    min_level: i64,
    levels: Mutex<Levels>,
}

impl Resources {
    pub fn new(min_level: i64) -> Self {
        Self {
            min_level,
            levels: Mutex::new(Levels::default()),
        }
    }

    pub fn min_level(&self) -> i64 {
        self.min_level
    }

    pub async fn current(&self) -> i64 {
        self.levels.lock().await.current
    }

    #[cfg(test)]
    pub async fn pending(&self) -> Option<i64> {
        self.levels.lock().await.pending
    }

    /// Set the level directly; used by the joining node on commit
    pub async fn adopt(&self, level: i64) {
        let mut levels = self.levels.lock().await;
        levels.current = level;
        levels.pending = None;
        info!(level, "Resource level adopted");
    }

    /// Phase 1: agree to `level` if it still covers our minimum
    pub async fn vote(&self, level: i64) -> Vote {
        if level < self.min_level {
            debug!(level, min = self.min_level, "Voting nok");
            return Vote::Nok;
        }
        self.levels.lock().await.pending = Some(level);
        debug!(level, "Voting ok");
        Vote::Ok
    }

    /// Phase 2: apply `level` only if it is the one we agreed to
    pub async fn commit(&self, level: i64) -> bool {
        let mut levels = self.levels.lock().await;
        if levels.pending != Some(level) {
            debug!(level, pending = ?levels.pending, "Ignoring stale commit");
            return false;
        }
        levels.current = level;
        levels.pending = None;
        info!(level, "Resource level committed");
        true
    }

    pub async fn rollback(&self) {
        let mut levels = self.levels.lock().await;
        if let Some(level) = levels.pending.take() {
            debug!(level, "Pending level rolled back");
        }
    }
}
