//! Node state and shared resources.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

use cumulus_common::keys::load_integrity_key;
use cumulus_common::{IntegrityKey, OperatorSet};

use crate::config::NodeConfig;
use crate::log::ComputationLog;
use crate::resources::Resources;

/// Shared node state
#[derive(Clone)]
pub struct NodeState {
    /// Node configuration
    pub config: NodeConfig,

    /// Operators this node evaluates
    pub operators: OperatorSet,

    /// Key shared with the controller for compute traffic
    pub integrity: IntegrityKey,

    /// Current and pending resource level
    pub resources: Arc<Resources>,

    /// Completed computations
    pub log: Arc<ComputationLog>,

    /// Peers that took part in our admission
    pub peers: Arc<RwLock<Vec<SocketAddr>>>,

    /// Shutdown broadcast
    pub shutdown: broadcast::Sender<()>,
}

impl NodeState {
    pub fn new(config: NodeConfig, integrity: IntegrityKey) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            operators: config.operator_set(),
            integrity,
            resources: Arc::new(Resources::new(config.min_resources)),
            log: Arc::new(ComputationLog::new(config.name.clone())),
            peers: Arc::new(RwLock::new(Vec::new())),
            shutdown,
            config,
        }
    }

    /// Load key material named by the config. Any failure is fatal.
    pub fn from_config(config: NodeConfig) -> Result<Self> {
        let integrity = load_integrity_key(&config.integrity_key)
            .with_context(|| format!("Failed to load integrity key {}", config.integrity_key))?;
        Ok(Self::new(config, integrity))
    }
}
