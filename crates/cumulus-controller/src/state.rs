//! Controller state and shared resources.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

use cumulus_common::keys::load_integrity_key;
use cumulus_common::{IdentityKey, IntegrityKey, KeyDir, KeyDirectory};

use crate::accounts::AccountLedger;
use crate::cluster::MembershipTracker;
use crate::config::ControllerConfig;
use crate::dispatch::{Dispatcher, NodeLink, Pricing};
use crate::session::ActiveSessions;

/// Shared controller state
#[derive(Clone)]
pub struct ControllerState {
    /// Controller configuration
    pub config: ControllerConfig,

    /// Controller identity used to answer handshakes
    pub identity: Arc<IdentityKey>,

    /// Registered client public keys
    pub keys: Arc<dyn KeyDirectory>,

    /// Node registry
    pub membership: Arc<MembershipTracker>,

    /// Client accounts
    pub ledger: Arc<AccountLedger>,

    /// Term dispatcher
    pub dispatcher: Arc<Dispatcher>,

    /// Open client sessions
    pub sessions: Arc<ActiveSessions>,

    /// Shutdown broadcast
    pub shutdown: broadcast::Sender<()>,
}

impl ControllerState {
    /// Build state from already loaded key material
    pub async fn new(
        config: ControllerConfig,
        identity: IdentityKey,
        keys: Arc<dyn KeyDirectory>,
        integrity: IntegrityKey,
    ) -> Self {
        let membership = Arc::new(MembershipTracker::new(
            config.check_period(),
            config.node_timeout(),
            config.total_budget,
        ));

        let ledger = Arc::new(AccountLedger::new());
        for user in &config.users {
            ledger.provision(&user.name, user.credits).await;
        }

        let dispatcher = Arc::new(Dispatcher::new(
            membership.clone(),
            ledger.clone(),
            NodeLink::new(integrity, config.node_io_timeout()),
            Pricing {
                cost_per_operator: config.cost_per_operator,
                cost_per_result_char: config.cost_per_result_char,
            },
        ));

        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            identity: Arc::new(identity),
            keys,
            membership,
            ledger,
            dispatcher,
            sessions: Arc::new(ActiveSessions::new()),
            shutdown,
        }
    }

    /// Load key material named by the config. Any failure is fatal.
    pub async fn from_config(config: ControllerConfig) -> Result<Self> {
        let identity = IdentityKey::load(&config.private_key)
            .with_context(|| format!("Failed to load controller key {}", config.private_key))?;
        let integrity = load_integrity_key(&config.integrity_key)
            .with_context(|| format!("Failed to load integrity key {}", config.integrity_key))?;
        let keys: Arc<dyn KeyDirectory> = Arc::new(KeyDir::new(&config.keys_dir));

        tracing::info!(
            public_key = %identity.public().to_base64(),
            users = config.users.len(),
            "Key material loaded"
        );

        Ok(Self::new(config, identity, keys, integrity).await)
    }
}
