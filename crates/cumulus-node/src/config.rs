//! Configuration management for a compute node.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use cumulus_common::OperatorSet;
use cumulus_common::constants::{
    DEFAULT_CONTROLLER_UDP_PORT, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_VOTE_TIMEOUT_MS,
};

/// Node configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Name recorded in the computation log
    #[serde(default = "default_name")]
    pub name: String,

    /// TCP port for compute steps and peer commands
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Controller host name or address
    #[serde(default = "default_controller_host")]
    pub controller_host: String,

    /// Controller UDP port (heartbeats and join probe)
    #[serde(default = "default_controller_udp_port")]
    pub controller_udp_port: u16,

    /// Heartbeat period (ms)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Operator symbols this node evaluates, e.g. "+-"
    #[serde(default = "default_operators")]
    pub operators: String,

    /// Lowest resource level this node can run at
    #[serde(default)]
    pub min_resources: i64,

    /// How long admission waits for peer votes (ms)
    #[serde(default = "default_vote_timeout")]
    pub vote_timeout_ms: u64,

    /// How long admission waits for the controller's join offer (ms)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Shared HMAC key file
    #[serde(default = "default_integrity_key")]
    pub integrity_key: String,
}

fn default_name() -> String { "node".to_string() }
fn default_tcp_port() -> u16 { 15000 }
fn default_controller_host() -> String { "127.0.0.1".to_string() }
fn default_controller_udp_port() -> u16 { DEFAULT_CONTROLLER_UDP_PORT }
fn default_heartbeat_interval() -> u64 { DEFAULT_HEARTBEAT_INTERVAL_MS }
fn default_operators() -> String { "+-*/".to_string() }
fn default_vote_timeout() -> u64 { DEFAULT_VOTE_TIMEOUT_MS }
fn default_probe_timeout() -> u64 { 2000 }
fn default_integrity_key() -> String { "keys/hmac.key".to_string() }

impl NodeConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .add_source(config::Environment::with_prefix("CUMULUS_NODE").separator("__"))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            Self::default()
        };

        if let Some(name) = &args.name {
            config.name = name.clone();
        }
        if let Some(port) = args.tcp_port {
            config.tcp_port = port;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains(char::is_whitespace) {
            anyhow::bail!("name must be a single non-empty word");
        }
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be positive");
        }
        let operators = self.operator_set();
        if operators.is_empty() {
            anyhow::bail!("operators must name at least one of + - * /");
        }
        if operators.len() != self.operators.chars().filter(|c| !c.is_whitespace()).count() {
            tracing::warn!(
                operators = %self.operators,
                "Ignoring unknown or repeated operator symbols"
            );
        }
        Ok(())
    }

    pub fn operator_set(&self) -> OperatorSet {
        OperatorSet::from_token(&self.operators)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            tcp_port: default_tcp_port(),
            controller_host: default_controller_host(),
            controller_udp_port: default_controller_udp_port(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            operators: default_operators(),
            min_resources: 0,
            vote_timeout_ms: default_vote_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            integrity_key: default_integrity_key(),
        }
    }
}
