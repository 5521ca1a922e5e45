//! Configuration management for the controller.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use cumulus_common::constants::{
    DEFAULT_CONTROLLER_TCP_PORT, DEFAULT_CONTROLLER_UDP_PORT, DEFAULT_COST_PER_OPERATOR,
    DEFAULT_COST_PER_RESULT_CHAR, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_NODE_CHECK_PERIOD_MS,
    DEFAULT_NODE_TIMEOUT_MS, DEFAULT_TOTAL_BUDGET,
};

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// TCP port for client sessions
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// UDP port for heartbeats and join probes
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Silence after which a node is marked offline (ms)
    #[serde(default = "default_node_timeout")]
    pub node_timeout_ms: u64,

    /// Membership sweep period (ms)
    #[serde(default = "default_check_period")]
    pub node_check_period_ms: u64,

    /// Fleet-wide resource budget handed to joining nodes
    #[serde(default = "default_total_budget")]
    pub total_budget: i64,

    /// Credits charged per operator step
    #[serde(default = "default_cost_per_operator")]
    pub cost_per_operator: i64,

    /// Usage added to a node per result character
    #[serde(default = "default_cost_per_result_char")]
    pub cost_per_result_char: u64,

    /// Connect/read deadline for one compute step (ms)
    #[serde(default = "default_node_io_timeout")]
    pub node_io_timeout_ms: u64,

    /// Time a client gets to complete the handshake (ms)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Controller private key file
    #[serde(default = "default_private_key")]
    pub private_key: String,

    /// Directory holding `<user>.pub` files
    #[serde(default = "default_keys_dir")]
    pub keys_dir: String,

    /// Shared HMAC key file
    #[serde(default = "default_integrity_key")]
    pub integrity_key: String,

    /// Provisioned users and their starting credits, in file order
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// A provisioned client account
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub credits: i64,
}

// Default value functions
fn default_tcp_port() -> u16 { DEFAULT_CONTROLLER_TCP_PORT }
fn default_udp_port() -> u16 { DEFAULT_CONTROLLER_UDP_PORT }
fn default_node_timeout() -> u64 { DEFAULT_NODE_TIMEOUT_MS }
fn default_check_period() -> u64 { DEFAULT_NODE_CHECK_PERIOD_MS }
fn default_total_budget() -> i64 { DEFAULT_TOTAL_BUDGET }
fn default_cost_per_operator() -> i64 { DEFAULT_COST_PER_OPERATOR }
fn default_cost_per_result_char() -> u64 { DEFAULT_COST_PER_RESULT_CHAR }
fn default_node_io_timeout() -> u64 { 2000 }
fn default_handshake_timeout() -> u64 { DEFAULT_HANDSHAKE_TIMEOUT_MS }
fn default_private_key() -> String { "keys/controller.key".to_string() }
fn default_keys_dir() -> String { "keys".to_string() }
fn default_integrity_key() -> String { "keys/hmac.key".to_string() }

impl ControllerConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .add_source(config::Environment::with_prefix("CUMULUS").separator("__"))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(port) = args.tcp_port {
            config.tcp_port = port;
        }
        if let Some(port) = args.udp_port {
            config.udp_port = port;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.node_check_period_ms == 0 {
            anyhow::bail!("node_check_period_ms must be positive");
        }
        if self.cost_per_operator < 0 {
            anyhow::bail!("cost_per_operator must not be negative");
        }
        if self.total_budget < 0 {
            anyhow::bail!("total_budget must not be negative");
        }
        Ok(())
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.node_check_period_ms)
    }

    pub fn node_io_timeout(&self) -> Duration {
        Duration::from_millis(self.node_io_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            node_timeout_ms: default_node_timeout(),
            node_check_period_ms: default_check_period(),
            total_budget: default_total_budget(),
            cost_per_operator: default_cost_per_operator(),
            cost_per_result_char: default_cost_per_result_char(),
            node_io_timeout_ms: default_node_io_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            private_key: default_private_key(),
            keys_dir: default_keys_dir(),
            integrity_key: default_integrity_key(),
            users: Vec::new(),
        }
    }
}
