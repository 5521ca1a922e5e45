//! Configuration management for the client.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use cumulus_common::constants::DEFAULT_CONTROLLER_TCP_PORT;
use cumulus_common::keys::is_valid_identity;

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Identity presented during the handshake
    #[serde(default)]
    pub username: String,

    /// Controller host name or address
    #[serde(default = "default_controller_host")]
    pub controller_host: String,

    /// Controller client port
    #[serde(default = "default_controller_tcp_port")]
    pub controller_tcp_port: u16,

    /// Our private key file; defaults to `keys/<username>.key`
    #[serde(default)]
    pub private_key: Option<String>,

    /// Controller public key file
    #[serde(default = "default_controller_public_key")]
    pub controller_public_key: String,
}

fn default_controller_host() -> String { "127.0.0.1".to_string() }
fn default_controller_tcp_port() -> u16 { DEFAULT_CONTROLLER_TCP_PORT }
fn default_controller_public_key() -> String { "keys/controller.pub".to_string() }

impl ClientConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, username: Option<&str>) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .add_source(config::Environment::with_prefix("CUMULUS_CLIENT").separator("__"))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            Self::default()
        };

        if let Some(username) = username {
            config.username = username.to_string();
        }

        if !is_valid_identity(&config.username) {
            anyhow::bail!(
                "username {:?} must be non-empty and use only letters, digits, or '_'",
                config.username
            );
        }
        Ok(config)
    }

    pub fn private_key_path(&self) -> String {
        self.private_key
            .clone()
            .unwrap_or_else(|| format!("keys/{}.key", self.username))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            controller_host: default_controller_host(),
            controller_tcp_port: default_controller_tcp_port(),
            private_key: None,
            controller_public_key: default_controller_public_key(),
        }
    }
}
