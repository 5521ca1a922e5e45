//! Authenticated session with the controller.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use cumulus_common::{IdentityKey, PublicIdentity, SecureChannel, handshake};

use crate::config::ClientConfig;

/// An open, keyed session
pub struct Session {
    channel: SecureChannel,
}

impl Session {
    /// Connect and authenticate as `username`
    pub async fn open(
        addr: &str,
        username: &str,
        identity: &IdentityKey,
        controller: &PublicIdentity,
    ) -> Result<Self> {
        let mut channel = SecureChannel::new();
        channel
            .connect(addr)
            .await
            .with_context(|| format!("Failed to connect to controller at {}", addr))?;
        handshake::initiate(&mut channel, username, identity, controller)
            .await
            .context("Handshake with controller failed")?;
        Ok(Self { channel })
    }

    /// Send one command and wait for its reply. `None` means the controller hung up.
    pub async fn request(&mut self, command: &str) -> Result<Option<String>> {
        self.channel.send_text(command).await?;
        Ok(self.channel.receive_text().await?)
    }

    pub async fn close(&mut self) {
        self.channel.close().await;
    }
}

/// Commands may be typed with or without the leading `!`
pub fn normalize(line: &str) -> Option<&str> {
    let line = line.trim();
    let line = line.strip_prefix('!').unwrap_or(line);
    if line.is_empty() { None } else { Some(line) }
}

/// Log in, then forward stdin lines until `exit`, EOF, or the controller hangs up
pub async fn run(config: &ClientConfig) -> Result<()> {
    let identity = IdentityKey::load(config.private_key_path())
        .with_context(|| format!("Failed to load private key {}", config.private_key_path()))?;
    let controller = PublicIdentity::load(&config.controller_public_key).with_context(|| {
        format!("Failed to load controller key {}", config.controller_public_key)
    })?;

    let addr = format!("{}:{}", config.controller_host, config.controller_tcp_port);
    let mut session = Session::open(&addr, &config.username, &identity, &controller).await?;
    tracing::info!(controller = %addr, user = %config.username, "🔐 Session established");

    match session.request("login").await? {
        Some(reply) => println!("{}", reply),
        None => {
            println!("Controller closed the connection.");
            return Ok(());
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = normalize(&line) else {
            continue;
        };
        if command == "exit" {
            break;
        }

        match session.request(command).await {
            Ok(Some(reply)) => println!("{}", reply),
            Ok(None) => {
                println!("Controller closed the connection.");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session failed");
                println!("Connection to controller lost.");
                break;
            }
        }
    }

    // Frees the account for the next session
    if let Ok(Some(reply)) = session.request("logout").await {
        tracing::debug!(reply = %reply, "Logged out");
    }
    session.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_common::KeyDirectory;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("!credits"), Some("credits"));
        assert_eq!(normalize("  buy 10 "), Some("buy 10"));
        assert_eq!(normalize("!"), None);
        assert_eq!(normalize(""), None);
    }

    #[tokio::test]
    async fn test_session_against_responder() {
        let controller = IdentityKey::generate();
        let controller_pub = controller.public();
        let alice = IdentityKey::generate();
        let keys: Arc<dyn KeyDirectory> =
            Arc::new(HashMap::from([("alice".to_string(), alice.public())]));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = SecureChannel::from_stream(stream);
            let user = handshake::respond(&mut channel, &controller, &keys)
                .await
                .unwrap();
            while let Some(request) = channel.receive_text().await.unwrap() {
                let reply = format!("{} said {}", user, request);
                channel.send_text(&reply).await.unwrap();
            }
        });

        let mut session = Session::open(&addr, "alice", &alice, &controller_pub)
            .await
            .unwrap();
        assert_eq!(
            session.request("credits").await.unwrap().as_deref(),
            Some("alice said credits")
        );
        session.close().await;
    }

    #[tokio::test]
    async fn test_wrong_controller_key_fails() {
        let controller = IdentityKey::generate();
        let impostor = IdentityKey::generate().public();
        let alice = IdentityKey::generate();
        let keys: Arc<dyn KeyDirectory> =
            Arc::new(HashMap::from([("alice".to_string(), alice.public())]));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = SecureChannel::from_stream(stream);
            let _ = handshake::respond(&mut channel, &controller, &keys).await;
        });

        assert!(Session::open(&addr, "alice", &alice, &impostor).await.is_err());
    }
}
