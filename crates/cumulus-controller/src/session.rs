//! Client session server.
//!
//! Each accepted connection runs the handshake as responder and then serves
//! line commands over the encrypted channel:
//!
//! ```text
//! login | logout | credits | buy <amount> | list | compute <term>
//! ```

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use cumulus_common::{GridError, SecureChannel, handshake};

use crate::state::ControllerState;

/// Registry of open client connections
#[derive(Default)]
pub struct ActiveSessions {
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, SocketAddr>>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, peer: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut open) = self.open.lock() {
            open.insert(id, peer);
        }
        id
    }

    fn remove(&self, id: u64) {
        if let Ok(mut open) = self.open.lock() {
            open.remove(&id);
        }
    }

    pub fn count(&self) -> usize {
        self.open.lock().map(|open| open.len()).unwrap_or(0)
    }

    /// Wait until every session has closed, or `limit` elapses
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

/// Bind the client-facing TCP listener
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {}", addr))
}

/// Accept client connections until shutdown
pub async fn run_server(listener: TcpListener, state: ControllerState) -> Result<()> {
    let mut shutdown = state.shutdown.subscribe();

    tracing::info!(
        addr = %listener.local_addr().context("TCP listener has no local address")?,
        "🚀 Client session server listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, state).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Client session server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: ControllerState) {
    let mut shutdown = state.shutdown.subscribe();
    let id = state.sessions.register(peer);
    let mut channel = SecureChannel::from_stream(stream);

    let authenticated = tokio::select! {
        result = tokio::time::timeout(
            state.config.handshake_timeout(),
            handshake::respond(&mut channel, &state.identity, &state.keys),
        ) => result.unwrap_or_else(|_| Err(GridError::HandshakeFailed("timed out".to_string()))),
        _ = shutdown.recv() => {
            channel.close().await;
            state.sessions.remove(id);
            return;
        }
    };

    let user = match authenticated {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Client authentication failed");
            channel.close().await;
            state.sessions.remove(id);
            return;
        }
    };

    tracing::info!(peer = %peer, user = %user, "Client authenticated");
    state.ledger.ensure(&user).await;

    let mut session = ClientSession::new(user);
    loop {
        tokio::select! {
            received = channel.receive_text() => {
                let request = match received {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) if e.is_terminal() => {
                        tracing::debug!(peer = %peer, error = %e, "Session transport error");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Unreadable request");
                        break;
                    }
                };

                let reply = session.handle(&state, &request).await;
                if let Err(e) = channel.send_text(&reply).await {
                    tracing::debug!(peer = %peer, error = %e, "Failed to send reply");
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    if session.logged_in {
        state.ledger.logout(&session.user).await;
    }
    channel.close().await;
    state.sessions.remove(id);
    tracing::info!(peer = %peer, user = %session.user, "Client session closed");
}

/// Per-connection command state
struct ClientSession {
    user: String,
    logged_in: bool,
}

impl ClientSession {
    fn new(user: String) -> Self {
        Self {
            user,
            logged_in: false,
        }
    }

    async fn handle(&mut self, state: &ControllerState, request: &str) -> String {
        let request = request.trim();
        let (command, argument) = request.split_once(' ').unwrap_or((request, ""));
        let argument = argument.trim();

        match command {
            "login" => return self.login(state).await,
            "logout" | "credits" | "buy" | "list" | "compute" => {}
            _ => return "Error: command not found".to_string(),
        }
        if !self.logged_in {
            return "Error: you have to login first".to_string();
        }

        match command {
            "logout" => {
                state.ledger.logout(&self.user).await;
                self.logged_in = false;
                "Successfully logged out.".to_string()
            }
            "credits" => {
                let credits = state.ledger.credits(&self.user).await.unwrap_or(0);
                format!("You have {} credits left.", credits)
            }
            "buy" => match argument.parse::<i64>() {
                Ok(amount) if amount > 0 => {
                    let credits = state.ledger.add_credits(&self.user, amount).await.unwrap_or(0);
                    format!("You now have {} credits.", credits)
                }
                _ => "Error: amount must be a positive number".to_string(),
            },
            "list" => {
                let operators = state.membership.online_operators().await;
                if operators.is_empty() {
                    "no operations support currently".to_string()
                } else {
                    operators.to_token()
                }
            }
            _ => match state.dispatcher.compute(&self.user, argument).await {
                Ok(result) => result,
                Err(e) => e.user_message(),
            },
        }
    }

    async fn login(&mut self, state: &ControllerState) -> String {
        if self.logged_in {
            return "You are already logged in.".to_string();
        }
        if !state.ledger.login(&self.user).await {
            return "Error: user is already logged in".to_string();
        }
        self.logged_in = true;
        "Successfully logged in.".to_string()
    }
}
