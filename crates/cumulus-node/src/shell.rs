//! Operator command surface on stdin.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::admission::query_resources;
use crate::state::NodeState;

const PEER_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// What the shell should do after a command
#[derive(Debug, PartialEq, Eq)]
pub enum ShellReply {
    Output(String),
    Exit,
}

/// Read operator commands from stdin until `!exit`, EOF, or shutdown
pub async fn run_shell(state: NodeState) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shutdown = state.shutdown.subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::debug!("Operator input closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read operator input");
                        break;
                    }
                };

                match execute(&state, &line).await {
                    ShellReply::Output(text) if text.is_empty() => {}
                    ShellReply::Output(text) => println!("{}", text),
                    ShellReply::Exit => {
                        let _ = state.shutdown.send(());
                        break;
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Run one operator command
pub async fn execute(state: &NodeState, line: &str) -> ShellReply {
    let text = match line.trim() {
        "" => String::new(),
        "!resources" => format!(
            "The current resources are {}!",
            state.resources.current().await
        ),
        "!peers" => {
            let peers = state.peers.read().await.clone();
            if peers.is_empty() {
                "No peers.".to_string()
            } else {
                let mut lines = Vec::with_capacity(peers.len());
                for peer in peers {
                    let level = match query_resources(peer, PEER_QUERY_TIMEOUT).await {
                        Ok(level) => level.to_string(),
                        Err(e) => e.user_message(),
                    };
                    lines.push(format!("{} {}", peer, level));
                }
                lines.join("\n")
            }
        }
        "!exit" => return ShellReply::Exit,
        _ => "Error: command not found".to_string(),
    };

    ShellReply::Output(text)
}
