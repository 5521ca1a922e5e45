//! Operator command surface on stdin.

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::state::ControllerState;

/// What the shell should do after a command
#[derive(Debug, PartialEq, Eq)]
pub enum ShellReply {
    Output(String),
    Exit,
}

/// Read operator commands from stdin until `!exit`, EOF, or shutdown
pub async fn run_shell(state: ControllerState) {
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
pub async fn execute(state: &ControllerState, line: &str) -> ShellReply {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return ShellReply::Output(String::new());
    };

    let text = match command {
        "!nodes" => {
            let nodes = state.membership.list().await;
            if nodes.is_empty() {
                "No nodes registered.".to_string()
            } else {
                join_lines(nodes.iter().enumerate().map(|(i, n)| format!("{}. {}", i + 1, n)))
            }
        }
        "!users" => join_lines(
            state
                .ledger
                .list()
                .await
                .iter()
                .enumerate()
                .map(|(i, a)| format!("{}. {}", i + 1, a)),
        ),
        "!stats" => {
            let stats = state.dispatcher.operator_stats().await;
            if stats.is_empty() {
                "No operators requested yet.".to_string()
            } else {
                join_lines(stats.iter().map(|(op, count)| format!("{} {}", op, count)))
            }
        }
        "!logs" => {
            let records = state.dispatcher.collect_logs().await;
            if records.is_empty() {
                "No computations logged.".to_string()
            } else {
                join_lines(records.iter().map(|r| r.to_string()))
            }
        }
        "!subscribe" => {
            let (Some(user), Some(threshold)) = (parts.next(), parts.next()) else {
                return ShellReply::Output("Usage: !subscribe <user> <threshold>".to_string());
            };
            let Ok(threshold) = threshold.parse::<i64>() else {
                return ShellReply::Output("Error: threshold must be a number".to_string());
            };
            let subscribed = state
                .ledger
                .subscribe(
                    user,
                    threshold,
                    Box::new(|user: &str, threshold: i64| {
                        println!("Notification: {} has less than {} credits.", user, threshold);
                    }),
                )
                .await;
            if subscribed {
                format!("Successfully subscribed for user {}.", user)
            } else {
                format!("Error: unknown user {}", user)
            }
        }
        "!exit" => return ShellReply::Exit,
        _ => "Error: command not found".to_string(),
    };

    ShellReply::Output(text)
}

fn join_lines(lines: impl Iterator<Item = String>) -> String {
    lines.collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, UserConfig};
    use cumulus_common::wire::Heartbeat;
    use cumulus_common::{IdentityKey, IntegrityKey, KeyDirectory, OperatorSet, PublicIdentity};
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn state() -> ControllerState {
        let keys: Arc<dyn KeyDirectory> = Arc::new(HashMap::<String, PublicIdentity>::new());
        let config = ControllerConfig {
            users: vec![
                UserConfig {
                    name: "bill".to_string(),
                    credits: 200,
                },
                UserConfig {
                    name: "alice".to_string(),
                    credits: 500,
                },
            ],
            ..ControllerConfig::default()
        };
        ControllerState::new(
            config,
            IdentityKey::generate(),
            keys,
            IntegrityKey::new(b"shell".to_vec()).unwrap(),
        )
        .await
    }

    fn output(reply: ShellReply) -> String {
        match reply {
            ShellReply::Output(text) => text,
            ShellReply::Exit => panic!("unexpected exit"),
        }
    }

    #[tokio::test]
    async fn test_nodes_and_users() {
        let state = state().await;
        assert_eq!(output(execute(&state, "!nodes").await), "No nodes registered.");

        state
            .membership
            .on_heartbeat(
                "127.0.0.1".parse().unwrap(),
                &Heartbeat::new(15000, OperatorSet::from_token("+")),
            )
            .await;
        assert_eq!(
            output(execute(&state, "!nodes").await),
            "1. IP: 127.0.0.1 Port: 15000 online Usage: 0"
        );
        assert_eq!(
            output(execute(&state, "!users").await),
            "1. alice offline Credits: 500\n2. bill offline Credits: 200"
        );
    }

    #[tokio::test]
    async fn test_subscribe_and_exit() {
        let state = state().await;
        assert_eq!(
            output(execute(&state, "!subscribe alice 100").await),
            "Successfully subscribed for user alice."
        );
        assert_eq!(
            output(execute(&state, "!subscribe nobody 100").await),
            "Error: unknown user nobody"
        );
        assert!(output(execute(&state, "!subscribe alice").await).starts_with("Usage"));
        assert_eq!(output(execute(&state, "!dance").await), "Error: command not found");
        assert_eq!(execute(&state, "!exit").await, ShellReply::Exit);
    }
}
