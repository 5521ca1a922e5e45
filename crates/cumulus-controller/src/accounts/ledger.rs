//! Client accounts: presence, credit balance, and low-credit alerts.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use cumulus_common::{GridError, Result, Status};

/// Invoked once with `(username, threshold)` when a balance drops below the threshold
pub type NotificationCallback = Box<dyn FnOnce(&str, i64) + Send>;

struct Subscription {
    threshold: i64,
    callback: NotificationCallback,
}

struct Account {
    name: String,
    status: Status,
    credits: i64,
    subscription: Option<Subscription>,
}

impl Account {
    fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            name: self.name.clone(),
            status: self.status,
            credits: self.credits,
        }
    }

    /// Take the subscription if the balance fell strictly below its threshold
    fn due_notification(&mut self) -> Option<Subscription> {
        let due = matches!(&self.subscription, Some(sub) if self.credits < sub.threshold);
        if due { self.subscription.take() } else { None }
    }
}

/// Read-only view of an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub name: String,
    pub status: Status,
    pub credits: i64,
}

impl std::fmt::Display for AccountSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} Credits: {}", self.name, self.status, self.credits)
    }
}

/// Authoritative credit ledger.
///
/// The map lock is only held to find an account; balance changes lock the
/// single account, so unrelated clients never wait on each other.
#[derive(Default)]
pub struct AccountLedger {
    accounts: RwLock<HashMap<String, Arc<Mutex<Account>>>>,
}

impl AccountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) an account with a starting balance
    pub async fn provision(&self, name: &str, credits: i64) {
        let account = Account {
            name: name.to_string(),
            status: Status::Offline,
            credits,
            subscription: None,
        };
        self.accounts
            .write()
            .await
            .insert(name.to_string(), Arc::new(Mutex::new(account)));
    }

    /// Make sure an account exists, creating an empty one on first sight
    pub async fn ensure(&self, name: &str) {
        if self.accounts.read().await.contains_key(name) {
            return;
        }
        let mut accounts = self.accounts.write().await;
        accounts.entry(name.to_string()).or_insert_with(|| {
            tracing::info!(user = %name, "Account created on first authentication");
            Arc::new(Mutex::new(Account {
                name: name.to_string(),
                status: Status::Offline,
                credits: 0,
                subscription: None,
            }))
        });
    }

    async fn account(&self, name: &str) -> Option<Arc<Mutex<Account>>> {
        self.accounts.read().await.get(name).cloned()
    }

    /// Mark the user Online. Fails if they already are.
    pub async fn login(&self, name: &str) -> bool {
        let Some(account) = self.account(name).await else {
            return false;
        };
        let mut account = account.lock().await;
        if account.status == Status::Online {
            return false;
        }
        account.status = Status::Online;
        true
    }

    pub async fn logout(&self, name: &str) {
        if let Some(account) = self.account(name).await {
            account.lock().await.status = Status::Offline;
        }
    }

    /// Mark every account Offline
    pub async fn logout_all(&self) {
        let accounts: Vec<_> = self.accounts.read().await.values().cloned().collect();
        for account in accounts {
            account.lock().await.status = Status::Offline;
        }
    }

    pub async fn credits(&self, name: &str) -> Option<i64> {
        Some(self.account(name).await?.lock().await.credits)
    }

    /// Fail with `InsufficientCredits` unless the balance covers `required`
    pub async fn ensure_covers(&self, name: &str, required: i64) -> Result<()> {
        let available = self.credits(name).await.unwrap_or(0);
        if available < required {
            return Err(GridError::InsufficientCredits {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Add credits; returns the new balance
    pub async fn add_credits(&self, name: &str, amount: i64) -> Option<i64> {
        let account = self.account(name).await?;
        let mut account = account.lock().await;
        account.credits = account.credits.saturating_add(amount);
        Some(account.credits)
    }

    /// Debit credits and run the threshold check; returns the new balance
    pub async fn subtract_credits(&self, name: &str, amount: i64) -> Option<i64> {
        let account = self.account(name).await?;
        let (balance, due) = {
            let mut account = account.lock().await;
            account.credits = account.credits.saturating_sub(amount);
            (account.credits, account.due_notification())
        };

        if let Some(sub) = due {
            tracing::info!(
                user = %name,
                balance,
                threshold = sub.threshold,
                "Credit threshold crossed"
            );
            (sub.callback)(name, sub.threshold);
        }
        Some(balance)
    }

    /// Register a one-shot low-credit alert, replacing any earlier one.
    ///
    /// Returns false for an unknown user.
    pub async fn subscribe(
        &self,
        name: &str,
        threshold: i64,
        callback: NotificationCallback,
    ) -> bool {
        let Some(account) = self.account(name).await else {
            return false;
        };
        account.lock().await.subscription = Some(Subscription {
            threshold,
            callback,
        });
        true
    }

    /// All accounts sorted by name
    pub async fn list(&self) -> Vec<AccountSnapshot> {
        let accounts: Vec<_> = self.accounts.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(accounts.len());
        for account in accounts {
            snapshots.push(account.lock().await.snapshot());
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn ledger() -> AccountLedger {
        let ledger = AccountLedger::new();
        ledger.provision("alice", 500).await;
        ledger.provision("bill", 40).await;
        ledger
    }

    #[tokio::test]
    async fn test_single_login_per_user() {
        let ledger = ledger().await;
        assert!(ledger.login("alice").await);
        assert!(!ledger.login("alice").await);
        ledger.logout("alice").await;
        assert!(ledger.login("alice").await);
        assert!(!ledger.login("nobody").await);
    }

    #[tokio::test]
    async fn test_credit_arithmetic() {
        let ledger = ledger().await;
        assert_eq!(ledger.add_credits("alice", 100).await, Some(600));
        assert_eq!(ledger.subtract_credits("alice", 250).await, Some(350));
        assert_eq!(ledger.credits("nobody").await, None);

        assert!(ledger.ensure_covers("bill", 40).await.is_ok());
        assert!(matches!(
            ledger.ensure_covers("bill", 50).await,
            Err(GridError::InsufficientCredits {
                required: 50,
                available: 40
            })
        ));
    }

    #[tokio::test]
    async fn test_notification_fires_once() {
        let ledger = ledger().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        assert!(
            ledger
                .subscribe(
                    "alice",
                    300,
                    Box::new(move |user: &str, threshold: i64| {
                        assert_eq!(user, "alice");
                        assert_eq!(threshold, 300);
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .await
        );

        // 500 -> 300 is not strictly below the threshold
        ledger.subtract_credits("alice", 200).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        ledger.subtract_credits("alice", 50).await;
        ledger.subtract_credits("alice", 50).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_replaces_previous() {
        let ledger = ledger().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let (a, b) = (fired.clone(), fired.clone());
        let first: NotificationCallback = Box::new(move |_, _| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let second: NotificationCallback = Box::new(move |_, _| {
            b.fetch_add(10, Ordering::SeqCst);
        });
        ledger.subscribe("alice", 450, first).await;
        ledger.subscribe("alice", 100, second).await;

        ledger.subtract_credits("alice", 100).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        ledger.subtract_credits("alice", 350).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        assert!(!ledger.subscribe("nobody", 1, Box::new(|_: &str, _: i64| {})).await);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let ledger = Arc::new(ledger().await);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let l = ledger.clone();
            handles.push(tokio::spawn(async move { l.add_credits("alice", 10).await }));
            let l = ledger.clone();
            handles.push(tokio::spawn(async move { l.subtract_credits("alice", 5).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(ledger.credits("alice").await, Some(750));
    }

    #[tokio::test]
    async fn test_list_and_logout_all() {
        let ledger = ledger().await;
        ledger.ensure("carol").await;
        ledger.login("bill").await;

        let rendered: Vec<String> = ledger.list().await.iter().map(|a| a.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "alice offline Credits: 500",
                "bill online Credits: 40",
                "carol offline Credits: 0"
            ]
        );

        ledger.logout_all().await;
        assert!(ledger.list().await.iter().all(|a| a.status == Status::Offline));
    }
}
