//! Client account module.
//!
//! Tracks presence, credit balances, and low-credit subscriptions.

mod ledger;

pub use ledger::{AccountLedger, AccountSnapshot, NotificationCallback};
