//! Cluster membership.
//!
//! Implements:
//! - Heartbeat-driven node registry with sweep eviction
//! - Join probe answers for nodes running admission

pub mod listener;
mod membership;

pub use membership::{MembershipTracker, NodeRecord};
