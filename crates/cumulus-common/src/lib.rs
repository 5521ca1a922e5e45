//! # Cumulus Common
//!
//! Shared types, wire grammar, and transport used across Cumulus components.
//!
//! ## Modules
//! - `types` - Core data structures (Operator, OperatorSet, Status, ComputationRecord)
//! - `wire` - Heartbeats, join offers, peer commands, compute steps
//! - `channel` - Base64 line channel with an AES-256-CTR stage
//! - `handshake` - Client/controller mutual authentication
//! - `integrity` - HMAC tags for controller/node traffic
//! - `keys` - Identity keys, sealed boxes, key directories
//! - `error` - Common error types
//! - `constants` - Shared configuration constants

pub mod channel;
pub mod constants;
pub mod error;
pub mod handshake;
pub mod integrity;
pub mod keys;
pub mod types;
pub mod wire;

pub use channel::{SecureChannel, SessionKeys};
pub use error::{GridError, Result};
pub use integrity::IntegrityKey;
pub use keys::{IdentityKey, KeyDir, KeyDirectory, PublicIdentity};
pub use types::*;
