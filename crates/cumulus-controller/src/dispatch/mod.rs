//! Compute dispatch.
//!
//! Splits client terms into binary steps, routes each to the least-used
//! capable node over an integrity-tagged exchange, and bills the client.

mod dispatcher;
mod node_link;
mod term;

pub use dispatcher::{Dispatcher, Pricing};
pub use node_link::NodeLink;
