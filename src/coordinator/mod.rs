//! Coordinator module
//!
//! Owns the peer-facing side of a node:
//! - Receive task draining the transport
//! - Worker pool dispatching messages to handlers by routing key
//! - Capability announcement and request/reply correlation

mod events;
mod handler;
mod node;

pub use events::{CoordinatorEvent, CoordinatorStats};
pub use handler::{Handler, HandlerRegistry, HandlerResult};
pub use node::*;
