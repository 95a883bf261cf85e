//! peercoms - peer-to-peer group messaging with routing-key handlers
//!
//! A node joins a group of peers, tells every peer which routing keys it
//! handles, and dispatches inbound messages to handlers by key on a pool of
//! workers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use peercoms::coordinator::{Coordinator, CoordinatorConfig, HandlerResult};
//! use peercoms::protocol::Message;
//! use peercoms::transport::MemoryHub;
//!
//! # async fn demo() -> peercoms::Result<()> {
//! let hub = MemoryHub::new();
//! let node = Coordinator::new(Arc::new(hub.endpoint("node-a")), CoordinatorConfig::default());
//! node.register_handler("test.key", |msg: &Message, _sender: &str| -> HandlerResult {
//!     println!("{:?}", msg.payload());
//!     Ok(None)
//! })?;
//! let _events = node.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod peer;
pub mod protocol;
pub mod transport;

pub use error::{Error, HandlerError, Result};
