//! Per-peer state kept by the coordinator
//!
//! - Capability table: routing keys each peer announced
//! - Responded set: peers that already received this node's listing

pub mod capabilities;
pub mod responded;

pub use capabilities::*;
pub use responded::*;
