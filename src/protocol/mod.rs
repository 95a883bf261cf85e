//! Protocol module for peer messaging
//!
//! Defines the message model, the two-segment wire codec and the
//! capability-announcement control payloads.

pub mod codec;
pub mod control;
mod message;

pub use codec::{decode, decode_segments, encode, WireFrames, WireHeader};
pub use control::{is_control_key, CapabilityListing, KEY_ANNOUNCE, PEER_KEYS};
pub use message::*;
