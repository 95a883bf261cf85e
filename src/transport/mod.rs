//! Transport contract consumed by the coordinator
//!
//! A transport discovers peers, reports their arrival and departure, and
//! moves opaque multi-segment frames between them. Two implementations ship
//! with the crate:
//!
//! - [`memory`]: in-process hub used by tests and embedded setups
//! - [`tcp`]: static-seed TCP mesh used by the `peercoms` binary

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;
pub mod tcp;

pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::{TcpConfig, TcpTransport};

/// Ordered frame segments of one transport message
pub type Segments = Vec<Vec<u8>>;

/// Events delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer became reachable
    Enter { peer_id: String, name: String },

    /// A peer went away
    Exit { peer_id: String },

    /// A frame addressed to this peer only
    Whisper { peer_id: String, segments: Segments },

    /// A frame sent to a group this peer belongs to
    Shout {
        peer_id: String,
        group: String,
        segments: Segments,
    },

    /// A peer joined a group
    Join { peer_id: String, group: String },

    /// A peer left a group
    Leave { peer_id: String, group: String },
}

impl TransportEvent {
    /// Peer the event originates from
    pub fn peer_id(&self) -> &str {
        match self {
            TransportEvent::Enter { peer_id, .. }
            | TransportEvent::Exit { peer_id }
            | TransportEvent::Whisper { peer_id, .. }
            | TransportEvent::Shout { peer_id, .. }
            | TransportEvent::Join { peer_id, .. }
            | TransportEvent::Leave { peer_id, .. } => peer_id,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::Enter { .. } => "ENTER",
            TransportEvent::Exit { .. } => "EXIT",
            TransportEvent::Whisper { .. } => "WHISPER",
            TransportEvent::Shout { .. } => "SHOUT",
            TransportEvent::Join { .. } => "JOIN",
            TransportEvent::Leave { .. } => "LEAVE",
        }
    }
}

/// Peer-to-peer transport
///
/// Failures surface as [`crate::Error::Transport`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Unique identifier of this peer on the transport
    fn peer_id(&self) -> &str;

    /// Human-readable node name
    fn name(&self) -> &str;

    /// Begin participating; peers start seeing this node
    async fn start(&self) -> Result<()>;

    /// Stop participating; `next_event` returns `None` afterwards
    async fn stop(&self) -> Result<()>;

    /// Join a named group
    async fn join(&self, group: &str) -> Result<()>;

    /// Send segments to one peer
    async fn whisper(&self, peer_id: &str, segments: Segments) -> Result<()>;

    /// Send segments to every other member of a group
    async fn shout(&self, group: &str, segments: Segments) -> Result<()>;

    /// Wait for the next event
    async fn next_event(&self) -> Option<TransportEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = TransportEvent::Shout {
            peer_id: "p1".into(),
            group: "mktl-test".into(),
            segments: vec![b"{}".to_vec()],
        };
        assert_eq!(event.peer_id(), "p1");
        assert_eq!(event.kind(), "SHOUT");

        let event = TransportEvent::Exit { peer_id: "p2".into() };
        assert_eq!(event.peer_id(), "p2");
        assert_eq!(event.kind(), "EXIT");
    }
}
