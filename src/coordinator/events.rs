//! Events and counters reported by the coordinator

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::HandlerError;

// ─────────────────────────────────────────────────────────────────
// Event Channel
// ─────────────────────────────────────────────────────────────────

/// Events emitted by a running coordinator
///
/// Delivered through the receiver returned by `Coordinator::start`. Sends
/// never block; events are dropped when the receiver falls behind.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// A peer became reachable
    PeerEntered { peer_id: String, name: String },

    /// A peer went away
    PeerExited { peer_id: String },

    /// A peer's announced key set was replaced
    CapabilitiesUpdated { peer_id: String, keys: Vec<String> },

    /// A handler completed
    Handled { req_id: String, key: String },

    /// A handler returned an error or panicked
    HandlerFailed {
        req_id: String,
        key: String,
        error: HandlerError,
    },

    /// No handler is registered for the key
    NoHandler { req_id: String, key: String },

    /// An inbound frame could not be decoded
    DecodeFailed { peer_id: String, error: String },

    /// The inbound queue was full and the message was dropped
    Dropped {
        peer_id: String,
        key: String,
        capacity: usize,
    },

    /// A send issued by the coordinator itself failed
    TransportFailed { error: String },
}

// ─────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────

/// Snapshot of coordinator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Frames received from the transport
    pub received: u64,
    /// Messages placed on the inbound queue
    pub queued: u64,
    /// Messages taken off the queue by a worker
    pub dispatched: u64,
    pub handled: u64,
    pub handler_failed: u64,
    pub no_handler: u64,
    /// Messages dropped because the queue was full
    pub dropped: u64,
    pub decode_failed: u64,
    /// Success and failure replies sent
    pub replies_sent: u64,
    /// Capability listings sent
    pub announcements_sent: u64,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    pub received: AtomicU64,
    pub queued: AtomicU64,
    pub dispatched: AtomicU64,
    pub handled: AtomicU64,
    pub handler_failed: AtomicU64,
    pub no_handler: AtomicU64,
    pub dropped: AtomicU64,
    pub decode_failed: AtomicU64,
    pub replies_sent: AtomicU64,
    pub announcements_sent: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CoordinatorStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CoordinatorStats {
            received: load(&self.received),
            queued: load(&self.queued),
            dispatched: load(&self.dispatched),
            handled: load(&self.handled),
            handler_failed: load(&self.handler_failed),
            no_handler: load(&self.no_handler),
            dropped: load(&self.dropped),
            decode_failed: load(&self.decode_failed),
            replies_sent: load(&self.replies_sent),
            announcements_sent: load(&self.announcements_sent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let counters = StatsCounters::default();
        StatsCounters::bump(&counters.received);
        StatsCounters::bump(&counters.received);
        StatsCounters::bump(&counters.dropped);

        let stats = counters.snapshot();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.handled, 0);
    }
}
