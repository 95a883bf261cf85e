//! Peers this node has already sent its capability listing to

use std::collections::HashSet;

use parking_lot::Mutex;

/// Dedup set guarding the one-time listing reply
#[derive(Default)]
pub struct RespondedSet {
    peers: Mutex<HashSet<String>>,
}

impl RespondedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a peer as responded to. Returns true if it was not marked before.
    pub fn mark(&self, peer_id: &str) -> bool {
        self.peers.lock().insert(peer_id.to_string())
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.lock().contains(peer_id)
    }

    /// Every marked peer
    pub fn peers(&self) -> Vec<String> {
        self.peers.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    pub fn clear(&self) {
        self.peers.lock().clear();
    }
}
