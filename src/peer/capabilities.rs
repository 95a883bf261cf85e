//! Capability table: which routing keys each known peer handles
//!
//! Populated from `peer.keys` announcements. Each announcement replaces the
//! peer's entry wholesale, so a key the peer stopped supporting disappears.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

// ─────────────────────────────────────────────────────────────────
// Peer Capabilities
// ─────────────────────────────────────────────────────────────────

/// The latest announced capabilities of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCapabilities {
    /// Transport identifier of the peer
    pub peer_id: String,

    /// Routing keys the peer has handlers for
    pub keys: BTreeSet<String>,

    /// When the latest announcement was recorded
    pub announced_at: DateTime<Utc>,

    /// How many announcements this peer has made
    pub announcements: u64,
}

impl PeerCapabilities {
    pub fn supports(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

// ─────────────────────────────────────────────────────────────────
// Capability Table
// ─────────────────────────────────────────────────────────────────

/// Thread-safe mapping from peer id to announced routing keys
pub struct CapabilityTable {
    peers: RwLock<HashMap<String, PeerCapabilities>>,
}

impl CapabilityTable {
    /// Create a new empty table
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Record an announcement, replacing any previous entry for the peer.
    /// Returns the key set that was replaced.
    pub fn replace<I, S>(&self, peer_id: &str, keys: I) -> Option<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: BTreeSet<String> = keys.into_iter().map(Into::into).collect();

        let mut peers = self.peers.write();
        let announcements = peers.get(peer_id).map_or(0, |p| p.announcements) + 1;
        peers
            .insert(
                peer_id.to_string(),
                PeerCapabilities {
                    peer_id: peer_id.to_string(),
                    keys,
                    announced_at: Utc::now(),
                    announcements,
                },
            )
            .map(|previous| previous.keys)
    }

    /// Remove a peer's entry
    pub fn remove(&self, peer_id: &str) -> Option<PeerCapabilities> {
        self.peers.write().remove(peer_id)
    }

    /// Get a clone of a peer's entry
    pub fn get(&self, peer_id: &str) -> Option<PeerCapabilities> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Keys announced by a peer (empty if unknown)
    pub fn keys_for(&self, peer_id: &str) -> BTreeSet<String> {
        self.peers
            .read()
            .get(peer_id)
            .map(|p| p.keys.clone())
            .unwrap_or_default()
    }

    /// Whether a peer announced a handler for `key`
    pub fn supports(&self, peer_id: &str, key: &str) -> bool {
        self.peers
            .read()
            .get(peer_id)
            .is_some_and(|p| p.supports(key))
    }

    /// Peers that announced a handler for `key`, sorted by id
    pub fn peers_supporting(&self, key: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .read()
            .values()
            .filter(|p| p.supports(key))
            .map(|p| p.peer_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Clone of every entry
    pub fn snapshot(&self) -> Vec<PeerCapabilities> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn clear(&self) {
        self.peers.write().clear();
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
