//! In-process transport hub
//!
//! Every endpoint created from the same [`MemoryHub`] can see the others.
//! Routing is synchronous under one lock, so an ENTER for a peer is always
//! queued before any frame from that peer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{Segments, Transport, TransportEvent};

struct Endpoint {
    name: String,
    tx: mpsc::UnboundedSender<TransportEvent>,
    groups: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<String, Endpoint>,
}

/// Shared routing table for in-process endpoints
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<RwLock<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detached endpoint with a fresh id
    pub fn endpoint(&self, name: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            peer_id: Uuid::new_v4().to_string(),
            name: name.into(),
            inbox: Mutex::new(None),
        }
    }

    /// Ids of attached endpoints
    pub fn peers(&self) -> Vec<String> {
        self.state.read().endpoints.keys().cloned().collect()
    }

    /// Deliver a raw event to an attached endpoint
    pub fn inject(&self, peer_id: &str, event: TransportEvent) -> Result<()> {
        let state = self.state.read();
        let endpoint = state
            .endpoints
            .get(peer_id)
            .ok_or_else(|| Error::transport(format!("unknown peer {}", peer_id)))?;
        endpoint
            .tx
            .send(event)
            .map_err(|_| Error::transport(format!("peer {} inbox closed", peer_id)))
    }
}

/// One endpoint on a [`MemoryHub`]
pub struct MemoryTransport {
    hub: MemoryHub,
    peer_id: String,
    name: String,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MemoryTransport {
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }

    fn ensure_attached(&self, state: &HubState) -> Result<()> {
        if state.endpoints.contains_key(&self.peer_id) {
            Ok(())
        } else {
            Err(Error::transport(format!("endpoint {} is not started", self.peer_id)))
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        let mut inbox = self.inbox.lock().await;
        let mut state = self.hub.state.write();
        if state.endpoints.contains_key(&self.peer_id) {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (other_id, other) in &state.endpoints {
            let _ = other.tx.send(TransportEvent::Enter {
                peer_id: self.peer_id.clone(),
                name: self.name.clone(),
            });
            let _ = tx.send(TransportEvent::Enter {
                peer_id: other_id.clone(),
                name: other.name.clone(),
            });
            for group in &other.groups {
                let _ = tx.send(TransportEvent::Join {
                    peer_id: other_id.clone(),
                    group: group.clone(),
                });
            }
        }

        state.endpoints.insert(
            self.peer_id.clone(),
            Endpoint {
                name: self.name.clone(),
                tx,
                groups: HashSet::new(),
            },
        );
        *inbox = Some(rx);

        debug!(peer = %self.peer_id, name = %self.name, "Memory endpoint attached");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut state = self.hub.state.write();
            if state.endpoints.remove(&self.peer_id).is_some() {
                for other in state.endpoints.values() {
                    let _ = other.tx.send(TransportEvent::Exit {
                        peer_id: self.peer_id.clone(),
                    });
                }
                debug!(peer = %self.peer_id, "Memory endpoint detached");
            }
        }
        *self.inbox.lock().await = None;
        Ok(())
    }

    async fn join(&self, group: &str) -> Result<()> {
        let mut state = self.hub.state.write();
        self.ensure_attached(&state)?;

        let newly = state
            .endpoints
            .get_mut(&self.peer_id)
            .is_some_and(|me| me.groups.insert(group.to_string()));
        if newly {
            for (other_id, other) in &state.endpoints {
                if other_id != &self.peer_id {
                    let _ = other.tx.send(TransportEvent::Join {
                        peer_id: self.peer_id.clone(),
                        group: group.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn whisper(&self, peer_id: &str, segments: Segments) -> Result<()> {
        let state = self.hub.state.read();
        self.ensure_attached(&state)?;

        let target = state
            .endpoints
            .get(peer_id)
            .ok_or_else(|| Error::transport(format!("unknown peer {}", peer_id)))?;
        target
            .tx
            .send(TransportEvent::Whisper {
                peer_id: self.peer_id.clone(),
                segments,
            })
            .map_err(|_| Error::transport(format!("peer {} inbox closed", peer_id)))
    }

    async fn shout(&self, group: &str, segments: Segments) -> Result<()> {
        let state = self.hub.state.read();
        self.ensure_attached(&state)?;

        for (other_id, other) in &state.endpoints {
            if other_id != &self.peer_id && other.groups.contains(group) {
                let _ = other.tx.send(TransportEvent::Shout {
                    peer_id: self.peer_id.clone(),
                    group: group.to_string(),
                    segments: segments.clone(),
                });
            }
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut inbox = self.inbox.lock().await;
        match inbox.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enter_both_ways() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a");
        let b = hub.endpoint("b");

        a.start().await.unwrap();
        b.start().await.unwrap();

        assert_eq!(
            a.next_event().await,
            Some(TransportEvent::Enter {
                peer_id: b.peer_id().to_string(),
                name: "b".into()
            })
        );
        assert_eq!(
            b.next_event().await,
            Some(TransportEvent::Enter {
                peer_id: a.peer_id().to_string(),
                name: "a".into()
            })
        );
    }

    #[tokio::test]
    async fn test_whisper_and_unknown_peer() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a");
        let b = hub.endpoint("b");
        a.start().await.unwrap();
        b.start().await.unwrap();
        let _ = b.next_event().await;

        a.whisper(b.peer_id(), vec![b"hi".to_vec()]).await.unwrap();
        assert_eq!(
            b.next_event().await,
            Some(TransportEvent::Whisper {
                peer_id: a.peer_id().to_string(),
                segments: vec![b"hi".to_vec()]
            })
        );

        let err = a.whisper("nobody", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn test_shout_reaches_group_members_only() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a");
        let b = hub.endpoint("b");
        let c = hub.endpoint("c");
        for t in [&a, &b, &c] {
            t.start().await.unwrap();
        }
        b.join("g").await.unwrap();

        a.shout("g", vec![b"x".to_vec()]).await.unwrap();

        // b: enter(a), enter(c), shout
        let mut got_shout = false;
        for _ in 0..3 {
            if let Some(TransportEvent::Shout { group, .. }) = b.next_event().await {
                assert_eq!(group, "g");
                got_shout = true;
            }
        }
        assert!(got_shout);

        // c only sees the enter of b, b's join and nothing else
        let mut kinds = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), c.next_event()).await
        {
            kinds.push(event.kind());
        }
        assert!(!kinds.contains(&"SHOUT"));
    }

    #[tokio::test]
    async fn test_stop_emits_exit_and_closes() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a");
        let b = hub.endpoint("b");
        a.start().await.unwrap();
        b.start().await.unwrap();
        let _ = a.next_event().await;

        b.stop().await.unwrap();
        assert_eq!(
            a.next_event().await,
            Some(TransportEvent::Exit {
                peer_id: b.peer_id().to_string()
            })
        );
        assert_eq!(b.next_event().await, None);
        assert!(b.whisper(a.peer_id(), vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_inject() {
        let hub = MemoryHub::new();
        let a = hub.endpoint("a");
        a.start().await.unwrap();

        hub.inject(
            a.peer_id(),
            TransportEvent::Whisper {
                peer_id: "ghost".into(),
                segments: vec![b"not json".to_vec()],
            },
        )
        .unwrap();

        match a.next_event().await {
            Some(TransportEvent::Whisper { peer_id, .. }) => assert_eq!(peer_id, "ghost"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(hub.inject("missing", TransportEvent::Exit { peer_id: "x".into() }).is_err());
    }
}
