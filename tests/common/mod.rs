//! Common test utilities and fixtures
//!
//! Coordinators built on one in-process hub, plus bounded waits on their
//! event channels.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use peercoms::coordinator::{Coordinator, CoordinatorConfig, CoordinatorEvent};
use peercoms::transport::{MemoryHub, MemoryTransport};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// Configuration with short timeouts for tests
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        pop_timeout: Duration::from_millis(50),
        request_timeout: Duration::from_millis(500),
        ..CoordinatorConfig::default()
    }
}

/// A coordinator and its transport endpoint
pub struct TestNode {
    pub coordinator: Coordinator,
    pub transport: Arc<MemoryTransport>,
}

impl TestNode {
    pub fn new(hub: &MemoryHub, name: &str, config: CoordinatorConfig) -> Self {
        let transport = Arc::new(hub.endpoint(name));
        let coordinator = Coordinator::new(transport.clone(), config);
        Self { coordinator, transport }
    }

    pub fn id(&self) -> String {
        self.coordinator.id().to_string()
    }
}

/// Receive events until `pred` matches one; panics after [`WAIT`]
pub async fn wait_for_event<F>(rx: &mut mpsc::Receiver<CoordinatorEvent>, mut pred: F) -> CoordinatorEvent
where
    F: FnMut(&CoordinatorEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) if pred(&event) => return event,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

/// Poll `cond` until it holds; panics after [`WAIT`]
pub async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until both nodes hold each other's listing
pub async fn wait_for_discovery(a: &TestNode, b: &TestNode) {
    let (a_id, b_id) = (a.id(), b.id());
    wait_until(|| {
        a.coordinator.capabilities().iter().any(|c| c.peer_id == b_id)
            && b.coordinator.capabilities().iter().any(|c| c.peer_id == a_id)
    })
    .await;
}
