//! Capability-announcement control messages
//!
//! Two routing keys are reserved and intercepted before handler dispatch:
//! `peer.keys` carries a capability listing, `key.announce` is a probe
//! asking the receiver for its listing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

use super::message::Payload;

/// Routing key of a capability listing
pub const PEER_KEYS: &str = "peer.keys";

/// Routing key of a capability probe
pub const KEY_ANNOUNCE: &str = "key.announce";

/// Correlation id used for capability listings
pub const LISTING_REQ_ID: &str = "peer-join";

/// Correlation id used for probes
pub const PROBE_REQ_ID: &str = "keys";

const LISTING_EVENT: &str = "peer_entered";

/// Whether a routing key is reserved for the announcement protocol
pub fn is_control_key(key: &str) -> bool {
    key == PEER_KEYS || key == KEY_ANNOUNCE
}

/// Payload of a `peer.keys` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityListing {
    #[serde(default = "listing_event")]
    pub event: String,
    pub from: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

fn listing_event() -> String {
    LISTING_EVENT.to_string()
}

impl CapabilityListing {
    pub fn new(from: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            event: listing_event(),
            from: from.into(),
            keys,
        }
    }

    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| Error::decode(format!("invalid capability listing: {}", e)))
    }
}

/// Payload of a `key.announce` probe
pub fn probe_payload() -> Payload {
    let mut payload = Payload::new();
    payload.insert("announce".to_string(), Value::String("key".to_string()));
    payload
}

pub fn is_probe(payload: &Payload) -> bool {
    payload.get("announce").and_then(Value::as_str) == Some("key")
}
