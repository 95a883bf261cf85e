//! Message model and validating builder
//!
//! A [`Message`] is an immutable value: it can only be produced by
//! [`MessageBuilder::build`] or by decoding an inbound frame, so a partially
//! constructed message is never observable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Structured message payload (string → arbitrary JSON value)
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Key suffix of a successful reply
pub const REPLY_SUFFIX: &str = ".reply";

/// Key suffix of a failure reply
pub const ERROR_SUFFIX: &str = ".error";

// ─────────────────────────────────────────────────────────────────
// Message Type
// ─────────────────────────────────────────────────────────────────

/// Delivery mode of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    /// Unicast to a single addressed peer
    Whisper,
    /// Multicast to every member of the joined group
    Shout,
}

impl MsgType {
    /// Wire name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Whisper => "whisper",
            MsgType::Shout => "shout",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MsgType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "whisper" => Ok(MsgType::Whisper),
            "shout" => Ok(MsgType::Shout),
            other => Err(Error::field_invalid(
                "msg_type",
                format!("invalid msg_type '{}', must be one of: whisper, shout", other),
            )),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Message
// ─────────────────────────────────────────────────────────────────

/// An immutable, fully formed peer message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) sender_id: String,
    pub(crate) msg_type: MsgType,
    pub(crate) req_id: String,
    pub(crate) key: String,
    pub(crate) payload: Payload,
    pub(crate) binary_blob: Option<Vec<u8>>,
    pub(crate) destination: Option<String>,
    pub(crate) received_by: Option<String>,
}

impl Message {
    /// Identifier of the peer that built the message
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Correlation id
    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    /// Routing key
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Look up a single payload field
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }

    pub fn binary_blob(&self) -> Option<&[u8]> {
        self.binary_blob.as_deref()
    }

    /// Whisper target (always `None` for shouts)
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Peer that received this message (inbound messages only)
    pub fn received_by(&self) -> Option<&str> {
        self.received_by.as_deref()
    }

    pub fn is_whisper(&self) -> bool {
        self.msg_type == MsgType::Whisper
    }

    /// Whether this message answers an earlier request
    pub fn is_reply(&self) -> bool {
        is_reply_key(&self.key)
    }

    /// Whether this message is a failure reply
    pub fn is_error_reply(&self) -> bool {
        self.key.ends_with(ERROR_SUFFIX)
    }

    /// Routing key of the success reply to this message
    pub fn reply_key(&self) -> String {
        format!("{}{}", self.key, REPLY_SUFFIX)
    }

    /// Routing key of the failure reply to this message
    pub fn error_key(&self) -> String {
        format!("{}{}", self.key, ERROR_SUFFIX)
    }

    /// Routing key of the request a reply answers
    pub fn request_key(&self) -> &str {
        self.key
            .strip_suffix(REPLY_SUFFIX)
            .or_else(|| self.key.strip_suffix(ERROR_SUFFIX))
            .unwrap_or(&self.key)
    }

    /// Builder for a reply whisper back to the sender, same correlation id
    pub fn reply_builder(&self, own_id: impl Into<String>) -> MessageBuilder {
        MessageBuilder::new(own_id)
            .with_type(MsgType::Whisper)
            .with_req_id(self.req_id.clone())
            .with_key(self.reply_key())
            .with_destination(self.sender_id.clone())
    }
}

/// Whether a routing key names a reply
pub fn is_reply_key(key: &str) -> bool {
    key.ends_with(REPLY_SUFFIX) || key.ends_with(ERROR_SUFFIX)
}

/// Check a routing key against the dotted-namespace convention
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::field_invalid("key", "key must not be empty"));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(Error::field_invalid(
            "key",
            format!("key '{}' must not contain whitespace", key),
        ));
    }
    if key.split('.').any(str::is_empty) {
        return Err(Error::field_invalid(
            "key",
            format!("key '{}' has an empty namespace segment", key),
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────

/// Staging structure that validates and freezes into a [`Message`]
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    sender_id: String,
    msg_type: Option<MsgType>,
    req_id: Option<String>,
    key: Option<String>,
    payload: Payload,
    binary_blob: Option<Vec<u8>>,
    destination: Option<String>,
}

impl MessageBuilder {
    /// Start a message sent by `sender_id`
    pub fn new(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, msg_type: MsgType) -> Self {
        self.msg_type = Some(msg_type);
        self
    }

    /// Set the type from its wire name; anything but whisper/shout fails
    pub fn with_type_name(self, name: &str) -> Result<Self> {
        let msg_type = name.parse()?;
        Ok(self.with_type(msg_type))
    }

    pub fn with_req_id(mut self, req_id: impl Into<String>) -> Self {
        self.req_id = Some(req_id.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Replace the whole payload
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Insert a single payload field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    pub fn with_binary_blob(mut self, blob: impl Into<Vec<u8>>) -> Self {
        self.binary_blob = Some(blob.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Validate and freeze the message
    pub fn build(self) -> Result<Message> {
        let msg_type = self
            .msg_type
            .ok_or_else(|| Error::field_invalid("msg_type", "msg_type is required"))?;

        let key = self
            .key
            .ok_or_else(|| Error::field_invalid("key", "key is required"))?;
        validate_key(&key)?;

        if self.sender_id.is_empty() {
            return Err(Error::field_invalid("sender_id", "sender_id must not be empty"));
        }

        let destination = match msg_type {
            MsgType::Whisper => match self.destination {
                Some(dest) if !dest.is_empty() => Some(dest),
                _ => {
                    return Err(Error::field_invalid(
                        "destination",
                        "whisper requires a destination",
                    ))
                }
            },
            MsgType::Shout => None,
        };

        let req_id = match self.req_id {
            Some(id) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };

        Ok(Message {
            sender_id: self.sender_id,
            msg_type,
            req_id,
            key,
            payload: self.payload,
            binary_blob: self.binary_blob,
            destination,
            received_by: None,
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_without_type_fails() {
        let err = MessageBuilder::new("node-a").with_key("test.key").build().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("msg_type"));
    }

    #[test]
    fn test_build_without_key_fails() {
        let err = MessageBuilder::new("node-a")
            .with_type(MsgType::Shout)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_whisper_requires_destination() {
        let err = MessageBuilder::new("node-a")
            .with_type(MsgType::Whisper)
            .with_key("perf.echo")
            .build()
            .unwrap_err();
        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("destination")),
            other => panic!("Expected Validation, got {:?}", other),
        }

        let err = MessageBuilder::new("node-a")
            .with_type(MsgType::Whisper)
            .with_key("perf.echo")
            .with_destination("")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_build_generates_req_id() {
        let a = MessageBuilder::new("node-a")
            .with_type(MsgType::Shout)
            .with_key("peer.status")
            .build()
            .unwrap();
        let b = MessageBuilder::new("node-a")
            .with_type(MsgType::Shout)
            .with_key("peer.status")
            .build()
            .unwrap();

        assert!(Uuid::parse_str(a.req_id()).is_ok());
        assert_ne!(a.req_id(), b.req_id());
        assert!(a.payload().is_empty());
        assert!(a.binary_blob().is_none());
        assert!(a.received_by().is_none());
    }

    #[test]
    fn test_explicit_fields_kept() {
        let msg = MessageBuilder::new("node-a")
            .with_type(MsgType::Whisper)
            .with_req_id("req-001")
            .with_key("camera.expose")
            .with_field("exposure", 1.5)
            .with_binary_blob(vec![0u8, 1, 2])
            .with_destination("node-b")
            .build()
            .unwrap();

        assert_eq!(msg.sender_id(), "node-a");
        assert_eq!(msg.req_id(), "req-001");
        assert_eq!(msg.key(), "camera.expose");
        assert_eq!(msg.field("exposure"), Some(&json!(1.5)));
        assert_eq!(msg.binary_blob(), Some(&[0u8, 1, 2][..]));
        assert_eq!(msg.destination(), Some("node-b"));
    }

    #[test]
    fn test_shout_drops_destination() {
        let msg = MessageBuilder::new("node-a")
            .with_type(MsgType::Shout)
            .with_key("peer.status")
            .with_destination("node-b")
            .build()
            .unwrap();
        assert!(msg.destination().is_none());
    }

    #[test]
    fn test_with_type_name() {
        assert!(MessageBuilder::new("a").with_type_name("shout").is_ok());
        assert!(MessageBuilder::new("a").with_type_name("whisper").is_ok());

        let err = MessageBuilder::new("a").with_type_name("broadcast").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("peer.status").is_ok());
        assert!(validate_key("status").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("peer..status").is_err());
        assert!(validate_key(".peer").is_err());
        assert!(validate_key("peer status").is_err());
    }

    #[test]
    fn test_empty_sender_rejected() {
        let err = MessageBuilder::new("")
            .with_type(MsgType::Shout)
            .with_key("peer.status")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("sender_id"));
    }

    #[test]
    fn test_reply_builder() {
        let request = MessageBuilder::new("node-a")
            .with_type(MsgType::Whisper)
            .with_req_id("req-7")
            .with_key("perf.echo")
            .with_destination("node-b")
            .build()
            .unwrap();

        let reply = request
            .reply_builder("node-b")
            .with_field("echoed", true)
            .build()
            .unwrap();

        assert!(reply.is_whisper());
        assert!(reply.is_reply());
        assert!(!reply.is_error_reply());
        assert_eq!(reply.key(), "perf.echo.reply");
        assert_eq!(reply.request_key(), "perf.echo");
        assert_eq!(reply.req_id(), "req-7");
        assert_eq!(reply.destination(), Some("node-a"));
        assert_eq!(reply.sender_id(), "node-b");
    }

    #[test]
    fn test_msg_type_serde() {
        assert_eq!(serde_json::to_string(&MsgType::Whisper).unwrap(), "\"whisper\"");
        let parsed: MsgType = serde_json::from_str("\"shout\"").unwrap();
        assert_eq!(parsed, MsgType::Shout);
    }
}
