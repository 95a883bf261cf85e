//! Wire codec
//!
//! A message travels as two independent payload segments:
//!
//!   segment 0: JSON header {sender_id, msg_type, req_id, key, payload, has_blob}
//!   segment 1: raw blob bytes, present iff has_blob
//!
//! The blob is never embedded in the header.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::message::{Message, MsgType, Payload};

// ─────────────────────────────────────────────────────────────────
// Header
// ─────────────────────────────────────────────────────────────────

/// Segment 0 of an encoded message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireHeader {
    pub sender_id: String,
    pub msg_type: String,
    pub req_id: String,
    pub key: String,
    #[serde(default, alias = "json_data")]
    pub payload: Payload,
    #[serde(default)]
    pub has_blob: bool,
}

/// The segments an encoded message occupies on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrames {
    pub header: Vec<u8>,
    pub blob: Option<Vec<u8>>,
}

impl WireFrames {
    /// Flatten into the segment list handed to the transport
    pub fn into_segments(self) -> Vec<Vec<u8>> {
        let mut segments = Vec::with_capacity(2);
        segments.push(self.header);
        if let Some(blob) = self.blob {
            segments.push(blob);
        }
        segments
    }
}

// ─────────────────────────────────────────────────────────────────
// Encode / Decode
// ─────────────────────────────────────────────────────────────────

/// Encode a message into its header and optional blob segment
pub fn encode(msg: &Message) -> Result<WireFrames> {
    let header = WireHeader {
        sender_id: msg.sender_id.clone(),
        msg_type: msg.msg_type.as_str().to_string(),
        req_id: msg.req_id.clone(),
        key: msg.key.clone(),
        payload: msg.payload.clone(),
        has_blob: msg.binary_blob.is_some(),
    };

    let header = serde_json::to_vec(&header)
        .map_err(|e| Error::Internal(format!("Failed to encode header: {}", e)))?;

    Ok(WireFrames {
        header,
        blob: msg.binary_blob.clone(),
    })
}

/// Decode an inbound message received by `received_by`
pub fn decode(header: &[u8], blob: Option<&[u8]>, received_by: &str) -> Result<Message> {
    let header: WireHeader =
        serde_json::from_slice(header).map_err(|e| Error::decode(e.to_string()))?;

    require("sender_id", &header.sender_id)?;
    require("msg_type", &header.msg_type)?;
    require("req_id", &header.req_id)?;
    require("key", &header.key)?;

    let msg_type: MsgType = header
        .msg_type
        .parse()
        .map_err(|_| Error::decode(format!("unknown msg_type '{}'", header.msg_type)))?;

    if header.has_blob && blob.is_none() {
        return Err(Error::decode("header announces a blob but no blob segment was provided"));
    }

    let destination = match msg_type {
        MsgType::Whisper => Some(received_by.to_string()),
        MsgType::Shout => None,
    };

    Ok(Message {
        sender_id: header.sender_id,
        msg_type,
        req_id: header.req_id,
        key: header.key,
        payload: header.payload,
        binary_blob: blob.map(<[u8]>::to_vec),
        destination,
        received_by: Some(received_by.to_string()),
    })
}

/// Decode a transport segment list (header first, optional blob second)
pub fn decode_segments(segments: &[Vec<u8>], received_by: &str) -> Result<Message> {
    match segments {
        [] => Err(Error::decode("message has no header segment")),
        [header] => decode(header, None, received_by),
        [header, blob] => decode(header, Some(blob), received_by),
        _ => Err(Error::decode(format!("expected at most two segments, got {}", segments.len()))),
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::decode(format!("missing mandatory field '{}'", field)));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageBuilder;
    use serde_json::json;

    fn shout() -> Message {
        MessageBuilder::new("node-a")
            .with_type(MsgType::Shout)
            .with_req_id("req-001")
            .with_key("test.key")
            .with_field("hello", "zyre!")
            .with_field("nested", json!({"n": [1, 2, 3]}))
            .build()
            .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let msg = shout();
        let frames = encode(&msg).unwrap();
        assert!(frames.blob.is_none());

        let decoded = decode(&frames.header, None, "node-b").unwrap();
        assert_eq!(decoded.sender_id(), msg.sender_id());
        assert_eq!(decoded.msg_type(), msg.msg_type());
        assert_eq!(decoded.req_id(), msg.req_id());
        assert_eq!(decoded.key(), msg.key());
        assert_eq!(decoded.payload(), msg.payload());
        assert_eq!(decoded.received_by(), Some("node-b"));
        assert!(decoded.destination().is_none());
    }

    #[test]
    fn test_blob_is_separate_segment() {
        let blob: Vec<u8> = (0..=255).collect();
        let msg = MessageBuilder::new("node-a")
            .with_type(MsgType::Whisper)
            .with_key("camera.frame")
            .with_destination("node-b")
            .with_binary_blob(blob.clone())
            .build()
            .unwrap();

        let frames = encode(&msg).unwrap();
        let header: serde_json::Value = serde_json::from_slice(&frames.header).unwrap();
        assert_eq!(header["has_blob"], json!(true));
        assert_eq!(header.as_object().unwrap().len(), 6);

        let segments = frames.into_segments();
        assert_eq!(segments.len(), 2);

        let decoded = decode_segments(&segments, "node-b").unwrap();
        assert_eq!(decoded.binary_blob(), Some(blob.as_slice()));
        assert_eq!(decoded.destination(), Some("node-b"));
    }

    #[test]
    fn test_header_field_names() {
        let frames = encode(&shout()).unwrap();
        let header: serde_json::Value = serde_json::from_slice(&frames.header).unwrap();
        assert_eq!(header["sender_id"], json!("node-a"));
        assert_eq!(header["msg_type"], json!("shout"));
        assert_eq!(header["req_id"], json!("req-001"));
        assert_eq!(header["key"], json!("test.key"));
        assert_eq!(header["payload"]["hello"], json!("zyre!"));
        assert_eq!(header["has_blob"], json!(false));
    }

    #[test]
    fn test_decode_legacy_payload_name() {
        let header = json!({
            "sender_id": "node-a",
            "msg_type": "shout",
            "req_id": "r1",
            "key": "test.key",
            "json_data": {"hello": "zyre!"},
            "has_blob": false
        });
        let decoded = decode(header.to_string().as_bytes(), None, "node-b").unwrap();
        assert_eq!(decoded.field("hello"), Some(&json!("zyre!")));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode(b"not json", None, "node-b").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));

        let err = decode(b"[1,2,3]", None, "node-b").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let missing_key = json!({"sender_id": "a", "msg_type": "shout", "req_id": "r"});
        assert!(decode(missing_key.to_string().as_bytes(), None, "b").is_err());

        let empty_sender = json!({"sender_id": "", "msg_type": "shout", "req_id": "r", "key": "k"});
        assert!(decode(empty_sender.to_string().as_bytes(), None, "b").is_err());

        let bad_type = json!({"sender_id": "a", "msg_type": "yell", "req_id": "r", "key": "k"});
        let err = decode(bad_type.to_string().as_bytes(), None, "b").unwrap_err();
        assert!(err.to_string().contains("yell"));
    }

    #[test]
    fn test_decode_missing_announced_blob() {
        let header = json!({
            "sender_id": "a", "msg_type": "shout", "req_id": "r", "key": "k", "has_blob": true
        });
        let err = decode(header.to_string().as_bytes(), None, "b").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_decode_segment_count() {
        assert!(decode_segments(&[], "b").is_err());

        let msg = MessageBuilder::new("node-a")
            .with_type(MsgType::Whisper)
            .with_key("blob.key")
            .with_destination("node-b")
            .with_binary_blob(vec![1u8, 2, 3])
            .build()
            .unwrap();
        let mut segments = encode(&msg).unwrap().into_segments();
        assert_eq!(decode_segments(&segments, "node-b").unwrap().binary_blob(), Some(&[1u8, 2, 3][..]));

        segments.push(b"trailing".to_vec());
        let err = decode_segments(&segments, "node-b").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
        assert!(err.to_string().contains("got 3"));
    }
}
