//! Handler contract and the per-key handler registry

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::HandlerError;
use crate::protocol::{Message, Payload};

/// What a handler returns: an optional result payload, or a failure
pub type HandlerResult = std::result::Result<Option<Payload>, HandlerError>;

/// Application callback bound to one routing key
///
/// `sender` is the transport id of the peer the message came from. A
/// `Some(payload)` result on a whisper is sent back as `<key>.reply`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, msg: &Message, sender: &str) -> HandlerResult;
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(&Message, &str) -> HandlerResult + Send + Sync,
{
    async fn invoke(&self, msg: &Message, sender: &str) -> HandlerResult {
        self(msg, sender)
    }
}

/// Registry of handlers by routing key
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to a key, replacing any previous one
    pub fn register(&self, key: impl Into<String>, handler: Arc<dyn Handler>) -> Option<Arc<dyn Handler>> {
        self.handlers.write().insert(key.into(), handler)
    }

    pub fn unregister(&self, key: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.write().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().get(key).cloned()
    }

    /// Registered keys, sorted; this is the advertised capability set
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageBuilder, MsgType};
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Handler for Upper {
        async fn invoke(&self, msg: &Message, _sender: &str) -> HandlerResult {
            let text = msg
                .field("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| HandlerError::InvalidPayload("missing text".into()))?;
            let mut out = Payload::new();
            out.insert("text".into(), json!(text.to_uppercase()));
            Ok(Some(out))
        }
    }

    fn message(text: Option<&str>) -> Message {
        let mut builder = MessageBuilder::new("p1")
            .with_type(MsgType::Shout)
            .with_key("text.upper");
        if let Some(text) = text {
            builder = builder.with_field("text", text);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_struct_handler() {
        let handler = Upper;
        let out = handler.invoke(&message(Some("abc")), "p1").await.unwrap().unwrap();
        assert_eq!(out["text"], json!("ABC"));

        let err = handler.invoke(&message(None), "p1").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_payload");
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |msg: &Message, sender: &str| -> HandlerResult {
            let mut out = Payload::new();
            out.insert("key".into(), json!(msg.key()));
            out.insert("sender".into(), json!(sender));
            Ok(Some(out))
        };
        let out = handler.invoke(&message(Some("x")), "peer-9").await.unwrap().unwrap();
        assert_eq!(out["sender"], json!("peer-9"));
    }

    #[test]
    fn test_registry_overwrites_and_sorts() {
        let registry = HandlerRegistry::new();
        assert!(registry.register("z.last", Arc::new(Upper)).is_none());
        registry.register("a.first", Arc::new(Upper));
        assert!(registry.register("z.last", Arc::new(Upper)).is_some());

        assert_eq!(registry.keys(), vec!["a.first", "z.last"]);
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister("a.first").is_some());
        assert!(registry.get("a.first").is_none());
        assert!(registry.get("missing").is_none());
    }
}
