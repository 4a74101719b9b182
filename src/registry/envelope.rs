//! Envelope delivered to subscribers
//!
//! An envelope is built once per broker message and shared by reference with
//! every interested subscriber during a fan-out pass.

use serde::Serialize;
use serde_json::Value;

use crate::routing::ChannelKey;

/// Unit of fan-out: a decoded payload tagged with its resolved channel key
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Channel the message was published on
    pub channel: String,
    /// Entity the message is about
    pub entity_id: String,
    /// Opaque JSON payload
    pub payload: Value,
}

/// Wire shape sent to live clients
#[derive(Serialize)]
struct ClientFrame<'a> {
    collection: &'a str,
    document: &'a str,
    data: &'a Value,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(channel: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            entity_id: entity_id.into(),
            payload,
        }
    }

    /// Build from a resolved channel key and decoded payload
    pub fn from_key(key: ChannelKey, payload: Value) -> Self {
        Self {
            channel: key.channel,
            entity_id: key.entity_id,
            payload,
        }
    }

    /// Encode as `{"collection": .., "document": .., "data": ..}`
    pub fn to_client_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&ClientFrame {
            collection: &self.channel,
            document: &self.entity_id,
            data: &self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_json_shape() {
        let envelope = Envelope::new("orders", "42", json!({"x": 1}));
        let encoded = envelope.to_client_json().unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(
            decoded,
            json!({"collection": "orders", "document": "42", "data": {"x": 1}})
        );
    }

    #[test]
    fn test_from_key() {
        let key = ChannelKey {
            channel: "shipments".into(),
            entity_id: "7".into(),
        };
        let envelope = Envelope::from_key(key, json!([1, 2]));

        assert_eq!(envelope.channel, "shipments");
        assert_eq!(envelope.entity_id, "7");
        assert_eq!(envelope.payload, json!([1, 2]));
    }
}
