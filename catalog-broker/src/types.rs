use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Headers attached to a published message. Values are sent as UTF-8 bytes.
pub type MessageHeaders = HashMap<String, String>;

/// Transport-native position of a delivery, passed back verbatim on ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag {
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Original transport record, kept for adapter use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp_ms: Option<i64>,
}

impl RawRecord {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }
}

/// Message handed from an adapter to handler code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub body: Option<String>,
    pub routing_key: String,
    pub delivery_tag: DeliveryTag,
    pub raw: Option<RawRecord>,
}

impl BrokerMessage {
    /// Translates a transport record. Payloads are decoded as UTF-8 (lossy);
    /// a missing payload yields no body.
    pub fn from_record(record: RawRecord) -> Self {
        Self {
            body: record
                .payload
                .as_deref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
            routing_key: record.topic.clone(),
            delivery_tag: DeliveryTag {
                partition: record.partition,
                offset: record.offset,
            },
            raw: Some(record),
        }
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.raw.as_ref().and_then(|raw| raw.header(name))
    }
}

/// Payload accepted by `publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Bytes(Vec<u8>),
    Text(String),
}

impl MessageBody {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            MessageBody::Bytes(bytes) => bytes,
            MessageBody::Text(text) => text.into_bytes(),
        }
    }
}

impl From<Vec<u8>> for MessageBody {
    fn from(value: Vec<u8>) -> Self {
        MessageBody::Bytes(value)
    }
}

impl From<&[u8]> for MessageBody {
    fn from(value: &[u8]) -> Self {
        MessageBody::Bytes(value.to_vec())
    }
}

impl From<String> for MessageBody {
    fn from(value: String) -> Self {
        MessageBody::Text(value)
    }
}

impl From<&str> for MessageBody {
    fn from(value: &str) -> Self {
        MessageBody::Text(value.to_string())
    }
}

impl From<serde_json::Value> for MessageBody {
    fn from(value: serde_json::Value) -> Self {
        MessageBody::Text(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_without_payload_has_no_body() {
        let message = BrokerMessage::from_record(RawRecord {
            topic: "orders".into(),
            partition: 2,
            offset: 41,
            ..RawRecord::default()
        });

        assert_eq!(message.body, None);
        assert_eq!(message.routing_key, "orders");
        assert_eq!(
            message.delivery_tag,
            DeliveryTag {
                partition: 2,
                offset: 41
            }
        );
    }

    #[test]
    fn payload_is_decoded_and_headers_are_reachable() {
        let message = BrokerMessage::from_record(RawRecord {
            topic: "orders".into(),
            payload: Some(br#"{"id":1}"#.to_vec()),
            headers: vec![("trace-id".into(), b"abc".to_vec())],
            ..RawRecord::default()
        });

        assert_eq!(message.body.as_deref(), Some(r#"{"id":1}"#));
        assert_eq!(message.header("trace-id"), Some(&b"abc"[..]));
        assert_eq!(message.header("missing"), None);
    }

    #[test]
    fn json_bodies_are_sent_as_text() {
        let body: MessageBody = serde_json::json!({"id": 1}).into();
        assert_eq!(body.into_bytes(), br#"{"id":1}"#.to_vec());
    }
}
