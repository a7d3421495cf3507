//! Core types shared across the bridge.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Record read from a Kafka partition, on its way to an AMQP receiver.
///
/// Lives in the endpoint's keyed store under its delivery token until it
/// is either removed and sent, or dropped when the endpoint closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Record key, decoded as UTF-8 (Kafka string key convention).
    pub key: Option<String>,
    /// Payload, kept opaque.
    pub value: Bytes,
    /// Kafka-style headers.
    #[serde(default)]
    pub headers: Vec<RecordHeader>,
}

/// Kafka-style record header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordHeader {
    pub key: String,
    pub value: Vec<u8>,
}

impl RecordEnvelope {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: Bytes) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value,
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_headers(mut self, headers: Vec<RecordHeader>) -> Self {
        self.headers = headers;
        self
    }
}
