//! Record to AMQP message conversion.
//!
//! Converters are pure; a conversion failure drops the one record (or
//! rejects the one delivery) and never tears an endpoint down.

use bytes::Bytes;
use fe2o3_amqp_types::messaging::{AmqpValue, ApplicationProperties, Body, Message};
use fe2o3_amqp_types::primitives::{Binary, SimpleValue, Value};

use crate::amqp::AmqpMessage;
use crate::error::{BridgeError, Result};
use crate::types::{RecordEnvelope, RecordHeader};

/// Application-property key carrying the source topic.
pub const PROP_TOPIC: &str = "x-opt-ambridge.topic";
/// Application-property key carrying the source partition.
pub const PROP_PARTITION: &str = "x-opt-ambridge.partition";
/// Application-property key carrying the source offset.
pub const PROP_OFFSET: &str = "x-opt-ambridge.offset";
/// Application-property key carrying the record key.
pub const PROP_KEY: &str = "x-opt-ambridge.key";

/// Two-way converter between record envelopes and AMQP messages.
pub trait MessageConverter: Send + Sync {
    /// Convert a polled record into the AMQP transfer payload.
    fn to_amqp(&self, record: &RecordEnvelope) -> Result<AmqpMessage>;

    /// Extract key, value and headers for a record to produce.
    fn to_kafka(&self, message: &AmqpMessage) -> Result<(Option<String>, Bytes, Vec<RecordHeader>)>;
}

/// Default converter: value as AMQP binary body, record coordinates as
/// `x-opt-ambridge.*` application properties, Kafka headers as further
/// application properties.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMessageConverter;

impl MessageConverter for DefaultMessageConverter {
    fn to_amqp(&self, record: &RecordEnvelope) -> Result<AmqpMessage> {
        let mut props = ApplicationProperties::builder()
            .insert(PROP_TOPIC, record.topic.as_str())
            .insert(PROP_PARTITION, record.partition)
            .insert(PROP_OFFSET, record.offset);
        if let Some(key) = &record.key {
            props = props.insert(PROP_KEY, key.as_str());
        }
        for header in &record.headers {
            props = props.insert(
                header.key.as_str(),
                SimpleValue::Binary(Binary::from(header.value.clone())),
            );
        }
        let message: AmqpMessage = Message::builder()
            .application_properties(props.build())
            .body(Body::Value(AmqpValue(Value::Binary(Binary::from(
                record.value.to_vec(),
            )))))
            .build();
        Ok(message)
    }

    fn to_kafka(&self, message: &AmqpMessage) -> Result<(Option<String>, Bytes, Vec<RecordHeader>)> {
        let value = match &message.body {
            Body::Value(AmqpValue(Value::Binary(bytes))) => {
                Bytes::copy_from_slice(bytes.as_ref())
            }
            Body::Value(AmqpValue(Value::String(text))) => Bytes::from(text.clone().into_bytes()),
            other => {
                return Err(BridgeError::Convert(format!(
                    "unsupported message body: {other:?}"
                )))
            }
        };

        let mut key = None;
        let mut headers = Vec::new();
        if let Some(props) = &message.application_properties {
            for (name, prop) in props.0.iter() {
                if name.as_str() == PROP_KEY {
                    if let SimpleValue::String(text) = prop {
                        key = Some(text.clone());
                    }
                    continue;
                }
                if name.starts_with("x-opt-ambridge.") {
                    continue;
                }
                headers.push(RecordHeader {
                    key: name.clone(),
                    value: simple_value_bytes(prop),
                });
            }
        }
        Ok((key, value, headers))
    }
}

fn simple_value_bytes(value: &SimpleValue) -> Vec<u8> {
    match value {
        SimpleValue::Binary(bytes) => bytes.as_ref().to_vec(),
        SimpleValue::String(text) => text.clone().into_bytes(),
        SimpleValue::Symbol(symbol) => symbol.to_string().into_bytes(),
        other => format!("{other:?}").into_bytes(),
    }
}
