//! Ambridge: AMQP 1.0 to Apache Kafka protocol bridge.
//!
//! AMQP peers attach links to the bridge and either publish records into
//! Kafka topics (source endpoints) or subscribe to Kafka topics as AMQP
//! receivers (sink endpoints), with credit-based flow control and
//! disposition-driven offset commits mediated in between.

pub mod amqp;
pub mod config;
pub mod convert;
pub mod endpoint;
pub mod error;
pub mod observability;
pub mod sink;
pub mod source;
pub mod types;

pub use amqp::{
    AmqpMessage, DeliveryOutcome, ErrorCondition, Link, LinkEvent, Qos, SenderAttach, SenderLink,
};
pub use config::BridgeConfig;
pub use convert::{DefaultMessageConverter, MessageConverter};
pub use endpoint::BridgeEndpoint;
pub use error::{BridgeError, Result};
pub use sink::{OffsetTracker, SinkEndpoint, WorkerHandle};
pub use source::SourceEndpoint;
pub use types::{RecordEnvelope, RecordHeader};
