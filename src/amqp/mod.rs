//! AMQP-side abstractions shared by the sink and source endpoints.
//!
//! Endpoints are written against [`SenderLink`] and the inbound delivery
//! stream rather than the transport directly; the fe2o3-amqp acceptor in
//! [`listener`] provides the production implementation.

pub mod listener;

use std::collections::HashMap;

use fe2o3_amqp_types::messaging::{Body, Message};
use fe2o3_amqp_types::primitives::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

/// Message shape exchanged with AMQP peers.
pub type AmqpMessage = Message<Body<Value>>;

/// Error symbol for an address without a `/group.id/` segment.
pub const AMQP_ERROR_NO_GROUPID: &str = "no-groupid";
/// Error symbol for a partition filter that is not an AMQP int.
pub const AMQP_ERROR_WRONG_PARTITION_FILTER: &str = "wrong-partition-filter";
/// Error symbol for an offset filter that is not an AMQP long.
pub const AMQP_ERROR_WRONG_OFFSET_FILTER: &str = "wrong-offset-filter";
/// Error symbol for an offset filter supplied without a partition filter.
pub const AMQP_ERROR_NO_PARTITION_FILTER: &str = "no-partition-filter";
/// Error symbol for otherwise invalid filters or addresses.
pub const AMQP_ERROR_WRONG_FILTER: &str = "wrong-filter";
/// Error symbol raised when the subscribed topic has no partitions.
pub const AMQP_ERROR_PARTITIONS_NOT_EXISTS: &str = "partitions-not-exists";
/// Standard AMQP symbol used for internal worker failures.
pub const AMQP_ERROR_INTERNAL: &str = "amqp:internal-error";

/// Filter symbol selecting a single partition.
pub const FILTER_PARTITION: &str = "partition";
/// Filter symbol selecting the starting offset; requires a partition.
pub const FILTER_OFFSET: &str = "offset";

/// Negotiated link quality of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    /// Settled transfers; the bridge forgets a record once sent.
    AtMostOnce,
    /// Unsettled transfers; dispositions drive offset commits.
    AtLeastOnce,
}

/// AMQP error condition attached to a link close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCondition {
    pub symbol: String,
    pub description: String,
}

impl ErrorCondition {
    pub fn new(symbol: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            description: description.into(),
        }
    }
}

/// Terminal disposition state reported by the remote receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    Rejected,
    Released,
    Modified,
}

/// Events a sender link pushes back onto the endpoint's serialized loop.
#[derive(Debug)]
pub enum LinkEvent {
    /// A previously sent unsettled transfer reached a terminal outcome.
    Delivered { tag: String, outcome: DeliveryOutcome },
    /// The send queue was full and has drained; deferred deliveries can go.
    CreditReplenished,
    /// The remote peer detached the link.
    RemoteDetach,
}

/// Handle the endpoint gives a link to receive [`LinkEvent`]s on.
pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Event-loop side of an AMQP sender.
///
/// All methods are non-blocking; dispositions and flow-control wakeups
/// arrive as [`LinkEvent`]s on the channel registered with
/// `subscribe_events`.
pub trait SenderLink: Send {
    /// True when the link has no room for another transfer.
    fn send_queue_full(&self) -> bool;

    /// Queue one transfer. With `settled` the delivery is fire-and-forget;
    /// otherwise a `Delivered` event for `tag` follows eventually.
    fn send(&mut self, tag: &str, message: AmqpMessage, settled: bool) -> Result<()>;

    /// Close the link, optionally with an error condition.
    fn close(&mut self, condition: Option<ErrorCondition>);

    /// Register the endpoint's event channel.
    fn subscribe_events(&mut self, events: LinkEventSender);
}

/// Attach of a link on which the bridge sends (the AMQP peer receives).
pub struct SenderAttach {
    /// Remote source address, `<topic>/group.id/<group>`.
    pub address: String,
    /// Remote source filter set, untyped.
    pub filters: HashMap<String, Value>,
    pub qos: Qos,
    pub sender: Box<dyn SenderLink>,
}

/// One message arriving on a receiving link, with its settlement responder.
pub struct InboundDelivery {
    pub message: AmqpMessage,
    /// Already settled by the sender (at-most-once).
    pub settled: bool,
    pub response: oneshot::Sender<DeliveryOutcome>,
}

/// Attach of a link on which the bridge receives (the AMQP peer sends).
pub struct ReceiverAttach {
    /// Remote target address, the Kafka topic.
    pub address: String,
    pub qos: Qos,
    pub deliveries: mpsc::Receiver<InboundDelivery>,
}

/// A link handed to an endpoint by the acceptor.
pub enum Link {
    Sender(SenderAttach),
    Receiver(ReceiverAttach),
}
