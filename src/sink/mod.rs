//! Sink endpoint: reads from Apache Kafka and bridges records into AMQP
//! transfers toward a remote receiver.
//!
//! One endpoint per AMQP sending link. The link controller here parses
//! the address and filters, owns the sender handle, and runs a single
//! serialized task that dispatches records handed over by the consumer
//! worker, honoring receiver credit and the negotiated QoS.

mod channel;
mod offset_tracker;
mod worker;

pub use channel::{
    channel_name, endpoint_channel, ChannelMessage, ChannelPublisher, ChannelSubscriber,
};
pub use offset_tracker::OffsetTracker;
pub use worker::{ConsumerWorker, WorkerHandle};

use std::collections::VecDeque;
use std::sync::Arc;

use fe2o3_amqp_types::primitives::Value;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::amqp::{
    ErrorCondition, Link, LinkEvent, Qos, SenderAttach, SenderLink, AMQP_ERROR_NO_GROUPID,
    AMQP_ERROR_NO_PARTITION_FILTER, AMQP_ERROR_WRONG_FILTER, AMQP_ERROR_WRONG_OFFSET_FILTER,
    AMQP_ERROR_WRONG_PARTITION_FILTER, FILTER_OFFSET, FILTER_PARTITION,
};
use crate::config::BridgeConfig;
use crate::convert::{DefaultMessageConverter, MessageConverter};
use crate::endpoint::{BridgeEndpoint, CloseCallback, CloseNotifier};
use crate::error::{BridgeError, Result};
use crate::observability::observability;

/// Address separator between topic and consumer group id.
pub const GROUP_ID_MATCH: &str = "/group.id/";

/// Split `<topic>/group.id/<group>` into its parts.
pub fn parse_address(address: &str) -> std::result::Result<(String, String), ErrorCondition> {
    let index = address.find(GROUP_ID_MATCH).ok_or_else(|| {
        ErrorCondition::new(
            AMQP_ERROR_NO_GROUPID,
            "Mandatory group.id not specified in the address",
        )
    })?;
    let topic = &address[..index];
    let group_id = &address[index + GROUP_ID_MATCH.len()..];
    if topic.is_empty() || group_id.is_empty() {
        return Err(ErrorCondition::new(AMQP_ERROR_WRONG_FILTER, "Wrong filter"));
    }
    Ok((topic.to_string(), group_id.to_string()))
}

/// Format a link address for `topic` and `group_id`.
pub fn format_address(topic: &str, group_id: &str) -> String {
    format!("{topic}{GROUP_ID_MATCH}{group_id}")
}

/// Check the partition and offset filters, returning the first violation.
pub fn validate_filters(
    filters: &std::collections::HashMap<String, Value>,
) -> Option<ErrorCondition> {
    let partition = filters.get(FILTER_PARTITION);
    let offset = filters.get(FILTER_OFFSET);

    if let Some(value) = partition {
        if !matches!(value, Value::Int(_)) {
            return Some(ErrorCondition::new(
                AMQP_ERROR_WRONG_PARTITION_FILTER,
                "Wrong partition filter",
            ));
        }
    }
    if let Some(value) = offset {
        if !matches!(value, Value::Long(_)) {
            return Some(ErrorCondition::new(
                AMQP_ERROR_WRONG_OFFSET_FILTER,
                "Wrong offset filter",
            ));
        }
    }
    if partition.is_none() && offset.is_some() {
        return Some(ErrorCondition::new(
            AMQP_ERROR_NO_PARTITION_FILTER,
            "No partition filter specified",
        ));
    }
    if let Some(Value::Int(partition)) = partition {
        if *partition < 0 {
            return Some(ErrorCondition::new(AMQP_ERROR_WRONG_FILTER, "Wrong filter"));
        }
    }
    if let Some(Value::Long(offset)) = offset {
        if *offset < 0 {
            return Some(ErrorCondition::new(AMQP_ERROR_WRONG_FILTER, "Wrong filter"));
        }
    }
    None
}

fn extract_filters(
    filters: &std::collections::HashMap<String, Value>,
) -> (Option<i32>, Option<i64>) {
    let partition = match filters.get(FILTER_PARTITION) {
        Some(Value::Int(partition)) => Some(*partition),
        _ => None,
    };
    let offset = match filters.get(FILTER_OFFSET) {
        Some(Value::Long(offset)) => Some(*offset),
        _ => None,
    };
    (partition, offset)
}

/// Endpoint bridging one Kafka subscription to one AMQP sending link.
pub struct SinkEndpoint {
    config: Arc<BridgeConfig>,
    converter: Arc<dyn MessageConverter>,
    name: String,
    close_notifier: CloseNotifier,
    worker: Option<WorkerHandle>,
    shutdown: Arc<Notify>,
}

impl SinkEndpoint {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self {
            config,
            converter: Arc::new(DefaultMessageConverter),
            name: channel_name(),
            close_notifier: CloseNotifier::default(),
            worker: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Unique channel and store name of this endpoint.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire an already validated link to its worker and channel and start
    /// the endpoint task. `handle` builds the parts from the link address;
    /// tests drive this directly with a detached worker handle.
    pub fn attach(
        &mut self,
        sender: Box<dyn SenderLink>,
        qos: Qos,
        subscriber: ChannelSubscriber,
        worker: WorkerHandle,
        tracker: Arc<Mutex<OffsetTracker>>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut sender = sender;
        sender.subscribe_events(events_tx);
        self.worker = Some(worker.clone());
        observability().record_endpoint_opened();

        let task = EndpointTask {
            sender,
            qos,
            subscriber,
            worker,
            tracker,
            converter: Arc::clone(&self.converter),
            deferred: VecDeque::new(),
            close_notifier: self.close_notifier.clone(),
            closed: false,
        };
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(task.run(events_rx, shutdown));
    }

    /// Reject the attach: close the sender with `condition` and raise the
    /// close event. No worker is started.
    fn reject(&mut self, mut sender: Box<dyn SenderLink>, condition: ErrorCondition) {
        info!(endpoint = %self.name, symbol = %condition.symbol, "local detach");
        observability().record_endpoint_error();
        sender.close(Some(condition));
        self.close_notifier.fire();
    }
}

impl BridgeEndpoint for SinkEndpoint {
    fn open(&mut self) {}

    fn handle(&mut self, link: Link) -> Result<()> {
        let attach = match link {
            Link::Sender(attach) => attach,
            Link::Receiver(_) => return Err(BridgeError::InvalidLinkRole),
        };
        let SenderAttach {
            address,
            filters,
            qos,
            sender,
        } = attach;

        let (topic, group_id) = match parse_address(&address) {
            Ok(parsed) => parsed,
            Err(condition) => {
                self.reject(sender, condition);
                return Ok(());
            }
        };
        if let Some(condition) = validate_filters(&filters) {
            self.reject(sender, condition);
            return Ok(());
        }
        let (partition, offset) = extract_filters(&filters);
        info!(
            endpoint = %self.name,
            %topic,
            %group_id,
            ?partition,
            ?offset,
            ?qos,
            "sink link attached"
        );

        let tracker = Arc::new(Mutex::new(OffsetTracker::new(&topic)));
        let (publisher, subscriber) = endpoint_channel(self.name.clone());
        // Unsettled links commit only what dispositions have confirmed.
        let commit_from_dispositions = qos == Qos::AtLeastOnce;
        let worker = ConsumerWorker::spawn(
            &self.config,
            &group_id,
            &topic,
            partition,
            offset,
            publisher,
            commit_from_dispositions.then(|| Arc::clone(&tracker)),
        )?;
        self.attach(sender, qos, subscriber, worker, tracker);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(worker) = &self.worker {
            worker.shutdown();
        }
        self.shutdown.notify_one();
    }

    fn on_close(&mut self, callback: CloseCallback) {
        self.close_notifier.set(callback);
    }
}

/// The serialized endpoint loop. Sole owner of the sender handle and the
/// deferred queue; sole mutator of the offset tracker.
struct EndpointTask {
    sender: Box<dyn SenderLink>,
    qos: Qos,
    subscriber: ChannelSubscriber,
    worker: WorkerHandle,
    tracker: Arc<Mutex<OffsetTracker>>,
    converter: Arc<dyn MessageConverter>,
    deferred: VecDeque<String>,
    close_notifier: CloseNotifier,
    closed: bool,
}

impl EndpointTask {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    self.close("local close");
                    break;
                }
                event = events.recv() => match event {
                    Some(LinkEvent::Delivered { tag, outcome }) => {
                        observability().record_delivery();
                        if let Some((partition, offset)) = self.tracker.lock().delivered(&tag) {
                            debug!(
                                endpoint = %self.subscriber.name(),
                                %tag,
                                partition,
                                offset,
                                ?outcome,
                                "delivery settled"
                            );
                        }
                    }
                    Some(LinkEvent::CreditReplenished) => self.drain_deferred(),
                    Some(LinkEvent::RemoteDetach) | None => {
                        info!(endpoint = %self.subscriber.name(), "remote detached");
                        self.sender.close(None);
                        self.close("remote detach");
                        break;
                    }
                },
                message = self.subscriber.recv() => match message {
                    Some(ChannelMessage::Send { token }) => self.on_send(token),
                    Some(ChannelMessage::Error { symbol, description }) => {
                        info!(
                            endpoint = %self.subscriber.name(),
                            %symbol,
                            %description,
                            "local detach"
                        );
                        observability().record_endpoint_error();
                        self.sender
                            .close(Some(ErrorCondition::new(symbol, description)));
                        self.close("worker error");
                        break;
                    }
                    None => {
                        self.close("worker exited");
                        break;
                    }
                },
            }
        }
    }

    fn on_send(&mut self, token: String) {
        if self.sender.send_queue_full() || !self.deferred.is_empty() {
            // No credit on the receiver side (or older tokens are still
            // parked): queue the token and pause the worker until the send
            // queue drains.
            debug!(endpoint = %self.subscriber.name(), %token, "no credit, deferring");
            observability().record_deferred();
            self.deferred.push_back(token);
            self.worker.pause();
            return;
        }
        self.dispatch(token);
    }

    fn dispatch(&mut self, token: String) {
        let Some(envelope) = self.subscriber.take(&token) else {
            debug!(endpoint = %self.subscriber.name(), %token, "stale token, dropping");
            return;
        };
        let message = match self.converter.to_amqp(&envelope) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    endpoint = %self.subscriber.name(),
                    offset = envelope.offset,
                    %err,
                    "conversion failed, dropping record"
                );
                return;
            }
        };
        match self.qos {
            Qos::AtMostOnce => {
                if let Err(err) = self.sender.send(&token, message, true) {
                    warn!(endpoint = %self.subscriber.name(), %token, %err, "send failed");
                    return;
                }
            }
            Qos::AtLeastOnce => {
                // Track before sending so the disposition can never race
                // past the bookkeeping.
                self.tracker.lock().track(token.as_str(), &envelope);
                debug!(
                    endpoint = %self.subscriber.name(),
                    %token,
                    topic = %envelope.topic,
                    partition = envelope.partition,
                    offset = envelope.offset,
                    "tracked"
                );
                if let Err(err) = self.sender.send(&token, message, false) {
                    warn!(endpoint = %self.subscriber.name(), %token, %err, "send failed");
                    return;
                }
            }
        }
        observability().record_transfer();
    }

    /// Credit is back: flush the deferred queue in order, then resume the
    /// worker. Stops early if credit runs out again.
    fn drain_deferred(&mut self) {
        debug!(
            endpoint = %self.subscriber.name(),
            deferred = self.deferred.len(),
            "credit available"
        );
        while !self.deferred.is_empty() {
            if self.sender.send_queue_full() {
                return;
            }
            if let Some(token) = self.deferred.pop_front() {
                self.dispatch(token);
            }
        }
        self.worker.resume();
    }

    fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(endpoint = %self.subscriber.name(), reason, "closing sink endpoint");
        self.worker.shutdown();
        self.deferred.clear();
        self.subscriber.clear();
        self.tracker.lock().clear();
        observability().record_endpoint_closed();
        self.close_notifier.fire();
    }
}
