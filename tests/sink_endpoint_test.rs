//! Sink endpoint behavior: dispatch, QoS, credit-based flow control and
//! the close cascade, driven through a mock sender link and the endpoint
//! channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ambridge::amqp::{
    AMQP_ERROR_NO_GROUPID, AMQP_ERROR_NO_PARTITION_FILTER, AMQP_ERROR_PARTITIONS_NOT_EXISTS,
    FILTER_OFFSET,
};
use ambridge::sink::{channel_name, endpoint_channel, ChannelPublisher, OffsetTracker};
use ambridge::{
    AmqpMessage, BridgeConfig, BridgeEndpoint, DeliveryOutcome, ErrorCondition, Link, LinkEvent,
    Qos, RecordEnvelope, SenderAttach, SenderLink, SinkEndpoint, WorkerHandle,
};
use bytes::Bytes;
use fe2o3_amqp_types::primitives::Value;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

// ---- Mock sender link ----

#[derive(Debug, Clone, PartialEq, Eq)]
struct SentTransfer {
    tag: String,
    settled: bool,
}

#[derive(Default)]
struct MockState {
    credit: usize,
    sent: Vec<SentTransfer>,
    closed: Vec<Option<ErrorCondition>>,
    events: Option<UnboundedSender<LinkEvent>>,
}

#[derive(Clone, Default)]
struct MockSender {
    state: Arc<Mutex<MockState>>,
}

impl MockSender {
    fn with_credit(credit: usize) -> Self {
        let mock = Self::default();
        mock.state.lock().credit = credit;
        mock
    }

    fn sent(&self) -> Vec<SentTransfer> {
        self.state.lock().sent.clone()
    }

    fn first_close(&self) -> Option<Option<ErrorCondition>> {
        self.state.lock().closed.first().cloned()
    }

    fn close_count(&self) -> usize {
        self.state.lock().closed.len()
    }

    fn events(&self) -> UnboundedSender<LinkEvent> {
        self.state.lock().events.clone().expect("events subscribed")
    }

    fn deliver(&self, tag: &str, outcome: DeliveryOutcome) {
        self.events()
            .send(LinkEvent::Delivered {
                tag: tag.to_string(),
                outcome,
            })
            .unwrap();
    }

    fn grant_credit(&self, credit: usize) {
        self.state.lock().credit = credit;
        self.events().send(LinkEvent::CreditReplenished).unwrap();
    }

    fn detach(&self) {
        self.events().send(LinkEvent::RemoteDetach).unwrap();
    }
}

impl SenderLink for MockSender {
    fn send_queue_full(&self) -> bool {
        self.state.lock().credit == 0
    }

    fn send(&mut self, tag: &str, _message: AmqpMessage, settled: bool) -> ambridge::Result<()> {
        let mut state = self.state.lock();
        state.credit = state.credit.saturating_sub(1);
        state.sent.push(SentTransfer {
            tag: tag.to_string(),
            settled,
        });
        Ok(())
    }

    fn close(&mut self, condition: Option<ErrorCondition>) {
        self.state.lock().closed.push(condition);
    }

    fn subscribe_events(&mut self, events: UnboundedSender<LinkEvent>) {
        self.state.lock().events = Some(events);
    }
}

// ---- Harness ----

struct Harness {
    endpoint: SinkEndpoint,
    mock: MockSender,
    publisher: ChannelPublisher,
    worker: WorkerHandle,
    tracker: Arc<Mutex<OffsetTracker>>,
    close_count: Arc<AtomicUsize>,
}

fn attach(qos: Qos, credit: usize) -> Harness {
    let mut endpoint = SinkEndpoint::new(Arc::new(BridgeConfig::default()));
    let close_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&close_count);
    endpoint.on_close(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let (publisher, subscriber) = endpoint_channel(channel_name());
    let tracker = Arc::new(Mutex::new(OffsetTracker::new("orders")));
    let worker = WorkerHandle::default();
    let mock = MockSender::with_credit(credit);
    endpoint.attach(
        Box::new(mock.clone()),
        qos,
        subscriber,
        worker.clone(),
        Arc::clone(&tracker),
    );
    Harness {
        endpoint,
        mock,
        publisher,
        worker,
        tracker,
        close_count,
    }
}

fn record(offset: i64) -> RecordEnvelope {
    RecordEnvelope::new("orders", 0, offset, Bytes::from_static(b"v"))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

// ---- Delivery and offset tracking ----

#[tokio::test]
async fn at_least_once_delivers_in_order_and_advances_frontier() {
    let harness = attach(Qos::AtLeastOnce, 5);
    let mut tokens = Vec::new();
    for offset in 0..3 {
        tokens.push(harness.publisher.publish_record(record(offset)).unwrap());
    }
    wait_until(|| harness.mock.sent().len() == 3).await;

    let sent = harness.mock.sent();
    let tags: Vec<&str> = sent.iter().map(|t| t.tag.as_str()).collect();
    let expected: Vec<&str> = tokens.iter().map(String::as_str).collect();
    assert_eq!(tags, expected, "transfer order follows offset order");
    assert!(sent.iter().all(|t| !t.settled));

    for tag in &tags {
        harness.mock.deliver(tag, DeliveryOutcome::Accepted);
    }
    wait_until(|| harness.tracker.lock().get_offsets() == HashMap::from([(0, 3)])).await;
}

#[tokio::test]
async fn out_of_order_dispositions_delay_the_commit_point() {
    let harness = attach(Qos::AtLeastOnce, 5);
    for offset in 0..3 {
        harness.publisher.publish_record(record(offset)).unwrap();
    }
    wait_until(|| harness.mock.sent().len() == 3).await;
    let tags = harness.mock.sent();

    harness.mock.deliver(&tags[1].tag, DeliveryOutcome::Accepted);
    harness.mock.deliver(&tags[2].tag, DeliveryOutcome::Accepted);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.tracker.lock().get_offsets(),
        HashMap::new(),
        "gap at offset 0 must block the commit point"
    );

    harness.mock.deliver(&tags[0].tag, DeliveryOutcome::Accepted);
    wait_until(|| harness.tracker.lock().get_offsets() == HashMap::from([(0, 3)])).await;
}

#[tokio::test]
async fn non_accepted_outcomes_still_count_as_delivered() {
    let harness = attach(Qos::AtLeastOnce, 5);
    for offset in 0..2 {
        harness.publisher.publish_record(record(offset)).unwrap();
    }
    wait_until(|| harness.mock.sent().len() == 2).await;
    let tags = harness.mock.sent();

    harness.mock.deliver(&tags[0].tag, DeliveryOutcome::Released);
    harness.mock.deliver(&tags[1].tag, DeliveryOutcome::Rejected);
    wait_until(|| harness.tracker.lock().get_offsets() == HashMap::from([(0, 2)])).await;
}

#[tokio::test]
async fn at_most_once_sends_settled_and_forgets() {
    let harness = attach(Qos::AtMostOnce, 5);
    harness.publisher.publish_record(record(7)).unwrap();
    wait_until(|| harness.mock.sent().len() == 1).await;

    let sent = harness.mock.sent();
    assert!(sent[0].settled);
    assert!(harness.tracker.lock().is_empty(), "no tracking for settled QoS");
    assert_eq!(harness.publisher.store_len(), 0, "record removed after send");
}

// ---- Flow control ----

#[tokio::test]
async fn credit_exhaustion_defers_and_pauses_then_drains_in_order() {
    let harness = attach(Qos::AtLeastOnce, 2);
    let mut tokens = Vec::new();
    for offset in 0..5 {
        tokens.push(harness.publisher.publish_record(record(offset)).unwrap());
    }
    wait_until(|| harness.mock.sent().len() == 2 && harness.worker.is_paused()).await;
    assert_eq!(
        harness.publisher.store_len(),
        3,
        "undispatched records stay in the keyed store"
    );

    harness.mock.grant_credit(5);
    wait_until(|| harness.mock.sent().len() == 5).await;
    wait_until(|| !harness.worker.is_paused()).await;

    let tags: Vec<&str> = harness.mock.sent().iter().map(|t| t.tag.as_str()).collect();
    let expected: Vec<&str> = tokens.iter().map(String::as_str).collect();
    assert_eq!(tags, expected, "deferred queue drains in FIFO order");
    assert_eq!(harness.publisher.store_len(), 0);
}

#[tokio::test]
async fn partial_drain_waits_for_more_credit() {
    let harness = attach(Qos::AtLeastOnce, 1);
    for offset in 0..4 {
        harness.publisher.publish_record(record(offset)).unwrap();
    }
    wait_until(|| harness.mock.sent().len() == 1 && harness.worker.is_paused()).await;

    harness.mock.grant_credit(2);
    wait_until(|| harness.mock.sent().len() == 3).await;
    assert!(harness.worker.is_paused(), "drain stopped mid-queue keeps the worker paused");

    harness.mock.grant_credit(2);
    wait_until(|| harness.mock.sent().len() == 4).await;
    wait_until(|| !harness.worker.is_paused()).await;
}

// ---- Attach validation ----

fn rejecting_endpoint() -> (SinkEndpoint, MockSender, Arc<AtomicUsize>) {
    let mut endpoint = SinkEndpoint::new(Arc::new(BridgeConfig::default()));
    let close_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&close_count);
    endpoint.on_close(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    (endpoint, MockSender::with_credit(10), close_count)
}

#[test]
fn missing_group_id_closes_the_link() {
    let (mut endpoint, mock, close_count) = rejecting_endpoint();
    let attach = SenderAttach {
        address: "orders".to_string(),
        filters: HashMap::new(),
        qos: Qos::AtLeastOnce,
        sender: Box::new(mock.clone()),
    };
    endpoint.handle(Link::Sender(attach)).unwrap();

    let condition = mock.first_close().unwrap().unwrap();
    assert_eq!(condition.symbol, AMQP_ERROR_NO_GROUPID);
    assert_eq!(close_count.load(Ordering::SeqCst), 1, "close callback fires once");
    assert!(mock.sent().is_empty());
}

#[test]
fn offset_filter_without_partition_closes_the_link() {
    let (mut endpoint, mock, close_count) = rejecting_endpoint();
    let attach = SenderAttach {
        address: "orders/group.id/g1".to_string(),
        filters: HashMap::from([(FILTER_OFFSET.to_string(), Value::Long(42))]),
        qos: Qos::AtLeastOnce,
        sender: Box::new(mock.clone()),
    };
    endpoint.handle(Link::Sender(attach)).unwrap();

    let condition = mock.first_close().unwrap().unwrap();
    assert_eq!(condition.symbol, AMQP_ERROR_NO_PARTITION_FILTER);
    assert_eq!(close_count.load(Ordering::SeqCst), 1);
}

#[test]
fn receiver_links_are_rejected() {
    let (mut endpoint, _mock, _close_count) = rejecting_endpoint();
    let (_tx, rx) = tokio::sync::mpsc::channel(1);
    let link = Link::Receiver(ambridge::amqp::ReceiverAttach {
        address: "orders".to_string(),
        qos: Qos::AtLeastOnce,
        deliveries: rx,
    });
    assert!(matches!(
        endpoint.handle(link),
        Err(ambridge::BridgeError::InvalidLinkRole)
    ));
}

// ---- Close cascade ----

#[tokio::test]
async fn worker_error_closes_link_and_endpoint() {
    let harness = attach(Qos::AtLeastOnce, 5);
    harness
        .publisher
        .publish_error(AMQP_ERROR_PARTITIONS_NOT_EXISTS, "topic orders does not exist");

    wait_until(|| harness.close_count.load(Ordering::SeqCst) == 1).await;
    let condition = harness.mock.first_close().unwrap().unwrap();
    assert_eq!(condition.symbol, AMQP_ERROR_PARTITIONS_NOT_EXISTS);
    assert!(harness.worker.is_shutdown());
}

#[tokio::test]
async fn remote_detach_tears_down_without_commit() {
    let harness = attach(Qos::AtLeastOnce, 5);
    harness.publisher.publish_record(record(0)).unwrap();
    wait_until(|| harness.mock.sent().len() == 1).await;

    harness.mock.detach();
    wait_until(|| harness.close_count.load(Ordering::SeqCst) == 1).await;
    assert!(harness.worker.is_shutdown());
    assert!(harness.tracker.lock().is_empty(), "in-flight state dropped");
    assert_eq!(harness.publisher.store_len(), 0);
}

#[tokio::test]
async fn local_close_is_idempotent() {
    let mut harness = attach(Qos::AtLeastOnce, 5);
    harness.endpoint.close();
    harness.endpoint.close();

    wait_until(|| harness.close_count.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.close_count.load(Ordering::SeqCst), 1);
    assert!(harness.worker.is_shutdown());
}

// ---- Channel invariants ----

#[tokio::test]
async fn tokens_are_unique_and_monotonic() {
    let harness = attach(Qos::AtMostOnce, 100);
    let mut tokens = Vec::new();
    for offset in 0..10 {
        tokens.push(harness.publisher.publish_record(record(offset)).unwrap());
    }
    let numeric: Vec<u64> = tokens.iter().map(|t| t.parse().unwrap()).collect();
    for pair in numeric.windows(2) {
        assert!(pair[0] < pair[1], "tokens must be strictly increasing");
    }
}

#[tokio::test]
async fn publishing_after_close_reports_endpoint_gone() {
    let mut harness = attach(Qos::AtLeastOnce, 5);
    harness.endpoint.close();
    wait_until(|| harness.close_count.load(Ordering::SeqCst) == 1).await;
    // The endpoint task is gone, so the publisher can no longer hand off.
    wait_until(|| harness.publisher.publish_record(record(0)).is_none()).await;
}
