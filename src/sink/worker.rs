//! Kafka consumer worker.
//!
//! One dedicated thread per sink endpoint owns the Kafka consumer and all
//! blocking I/O against it: subscribe or assign per the link filters,
//! poll, hand records to the endpoint channel, and commit frontiers the
//! offset tracker has cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::amqp::{AMQP_ERROR_INTERNAL, AMQP_ERROR_PARTITIONS_NOT_EXISTS};
use crate::config::{BridgeConfig, Deserializer};
use crate::error::Result;
use crate::observability::observability;
use crate::sink::channel::ChannelPublisher;
use crate::sink::offset_tracker::OffsetTracker;
use crate::types::{RecordEnvelope, RecordHeader};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct WorkerShared {
    paused: AtomicBool,
    shutdown: AtomicBool,
}

/// Group assignment state observed from rebalance callbacks.
#[derive(Debug, Default)]
struct RebalanceState {
    rebalanced: AtomicBool,
    empty_assignment: AtomicBool,
}

struct WorkerContext {
    state: Arc<RebalanceState>,
}

impl ClientContext for WorkerContext {}

impl ConsumerContext for WorkerContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(assignment) = rebalance {
            self.state
                .empty_assignment
                .store(assignment.count() == 0, Ordering::Release);
            self.state.rebalanced.store(true, Ordering::Release);
        }
    }
}

/// Control handle for a consumer worker. Safe to use from the endpoint
/// task while the worker is mid-poll; directives are observed between
/// polls.
#[derive(Debug, Clone, Default)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Suspend record delivery. The worker keeps polling for group
    /// liveness but pauses its assigned partitions.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Re-enable record delivery.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Ask the worker to exit. Idempotent; takes effect within one poll
    /// timeout.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

/// Blocking poll loop feeding one sink endpoint.
pub struct ConsumerWorker {
    consumer: BaseConsumer<WorkerContext>,
    topic: String,
    partition: Option<i32>,
    offset: Option<i64>,
    publisher: ChannelPublisher,
    /// Present only for at-least-once links.
    tracker: Option<Arc<Mutex<OffsetTracker>>>,
    rebalance: Arc<RebalanceState>,
    handle: WorkerHandle,
    key_deserializer: Deserializer,
    value_deserializer: Deserializer,
    poll_timeout: Duration,
    max_poll_records: usize,
    poll_failure_threshold: u32,
    commit_sync: bool,
}

impl ConsumerWorker {
    /// Build the Kafka consumer and start the worker thread.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: &BridgeConfig,
        group_id: &str,
        topic: &str,
        partition: Option<i32>,
        offset: Option<i64>,
        publisher: ChannelPublisher,
        tracker: Option<Arc<Mutex<OffsetTracker>>>,
    ) -> Result<WorkerHandle> {
        // At-least-once links must never auto-commit; the tracker decides
        // what is safe. Settled links follow the configured policy.
        let auto_commit = config.enable_auto_commit && tracker.is_none();
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", group_id)
            .set(
                "enable.auto.commit",
                if auto_commit { "true" } else { "false" },
            )
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.partition.eof", "false");
        let rebalance = Arc::new(RebalanceState::default());
        let context = WorkerContext {
            state: Arc::clone(&rebalance),
        };
        let consumer: BaseConsumer<WorkerContext> =
            client_config.create_with_context(context)?;

        let handle = WorkerHandle::default();
        let worker = ConsumerWorker {
            consumer,
            topic: topic.to_string(),
            partition,
            offset,
            publisher,
            tracker,
            rebalance,
            handle: handle.clone(),
            key_deserializer: config.key_deserializer,
            value_deserializer: config.value_deserializer,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            max_poll_records: config.max_poll_records.max(1),
            poll_failure_threshold: config.poll_failure_threshold.max(1),
            commit_sync: config.commit_sync,
        };
        std::thread::Builder::new()
            .name(format!("kafka-{}", worker.publisher.name()))
            .spawn(move || worker.run())?;
        Ok(handle)
    }

    fn run(self) {
        info!(
            endpoint = %self.publisher.name(),
            topic = %self.topic,
            partition = ?self.partition,
            offset = ?self.offset,
            "consumer worker started"
        );
        if let Err(description) = self.subscribe() {
            warn!(endpoint = %self.publisher.name(), %description, "subscription failed");
            self.publisher
                .publish_error(AMQP_ERROR_PARTITIONS_NOT_EXISTS, description);
            return;
        }

        let mut was_paused = false;
        let mut failures = 0u32;
        while !self.handle.is_shutdown() {
            if self.assignment_lost() {
                self.publisher.publish_error(
                    AMQP_ERROR_PARTITIONS_NOT_EXISTS,
                    format!("no partitions assigned for topic {}", self.topic),
                );
                return;
            }
            self.sync_pause_state(&mut was_paused);
            self.commit_delivered();

            let mut remaining = self.max_poll_records;
            let mut timeout = self.poll_timeout;
            while remaining > 0 && !self.handle.is_shutdown() {
                match self.consumer.poll(timeout) {
                    None => break,
                    Some(Ok(message)) => {
                        failures = 0;
                        if !self.forward(&message) {
                            return;
                        }
                        remaining -= 1;
                        timeout = Duration::ZERO;
                    }
                    Some(Err(err)) => {
                        failures += 1;
                        warn!(
                            endpoint = %self.publisher.name(),
                            %err,
                            failures,
                            "Kafka poll failed"
                        );
                        if failures >= self.poll_failure_threshold {
                            self.publisher.publish_error(
                                AMQP_ERROR_INTERNAL,
                                format!("Kafka poll failed repeatedly: {err}"),
                            );
                            return;
                        }
                        break;
                    }
                }
            }
        }

        // One last chance to commit frontiers settled during shutdown.
        self.commit_delivered();
        info!(endpoint = %self.publisher.name(), "consumer worker stopped");
    }

    /// Subscribe by group, or assign the filtered partition directly.
    fn subscribe(&self) -> std::result::Result<(), String> {
        let partition_count = self.verify_partitions()?;
        match self.partition {
            None => self
                .consumer
                .subscribe(&[&self.topic])
                .map_err(|e| e.to_string()),
            Some(partition) => {
                if partition >= partition_count {
                    return Err(format!(
                        "partition {partition} does not exist for topic {} ({partition_count} partitions)",
                        self.topic
                    ));
                }
                let start = match self.offset {
                    Some(offset) => Offset::Offset(offset),
                    None => Offset::Invalid,
                };
                let mut assignment = TopicPartitionList::new();
                assignment
                    .add_partition_offset(&self.topic, partition, start)
                    .map_err(|e| e.to_string())?;
                self.consumer.assign(&assignment).map_err(|e| e.to_string())
            }
        }
    }

    /// True for a group-subscribed link whose latest rebalance handed it
    /// zero partitions (more members than partitions, or the topic went
    /// away after the attach-time metadata check).
    fn assignment_lost(&self) -> bool {
        self.partition.is_none()
            && self.rebalance.rebalanced.load(Ordering::Acquire)
            && self.rebalance.empty_assignment.load(Ordering::Acquire)
    }

    fn verify_partitions(&self) -> std::result::Result<i32, String> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.topic), METADATA_TIMEOUT)
            .map_err(|e| format!("metadata fetch for topic {} failed: {e}", self.topic))?;
        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .ok_or_else(|| format!("topic {} does not exist", self.topic))?;
        if topic.partitions().is_empty() {
            return Err(format!("topic {} has no partitions", self.topic));
        }
        Ok(topic.partitions().len() as i32)
    }

    /// Apply a pause or resume directive observed since the last poll.
    fn sync_pause_state(&self, was_paused: &mut bool) {
        let paused = self.handle.is_paused();
        if paused == *was_paused {
            return;
        }
        let result = self.consumer.assignment().and_then(|assignment| {
            if paused {
                self.consumer.pause(&assignment)
            } else {
                self.consumer.resume(&assignment)
            }
        });
        match result {
            Ok(()) => {
                debug!(endpoint = %self.publisher.name(), paused, "pause state applied");
                *was_paused = paused;
            }
            Err(err) => warn!(endpoint = %self.publisher.name(), %err, "pause state change failed"),
        }
    }

    /// Publish one polled record. Returns false when the endpoint is gone.
    fn forward(&self, message: &BorrowedMessage<'_>) -> bool {
        let envelope = match self.decode(message) {
            Ok(envelope) => envelope,
            Err(reason) => {
                warn!(
                    endpoint = %self.publisher.name(),
                    offset = message.offset(),
                    %reason,
                    "dropping undecodable record"
                );
                return true;
            }
        };
        match self.publisher.publish_record(envelope) {
            Some(token) => {
                debug!(
                    endpoint = %self.publisher.name(),
                    token = %token,
                    partition = message.partition(),
                    offset = message.offset(),
                    "record handed off"
                );
                observability().record_poll(1, message.payload().map(<[u8]>::len).unwrap_or(0));
                true
            }
            None => {
                self.handle.shutdown();
                false
            }
        }
    }

    fn decode(&self, message: &BorrowedMessage<'_>) -> std::result::Result<RecordEnvelope, String> {
        let key = match (message.key(), self.key_deserializer) {
            (None, _) => None,
            (Some(key), Deserializer::Utf8String) => Some(
                std::str::from_utf8(key)
                    .map_err(|e| format!("record key is not UTF-8: {e}"))?
                    .to_string(),
            ),
            (Some(key), Deserializer::Bytes) => Some(String::from_utf8_lossy(key).into_owned()),
        };
        let payload = message.payload().unwrap_or_default();
        if self.value_deserializer == Deserializer::Utf8String {
            std::str::from_utf8(payload).map_err(|e| format!("record value is not UTF-8: {e}"))?;
        }
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| RecordHeader {
                        key: header.key.to_string(),
                        value: header.value.unwrap_or_default().to_vec(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(RecordEnvelope {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key,
            value: bytes::Bytes::copy_from_slice(payload),
            headers,
        })
    }

    /// Commit any frontier the tracker has advanced since the last pass.
    fn commit_delivered(&self) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let offsets = tracker.lock().get_offsets();
        if offsets.is_empty() {
            return;
        }
        let mut assignment = TopicPartitionList::new();
        for (&partition, &next) in &offsets {
            if let Err(err) =
                assignment.add_partition_offset(&self.topic, partition, Offset::Offset(next))
            {
                warn!(endpoint = %self.publisher.name(), partition, %err, "skipping commit entry");
            }
        }
        let mode = if self.commit_sync {
            CommitMode::Sync
        } else {
            CommitMode::Async
        };
        match self.consumer.commit(&assignment, mode) {
            Ok(()) => {
                observability().record_commit(offsets.len());
                let mut tracker = tracker.lock();
                for (partition, next) in offsets {
                    tracker.commit(partition, next);
                    debug!(
                        endpoint = %self.publisher.name(),
                        partition,
                        offset = next,
                        "offset committed"
                    );
                }
            }
            Err(err) => {
                // Offsets stay pending; the next pass retries the frontier.
                warn!(endpoint = %self.publisher.name(), %err, "offset commit failed");
            }
        }
    }
}
