//! Source endpoint: receives AMQP messages and writes them into Apache
//! Kafka.
//!
//! One endpoint per AMQP receiving link; the link address is the topic.
//! Each inbound delivery is produced individually and settled from the
//! produce result, so an unsettled sender gets at-least-once semantics.

use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::amqp::{DeliveryOutcome, InboundDelivery, Link, ReceiverAttach};
use crate::config::BridgeConfig;
use crate::convert::{DefaultMessageConverter, MessageConverter};
use crate::endpoint::{BridgeEndpoint, CloseCallback, CloseNotifier};
use crate::error::{BridgeError, Result};
use crate::observability::observability;

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint bridging one AMQP receiving link into one Kafka topic.
pub struct SourceEndpoint {
    config: Arc<BridgeConfig>,
    converter: Arc<dyn MessageConverter>,
    close_notifier: CloseNotifier,
    shutdown: Arc<Notify>,
}

impl SourceEndpoint {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self {
            config,
            converter: Arc::new(DefaultMessageConverter),
            close_notifier: CloseNotifier::default(),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

impl BridgeEndpoint for SourceEndpoint {
    fn open(&mut self) {}

    fn handle(&mut self, link: Link) -> Result<()> {
        let attach = match link {
            Link::Receiver(attach) => attach,
            Link::Sender(_) => return Err(BridgeError::InvalidLinkRole),
        };
        let ReceiverAttach {
            address,
            qos,
            deliveries,
        } = attach;
        let topic = address.trim_start_matches('/').to_string();
        info!(%topic, ?qos, "source link attached");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("message.timeout.ms", "30000")
            .create()?;

        observability().record_endpoint_opened();
        let task = SourceTask {
            topic,
            producer,
            converter: Arc::clone(&self.converter),
            close_notifier: self.close_notifier.clone(),
        };
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(task.run(deliveries, shutdown));
        Ok(())
    }

    fn close(&mut self) {
        self.shutdown.notify_one();
    }

    fn on_close(&mut self, callback: CloseCallback) {
        self.close_notifier.set(callback);
    }
}

struct SourceTask {
    topic: String,
    producer: FutureProducer,
    converter: Arc<dyn MessageConverter>,
    close_notifier: CloseNotifier,
}

impl SourceTask {
    async fn run(
        self,
        mut deliveries: tokio::sync::mpsc::Receiver<InboundDelivery>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.process(delivery).await,
                    None => {
                        info!(topic = %self.topic, "source link detached");
                        break;
                    }
                },
            }
        }
        observability().record_endpoint_closed();
        self.close_notifier.fire();
    }

    async fn process(&self, delivery: InboundDelivery) {
        let (key, value, headers) = match self.converter.to_kafka(&delivery.message) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(topic = %self.topic, %err, "rejecting unconvertible message");
                let _ = delivery.response.send(DeliveryOutcome::Rejected);
                return;
            }
        };

        let mut record: FutureRecord<'_, String, [u8]> =
            FutureRecord::to(&self.topic).payload(value.as_ref());
        if let Some(key) = &key {
            record = record.key(key);
        }
        if !headers.is_empty() {
            let mut owned = OwnedHeaders::new();
            for header in &headers {
                owned = owned.insert(Header {
                    key: &header.key,
                    value: Some(&header.value),
                });
            }
            record = record.headers(owned);
        }

        match self.producer.send(record, PRODUCE_TIMEOUT).await {
            Ok((partition, offset)) => {
                tracing::debug!(topic = %self.topic, partition, offset, "record produced");
                observability().record_produce(1, value.len());
                let _ = delivery.response.send(DeliveryOutcome::Accepted);
            }
            Err((err, _)) => {
                warn!(topic = %self.topic, %err, "produce failed");
                let _ = delivery.response.send(DeliveryOutcome::Rejected);
            }
        }
    }
}
