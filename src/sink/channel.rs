//! Worker to endpoint handoff.
//!
//! A named single-producer/single-consumer queue plus a keyed store. The
//! worker publishes one token per record and parks the record itself in
//! the store; the endpoint task is the only consumer and removes records
//! as it dispatches them. Queue and store share the endpoint name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::RecordEnvelope;

/// Message carried from the consumer worker to the endpoint task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// A record was stored under `token` and is ready to send.
    Send { token: String },
    /// The worker hit a fatal condition; close the link with this error.
    Error { symbol: String, description: String },
}

/// Generate a process-unique endpoint channel name.
pub fn channel_name() -> String {
    format!("bridge.sink.{}", Uuid::new_v4())
}

/// Create the two halves of an endpoint channel.
pub fn endpoint_channel(name: impl Into<String>) -> (ChannelPublisher, ChannelSubscriber) {
    let name = name.into();
    let store = Arc::new(DashMap::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let publisher = ChannelPublisher {
        name: name.clone(),
        next_token: Arc::new(AtomicU64::new(0)),
        store: Arc::clone(&store),
        tx,
    };
    let subscriber = ChannelSubscriber { name, store, rx };
    (publisher, subscriber)
}

/// Worker-thread half: non-blocking publishes.
#[derive(Clone)]
pub struct ChannelPublisher {
    name: String,
    next_token: Arc<AtomicU64>,
    store: Arc<DashMap<String, RecordEnvelope>>,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl ChannelPublisher {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `envelope` under a fresh token and enqueue a send request.
    /// Returns the token, or `None` when the endpoint side is gone.
    pub fn publish_record(&self, envelope: RecordEnvelope) -> Option<String> {
        if self.tx.is_closed() {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed).to_string();
        self.store.insert(token.clone(), envelope);
        if self
            .tx
            .send(ChannelMessage::Send {
                token: token.clone(),
            })
            .is_err()
        {
            self.store.remove(&token);
            return None;
        }
        Some(token)
    }

    /// Enqueue a fatal worker error.
    pub fn publish_error(&self, symbol: impl Into<String>, description: impl Into<String>) {
        let _ = self.tx.send(ChannelMessage::Error {
            symbol: symbol.into(),
            description: description.into(),
        });
    }

    /// Number of records currently parked in the keyed store.
    pub fn store_len(&self) -> usize {
        self.store.len()
    }
}

/// Endpoint-task half: strictly serialized single consumer.
pub struct ChannelSubscriber {
    name: String,
    store: Arc<DashMap<String, RecordEnvelope>>,
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl ChannelSubscriber {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    /// Remove and return the record stored under `token`. `None` means the
    /// token is stale (already taken or cleared).
    pub fn take(&self, token: &str) -> Option<RecordEnvelope> {
        self.store.remove(token).map(|(_, envelope)| envelope)
    }

    /// Drop every stored record. Used on endpoint close.
    pub fn clear(&self) {
        self.store.clear();
    }
}
