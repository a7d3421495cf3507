//! AMQP server socket and link acceptance.
//!
//! Accepts connections, sessions and links with the fe2o3-amqp acceptor
//! and maps every link onto a bridge endpoint: a link on which the peer
//! receives becomes a sink endpoint, a link on which the peer sends
//! becomes a source endpoint. This module is the only place that touches
//! the AMQP transport types; endpoints see [`SenderLink`] and inbound
//! delivery streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fe2o3_amqp::acceptor::{
    ConnectionAcceptor, LinkAcceptor, LinkEndpoint, ListenerConnectionHandle,
    ListenerSessionHandle, SessionAcceptor,
};
use fe2o3_amqp::link::delivery::Sendable;
use fe2o3_amqp::link::{Receiver as AmqpReceiver, Sender as AmqpSender};
use fe2o3_amqp_types::definitions::{AmqpError, Error as AmqpErrorDef, SenderSettleMode};
use fe2o3_amqp_types::messaging::{Body, FilterSet, Outcome};
use fe2o3_amqp_types::primitives::{Symbol, Value};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::amqp::{
    AmqpMessage, DeliveryOutcome, ErrorCondition, InboundDelivery, Link, LinkEvent,
    LinkEventSender, Qos, ReceiverAttach, SenderAttach, SenderLink,
};
use crate::config::BridgeConfig;
use crate::endpoint::BridgeEndpoint;
use crate::error::{BridgeError, Result};
use crate::sink::SinkEndpoint;
use crate::source::SourceEndpoint;

/// Accept AMQP connections on `config.amqp_addr` until the task is
/// cancelled.
pub async fn run(config: Arc<BridgeConfig>) -> Result<()> {
    let listener = TcpListener::bind(&config.amqp_addr).await?;
    info!("AMQP listening on {}", listener.local_addr()?);
    let connection_acceptor = Arc::new(ConnectionAcceptor::new("ambridge"));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(%err, "accept error");
                continue;
            }
        };
        let acceptor = Arc::clone(&connection_acceptor);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(connection) => handle_connection(connection, config).await,
                Err(err) => warn!(%peer, ?err, "AMQP handshake failed"),
            }
        });
    }
}

async fn handle_connection(mut connection: ListenerConnectionHandle, config: Arc<BridgeConfig>) {
    let session_acceptor = SessionAcceptor::new();
    while let Ok(session) = session_acceptor.accept(&mut connection).await {
        tokio::spawn(handle_session(session, Arc::clone(&config)));
    }
    debug!("AMQP connection ended");
}

async fn handle_session(mut session: ListenerSessionHandle, config: Arc<BridgeConfig>) {
    let link_acceptor = LinkAcceptor::new();
    loop {
        match link_acceptor.accept(&mut session).await {
            Ok(LinkEndpoint::Sender(sender)) => {
                tokio::spawn(handle_sender_link(sender, Arc::clone(&config)));
            }
            Ok(LinkEndpoint::Receiver(receiver)) => {
                tokio::spawn(handle_receiver_link(receiver, Arc::clone(&config)));
            }
            Err(err) => {
                debug!(?err, "AMQP session ended");
                break;
            }
        }
    }
}

/// The peer attached as a receiver: run a sink endpoint over this link.
async fn handle_sender_link(sender: AmqpSender, config: Arc<BridgeConfig>) {
    let (address, filters) = sender_source(&sender);
    let qos = match sender.settle_mode() {
        SenderSettleMode::Settled => Qos::AtMostOnce,
        _ => Qos::AtLeastOnce,
    };

    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let gate = CreditGate::new(config.credit_window);
    let link = Fe2o3SenderLink {
        jobs: jobs_tx,
        gate: gate.clone(),
    };
    tokio::spawn(run_sender_link(sender, jobs_rx, gate));

    let mut endpoint = SinkEndpoint::new(config);
    let name = endpoint.name().to_string();
    endpoint.on_close(Box::new(move || {
        info!(endpoint = %name, "sink endpoint closed");
    }));
    let attach = SenderAttach {
        address,
        filters,
        qos,
        sender: Box::new(link),
    };
    if let Err(err) = endpoint.handle(Link::Sender(attach)) {
        warn!(%err, "sink attach failed");
    }
}

/// The peer attached as a sender: run a source endpoint over this link.
async fn handle_receiver_link(mut receiver: AmqpReceiver, config: Arc<BridgeConfig>) {
    let address = receiver_target(&receiver);
    let (deliveries_tx, deliveries_rx) = mpsc::channel(64);

    let mut endpoint = SourceEndpoint::new(config);
    let topic = address.clone();
    endpoint.on_close(Box::new(move || {
        info!(%topic, "source endpoint closed");
    }));
    let attach = ReceiverAttach {
        address,
        qos: Qos::AtLeastOnce,
        deliveries: deliveries_rx,
    };
    if let Err(err) = endpoint.handle(Link::Receiver(attach)) {
        warn!(%err, "source attach failed");
        let _ = receiver.close().await;
        return;
    }

    loop {
        let delivery = match receiver.recv::<Body<Value>>().await {
            Ok(delivery) => delivery,
            Err(err) => {
                debug!(?err, "receiver link ended");
                break;
            }
        };
        let message = delivery.message().clone();
        let (response_tx, response_rx) = oneshot::channel();
        let inbound = InboundDelivery {
            message,
            settled: false,
            response: response_tx,
        };
        if deliveries_tx.send(inbound).await.is_err() {
            break;
        }
        match response_rx.await.unwrap_or(DeliveryOutcome::Released) {
            DeliveryOutcome::Accepted => {
                let _ = receiver.accept(&delivery).await;
            }
            DeliveryOutcome::Rejected => {
                let _ = receiver
                    .reject(
                        &delivery,
                        AmqpErrorDef::new(
                            AmqpError::InternalError,
                            Some("record could not be produced".to_string()),
                            None,
                        ),
                    )
                    .await;
            }
            DeliveryOutcome::Released | DeliveryOutcome::Modified => {
                let _ = receiver.release(&delivery).await;
            }
        }
    }
}

fn sender_source(sender: &AmqpSender) -> (String, HashMap<String, Value>) {
    match sender.source().as_ref() {
        Some(source) => (
            source.address.clone().unwrap_or_default(),
            convert_filters(source.filter.as_ref()),
        ),
        None => (String::new(), HashMap::new()),
    }
}

fn receiver_target(receiver: &AmqpReceiver) -> String {
    receiver
        .target()
        .as_ref()
        .and_then(|target| target.address.clone())
        .unwrap_or_default()
}

fn convert_filters(filter: Option<&FilterSet>) -> HashMap<String, Value> {
    let mut filters = HashMap::new();
    if let Some(set) = filter {
        for (symbol, value) in set.iter() {
            filters.insert(symbol.to_string(), value.clone());
        }
    }
    filters
}

/// In-flight transfer accounting standing in for receiver credit. The
/// endpoint defers deliveries while the window is exhausted and resumes
/// when it fully drains.
#[derive(Clone)]
struct CreditGate {
    in_flight: Arc<AtomicUsize>,
    window: usize,
    events: Arc<Mutex<Option<LinkEventSender>>>,
}

impl CreditGate {
    fn new(window: usize) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            window: window.max(1),
            events: Arc::new(Mutex::new(None)),
        }
    }

    fn full(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) >= self.window
    }

    fn charge(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one slot; wakes the endpoint when the window was full.
    fn settle_one(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if previous == self.window {
            self.emit(LinkEvent::CreditReplenished);
        }
    }

    fn emit(&self, event: LinkEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }
}

enum SendJob {
    Transfer {
        tag: String,
        message: AmqpMessage,
        settled: bool,
    },
    Close(Option<ErrorCondition>),
}

/// [`SenderLink`] implementation handing jobs to the task that owns the
/// fe2o3 sender.
struct Fe2o3SenderLink {
    jobs: mpsc::UnboundedSender<SendJob>,
    gate: CreditGate,
}

impl SenderLink for Fe2o3SenderLink {
    fn send_queue_full(&self) -> bool {
        self.gate.full()
    }

    fn send(&mut self, tag: &str, message: AmqpMessage, settled: bool) -> Result<()> {
        self.gate.charge();
        self.jobs
            .send(SendJob::Transfer {
                tag: tag.to_string(),
                message,
                settled,
            })
            .map_err(|_| BridgeError::Amqp("sender link task is gone".to_string()))
    }

    fn close(&mut self, condition: Option<ErrorCondition>) {
        let _ = self.jobs.send(SendJob::Close(condition));
    }

    fn subscribe_events(&mut self, events: LinkEventSender) {
        *self.gate.events.lock() = Some(events);
    }
}

enum CloseAction {
    Clean,
    WithError(ErrorCondition),
    Detached,
}

async fn run_sender_link(
    mut sender: AmqpSender,
    mut jobs: mpsc::UnboundedReceiver<SendJob>,
    gate: CreditGate,
) {
    let close = loop {
        tokio::select! {
            job = jobs.recv() => match job {
                None => break CloseAction::Clean,
                Some(SendJob::Close(condition)) => break match condition {
                    Some(condition) => CloseAction::WithError(condition),
                    None => CloseAction::Clean,
                },
                Some(SendJob::Transfer { tag, message, settled }) => {
                    let sendable = Sendable::builder()
                        .message(message)
                        .delivery_tag(tag.clone().into_bytes())
                        .settled(settled)
                        .build();
                    if settled {
                        if let Err(err) = sender.send(sendable).await {
                            warn!(%tag, ?err, "settled send failed");
                        }
                        gate.settle_one();
                    } else {
                        match sender.send_batchable(sendable).await {
                            Ok(outcome_fut) => {
                                let gate = gate.clone();
                                tokio::spawn(async move {
                                    let outcome = match outcome_fut.await {
                                        Ok(outcome) => map_outcome(&outcome),
                                        Err(err) => {
                                            warn!(%tag, ?err, "disposition wait failed");
                                            DeliveryOutcome::Released
                                        }
                                    };
                                    gate.emit(LinkEvent::Delivered { tag, outcome });
                                    gate.settle_one();
                                });
                            }
                            Err(err) => {
                                warn!(%tag, ?err, "unsettled send failed");
                                gate.settle_one();
                            }
                        }
                    }
                }
            },
            _ = sender.on_detach() => {
                gate.emit(LinkEvent::RemoteDetach);
                break CloseAction::Detached;
            }
        }
    };
    match close {
        CloseAction::WithError(condition) => {
            let error = AmqpErrorDef::new(
                fe2o3_amqp_types::definitions::ErrorCondition::Custom(Symbol::from(
                    condition.symbol.clone(),
                )),
                Some(condition.description),
                None,
            );
            let _ = sender.close_with_error(error).await;
        }
        CloseAction::Clean => {
            let _ = sender.close().await;
        }
        CloseAction::Detached => {}
    }
}

fn map_outcome(outcome: &Outcome) -> DeliveryOutcome {
    match outcome {
        Outcome::Accepted(_) => DeliveryOutcome::Accepted,
        Outcome::Rejected(_) => DeliveryOutcome::Rejected,
        Outcome::Released(_) => DeliveryOutcome::Released,
        Outcome::Modified(_) => DeliveryOutcome::Modified,
        #[allow(unreachable_patterns)]
        _ => DeliveryOutcome::Released,
    }
}
