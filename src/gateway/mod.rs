//! Event gateway: publishes domain events to the broker and feeds inbound
//! driver and payment events to handlers with at-least-once semantics.

pub mod broker;
pub mod consumers;
pub mod events;
mod memory;

pub use memory::InMemoryBroker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::observability::metrics::Metrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use broker::{Broker, BrokerError, Delivery};
use events::{Envelope, InboundEvent, OutboundEvent, RawEnvelope, topics};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("broker unreachable after {attempts} attempts: {source}")]
    Unavailable { attempts: usize, source: BrokerError },
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::UpstreamUnavailable(err.to_string())
    }
}

/// Handles one decoded inbound event. An `Err` means "try again later": the
/// message is requeued. Anything that will never succeed must be logged and
/// mapped to `Ok` by the handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: InboundEvent) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack(&'static str),
    Requeue,
    DeadLetter,
}

/// An encoded envelope the broker has not taken yet. The payload is kept
/// as encoded so a redelivery carries the same message id.
struct Unpublished {
    topic: &'static str,
    event: &'static str,
    order_id: Uuid,
    payload: Vec<u8>,
}

pub struct EventGateway {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    max_redeliveries: u32,
    metrics: Metrics,
    processed: DashMap<Uuid, chrono::DateTime<Utc>>,
    outbox: Mutex<VecDeque<Unpublished>>,
}

impl EventGateway {
    pub fn new(
        broker: Arc<dyn Broker>,
        retry: RetryPolicy,
        max_redeliveries: u32,
        metrics: Metrics,
    ) -> Self {
        Self {
            broker,
            retry,
            max_redeliveries,
            metrics,
            processed: DashMap::new(),
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Connects and declares every queue this service uses.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.reconnect().await
    }

    /// Reconnect bounded by the retry policy. Gives up with an error instead
    /// of retrying forever.
    pub async fn reconnect(&self) -> Result<(), GatewayError> {
        let broker = &self.broker;
        let result = retry_with_backoff(&self.retry, "broker connect", || async move {
            broker.connect().await?;
            for queue in topics::ALL {
                broker.declare_queue(queue).await?;
            }
            Ok::<_, BrokerError>(())
        })
        .await;

        match result {
            Ok(()) => {
                self.metrics
                    .broker_reconnects_total
                    .with_label_values(&["connected"])
                    .inc();
                info!("connected to broker");
                self.flush_outbox().await;
                Ok(())
            }
            Err(source) => {
                self.metrics
                    .broker_reconnects_total
                    .with_label_values(&["gave_up"])
                    .inc();
                error!(error = %source, "giving up on broker connection");
                Err(GatewayError::Unavailable {
                    attempts: self.retry.max_retries + 1,
                    source,
                })
            }
        }
    }

    /// Publishes one event. Returns `false` when the broker refused it; the
    /// event then stays in the outbox and goes out on the next flush, so
    /// nothing is lost while the broker is down.
    pub async fn publish(&self, event: &OutboundEvent) -> bool {
        let topic = event.topic();
        let name = event.name();

        let payload = match serde_json::to_vec(&Envelope::new(event)) {
            Ok(payload) => payload,
            Err(err) => {
                error!(topic, event = name, error = %err, "failed to encode event");
                self.count_published(topic, "encode_error");
                return false;
            }
        };

        let mut outbox = self.outbox.lock().await;
        outbox.push_back(Unpublished {
            topic,
            event: name,
            order_id: event.order_id(),
            payload,
        });
        // Events queue behind older refused ones so per-order order holds.
        self.drain(&mut outbox).await;
        outbox.is_empty()
    }

    /// Publishes in order; returns how many events the broker refused.
    pub async fn publish_all(&self, events: Vec<OutboundEvent>) -> usize {
        let mut failed = 0;
        for event in &events {
            if !self.publish(event).await {
                failed += 1;
            }
        }
        failed
    }

    /// Retries events the broker refused earlier. Returns how many are
    /// still waiting.
    pub async fn flush_outbox(&self) -> usize {
        let mut outbox = self.outbox.lock().await;
        if !outbox.is_empty() {
            let waiting = outbox.len();
            self.drain(&mut outbox).await;
            info!(
                sent = waiting - outbox.len(),
                waiting = outbox.len(),
                "flushed unpublished events"
            );
        }
        outbox.len()
    }

    pub async fn unpublished_count(&self) -> usize {
        self.outbox.lock().await.len()
    }

    async fn drain(&self, outbox: &mut VecDeque<Unpublished>) {
        while let Some(next) = outbox.front() {
            match self.broker.publish(next.topic, next.payload.clone()).await {
                Ok(()) => {
                    debug!(topic = next.topic, event = next.event, order_id = %next.order_id, "event published");
                    self.count_published(next.topic, "ok");
                    outbox.pop_front();
                }
                Err(err) => {
                    error!(
                        topic = next.topic,
                        event = next.event,
                        order_id = %next.order_id,
                        waiting = outbox.len(),
                        error = %err,
                        "failed to publish event, keeping it for redelivery"
                    );
                    self.count_published(next.topic, "failed");
                    break;
                }
            }
        }
        self.metrics.unpublished_events.set(outbox.len() as i64);
    }

    /// Spawns a consumer loop for `topic` that survives broker reconnects.
    pub fn subscribe(self: &Arc<Self>, topic: &'static str, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move { gateway.consume(topic, handler).await })
    }

    /// Forgets processed message ids older than `max_age`.
    pub fn prune_processed(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let before = self.processed.len();
        self.processed.retain(|_, seen_at| *seen_at > cutoff);
        before - self.processed.len()
    }

    async fn consume(&self, topic: &'static str, handler: Arc<dyn EventHandler>) {
        info!(topic, "consumer started");

        loop {
            let delivery = match self.broker.next_delivery(topic).await {
                Ok(delivery) => delivery,
                Err(BrokerError::Disconnected) => {
                    warn!(topic, "broker connection lost, reconnecting");
                    if self.reconnect().await.is_err() {
                        sleep(self.retry.max_delay.max(Duration::from_millis(100))).await;
                    }
                    continue;
                }
                Err(err) => {
                    error!(topic, error = %err, "consumer stopped");
                    return;
                }
            };

            let settlement = self.handle_delivery(topic, &delivery, handler.as_ref()).await;
            self.settle(topic, &delivery, settlement).await;
        }
    }

    async fn handle_delivery(
        &self,
        topic: &'static str,
        delivery: &Delivery,
        handler: &dyn EventHandler,
    ) -> Settlement {
        let raw: RawEnvelope = match serde_json::from_slice(&delivery.payload) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(topic, error = %err, "dropping malformed message");
                return Settlement::Ack("malformed");
            }
        };

        if let Some(id) = raw.id {
            if self.processed.contains_key(&id) {
                debug!(topic, message_id = %id, "duplicate delivery skipped");
                return Settlement::Ack("duplicate");
            }
        }

        let event = match InboundEvent::from_raw(&raw) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(topic, event = %raw.event, "ignoring event");
                return Settlement::Ack("ignored");
            }
            Err(err) => {
                warn!(topic, event = %raw.event, error = %err, "dropping message with bad payload");
                return Settlement::Ack("malformed");
            }
        };

        let name = event.name();
        match handler.handle(event).await {
            Ok(()) => {
                if let Some(id) = raw.id {
                    self.processed.insert(id, Utc::now());
                }
                Settlement::Ack("handled")
            }
            Err(err) if delivery.redelivery_count >= self.max_redeliveries => {
                error!(
                    topic,
                    event = name,
                    redeliveries = delivery.redelivery_count,
                    error = %err,
                    "dead-lettering message after repeated failures"
                );
                Settlement::DeadLetter
            }
            Err(err) => {
                warn!(
                    topic,
                    event = name,
                    redeliveries = delivery.redelivery_count,
                    error = %err,
                    "handler failed, requeueing"
                );
                Settlement::Requeue
            }
        }
    }

    async fn settle(&self, topic: &'static str, delivery: &Delivery, settlement: Settlement) {
        let (result, outcome) = match settlement {
            Settlement::Ack(outcome) => (self.broker.ack(delivery).await, outcome),
            Settlement::Requeue => (self.broker.nack(delivery, true).await, "requeued"),
            Settlement::DeadLetter => (self.broker.nack(delivery, false).await, "dead_lettered"),
        };

        self.metrics
            .events_consumed_total
            .with_label_values(&[topic, outcome])
            .inc();

        if let Err(err) = result {
            // Unsettled messages come back after reconnect; dedupe absorbs them.
            warn!(topic, tag = delivery.tag, error = %err, "failed to settle delivery");
        }
    }

    fn count_published(&self, topic: &str, outcome: &str) {
        self.metrics
            .events_published_total
            .with_label_values(&[topic, outcome])
            .inc();
    }
}
