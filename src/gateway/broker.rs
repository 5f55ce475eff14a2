use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection lost")]
    Disconnected,

    #[error("broker refused connection: {0}")]
    ConnectFailed(String),

    #[error("queue {0} is not declared")]
    UnknownQueue(String),

    #[error("delivery {0} is not outstanding")]
    UnknownDelivery(u64),
}

/// A message handed to a consumer and awaiting ack or nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub payload: Vec<u8>,
    /// How many times this message was handed out before this delivery.
    pub redelivery_count: u32,
}

/// Transport to a durable-queue broker. Queues are competing-consumer:
/// each message goes to exactly one consumer and stays outstanding until it
/// is acked, or nacked with requeue.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Persists `payload` on `queue`. Fails while disconnected; never drops
    /// silently.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Waits for the next message on `queue`.
    async fn next_delivery(&self, queue: &str) -> Result<Delivery, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;
}
