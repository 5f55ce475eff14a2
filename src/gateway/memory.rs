use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::warn;

use super::broker::{Broker, BrokerError, Delivery};

struct StoredMessage {
    payload: Vec<u8>,
    redelivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
}

#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Broker kept in process memory. Queues survive disconnects (unacked
/// messages go back to the ready list), which is what a durable broker
/// queue looks like to a reconnecting client.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<Queue>>,
    connected: AtomicBool,
    refused_connects: AtomicU32,
    connect_calls: AtomicU32,
    next_tag: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the connection. Outstanding deliveries are requeued.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);

        for entry in self.queues.iter() {
            let queue = entry.value();
            {
                let mut state = queue.lock();
                let mut unacked: Vec<_> = state.unacked.drain().collect();
                unacked.sort_by_key(|(tag, _)| *tag);
                for (_, mut message) in unacked.into_iter().rev() {
                    message.redelivery_count += 1;
                    state.ready.push_front(message);
                }
            }
            queue.notify.notify_one();
        }
        warn!("in-memory broker disconnected");
    }

    /// Makes the next `attempts` connect calls fail.
    pub fn refuse_connects(&self, attempts: u32) {
        self.refused_connects.store(attempts, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Payloads waiting on `queue` that no consumer has taken yet.
    pub fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues
            .get(queue)
            .map(|entry| {
                entry
                    .lock()
                    .ready
                    .iter()
                    .map(|message| message.payload.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|entry| entry.lock().unacked.len())
            .unwrap_or(0)
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>, BrokerError> {
        self.queues
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }

    fn take_ready(&self, name: &str, queue: &Queue) -> Option<Delivery> {
        let mut state = queue.lock();
        let message = state.ready.pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            tag,
            queue: name.to_string(),
            payload: message.payload.clone(),
            redelivery_count: message.redelivery_count,
        };
        state.unacked.insert(tag, message);
        Some(delivery)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refused_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if refused.is_ok() {
            return Err(BrokerError::ConnectFailed("connection refused".to_string()));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let target = self.queue(queue)?;
        target.lock().ready.push_back(StoredMessage {
            payload,
            redelivery_count: 0,
        });
        target.notify.notify_one();
        Ok(())
    }

    async fn next_delivery(&self, queue: &str) -> Result<Delivery, BrokerError> {
        let target = self.queue(queue)?;
        loop {
            self.ensure_connected()?;
            if let Some(delivery) = self.take_ready(queue, &target) {
                return Ok(delivery);
            }
            target.notify.notified().await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let target = self.queue(&delivery.queue)?;
        let removed = target.lock().unacked.remove(&delivery.tag);
        removed
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(delivery.tag))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let target = self.queue(&delivery.queue)?;
        {
            let mut state = target.lock();
            let mut message = state
                .unacked
                .remove(&delivery.tag)
                .ok_or(BrokerError::UnknownDelivery(delivery.tag))?;
            if requeue {
                message.redelivery_count += 1;
                state.ready.push_back(message);
            }
        }
        if requeue {
            target.notify.notify_one();
        }
        Ok(())
    }
}
