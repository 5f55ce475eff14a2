//! In-process stand-in for the transactional key/value store.
//!
//! Rows are only ever changed through guarded updates that check the row's
//! current status first, so a writer that lost a race sees a
//! [`StoreError::Conflict`] instead of overwriting the winner. Multi-row
//! changes to one order are serialized with [`Store::lock_order`]; different
//! orders never contend on the same lock.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::matching::{MatchingAttempt, MatchingStatus};
use crate::models::order::{Order, OrderStatus, StatusHistoryEntry};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("{kind} {id} was modified concurrently: expected {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        id: Uuid,
        expected: String,
        actual: String,
    },
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => AppError::NotFound(err.to_string()),
            StoreError::Conflict { .. } => AppError::Conflict(err.to_string()),
        }
    }
}

type LockTable = DashMap<Uuid, Arc<Mutex<()>>>;

/// Proof that the holder has exclusive write access to one order's rows.
pub struct OrderLock {
    order_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl OrderLock {
    pub fn order_id(&self) -> Uuid {
        self.order_id
    }
}

impl Drop for OrderLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table still refers to the mutex: nobody holds or waits on it.
        self.table
            .remove_if(&self.order_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[derive(Default)]
pub struct Store {
    orders: DashMap<Uuid, Order>,
    history: DashMap<Uuid, Vec<StatusHistoryEntry>>,
    attempts: DashMap<Uuid, MatchingAttempt>,
    attempts_by_order: DashMap<Uuid, Vec<Uuid>>,
    locks: Arc<LockTable>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes writers of one order. The lock entry lives only while
    /// someone holds or waits for it.
    pub async fn lock_order(&self, order_id: Uuid) -> OrderLock {
        let mutex = self.locks.entry(order_id).or_default().value().clone();
        OrderLock {
            order_id,
            guard: Some(mutex.lock_owned().await),
            table: self.locks.clone(),
        }
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn insert_order(&self, order: Order, created: StatusHistoryEntry) {
        self.history.insert(order.id, vec![created]);
        self.orders.insert(order.id, order);
    }

    pub fn order(&self, id: Uuid) -> Option<Order> {
        self.orders.get(&id).map(|entry| entry.value().clone())
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn orders_in_status(&self, status: OrderStatus) -> Vec<Order> {
        self.orders
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Applies `change` only if the order is still in `expected`.
    pub fn update_order<F>(
        &self,
        id: Uuid,
        expected: OrderStatus,
        change: F,
    ) -> Result<Order, StoreError>
    where
        F: FnOnce(&mut Order),
    {
        let mut order = self
            .orders
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: "order", id })?;

        if order.status != expected {
            return Err(StoreError::Conflict {
                kind: "order",
                id,
                expected: expected.to_string(),
                actual: order.status.to_string(),
            });
        }

        change(&mut order);
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    /// Updates fields that are not part of the status machine (payment data).
    pub fn update_order_details<F>(&self, id: Uuid, change: F) -> Result<Order, StoreError>
    where
        F: FnOnce(&mut Order),
    {
        let mut order = self
            .orders
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: "order", id })?;

        change(&mut order);
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    pub fn append_history(&self, entry: StatusHistoryEntry) {
        self.history.entry(entry.order_id).or_default().push(entry);
    }

    pub fn history(&self, order_id: Uuid) -> Vec<StatusHistoryEntry> {
        self.history
            .get(&order_id)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    pub fn insert_attempt(&self, attempt: MatchingAttempt) {
        self.attempts_by_order
            .entry(attempt.order_id)
            .or_default()
            .push(attempt.id);
        self.attempts.insert(attempt.id, attempt);
    }

    pub fn attempt(&self, id: Uuid) -> Option<MatchingAttempt> {
        self.attempts.get(&id).map(|entry| entry.value().clone())
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Attempts for an order in insertion order.
    pub fn attempts_for_order(&self, order_id: Uuid) -> Vec<MatchingAttempt> {
        let ids = self
            .attempts_by_order
            .get(&order_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();

        ids.into_iter().filter_map(|id| self.attempt(id)).collect()
    }

    pub fn attempts_in_status(&self, status: MatchingStatus) -> Vec<MatchingAttempt> {
        self.attempts
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Applies `change` only if the attempt is still in `expected`.
    pub fn update_attempt<F>(
        &self,
        id: Uuid,
        expected: MatchingStatus,
        change: F,
    ) -> Result<MatchingAttempt, StoreError>
    where
        F: FnOnce(&mut MatchingAttempt),
    {
        let mut attempt = self
            .attempts
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: "matching", id })?;

        if attempt.status != expected {
            return Err(StoreError::Conflict {
                kind: "matching",
                id,
                expected: expected.to_string(),
                actual: attempt.status.to_string(),
            });
        }

        change(&mut attempt);
        Ok(attempt.clone())
    }
}
