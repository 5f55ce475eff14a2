//! Order lifecycle: creation, lookup, manual status changes, cancellation
//! and payment bookkeeping. Everything that needs a driver goes through
//! the matching engine.

pub mod pricing;
pub mod transitions;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::dispatch::{self, MatchingStarted};
use crate::engine::ledger;
use crate::error::AppError;
use crate::gateway::events::OutboundEvent;
use crate::models::matching::MatchingAttempt;
use crate::models::order::{
    Location, Order, OrderStatus, PackageDetails, PaymentMethod, PaymentStatus, StatusHistoryEntry,
};
use crate::state::AppState;
use transitions::apply_transition;

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub customer_id: Uuid,
    pub pickup_location: Location,
    pub dropoff_location: Location,
    pub package_details: PackageDetails,
    #[serde(default = "default_payment_method")]
    pub payment_method: PaymentMethod,
}

fn default_payment_method() -> PaymentMethod {
    PaymentMethod::Cash
}

impl NewOrder {
    pub fn validate(&self) -> Result<(), AppError> {
        let mut errors = Vec::new();

        for (field, location) in [
            ("pickup_location", &self.pickup_location),
            ("dropoff_location", &self.dropoff_location),
        ] {
            if !location.point().is_valid() {
                errors.push(format!("{field} coordinates are out of range"));
            }
            if location.address.trim().is_empty() {
                errors.push(format!("{field}.address must not be empty"));
            }
        }

        let package = &self.package_details;
        if !(package.weight_kg.is_finite() && package.weight_kg > 0.0) {
            errors.push("package_details.weight_kg must be > 0".to_string());
        }
        for (field, value) in [
            ("volume_m3", package.volume_m3),
            ("length_m", package.length_m),
            ("width_m", package.width_m),
            ("height_m", package.height_m),
        ] {
            if value.is_some_and(|v| !(v.is_finite() && v > 0.0)) {
                errors.push(format!("package_details.{field} must be > 0"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(errors))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmedOrder {
    pub order: Order,
    pub matching: MatchingStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentUpdate {
    Applied,
    Unchanged,
}

pub async fn create_order(state: &AppState, new_order: NewOrder) -> Result<Order, AppError> {
    new_order.validate()?;

    let quote = pricing::quote(
        &new_order.pickup_location.point(),
        &new_order.dropoff_location.point(),
        new_order.package_details.weight_kg,
    );
    let now = Utc::now();
    let order = Order {
        id: Uuid::new_v4(),
        customer_id: new_order.customer_id,
        pickup_location: new_order.pickup_location,
        dropoff_location: new_order.dropoff_location,
        package_details: new_order.package_details,
        price: quote.price,
        distance_km: quote.distance_km,
        estimated_time_min: quote.estimated_time_min,
        payment_method: new_order.payment_method,
        payment_status: PaymentStatus::Pending,
        payment_transaction_id: None,
        status: OrderStatus::Pending,
        vehicle_id: None,
        driver_id: None,
        created_at: now,
        updated_at: now,
    };

    state.store.insert_order(
        order.clone(),
        StatusHistoryEntry {
            order_id: order.id,
            status: OrderStatus::Pending,
            note: Some("Order created".to_string()),
            timestamp: now,
        },
    );

    info!(
        order_id = %order.id,
        customer_id = %order.customer_id,
        price = order.price,
        distance_km = order.distance_km,
        "order created"
    );
    state
        .gateway
        .publish(&OutboundEvent::order_created(&order))
        .await;

    Ok(order)
}

pub fn get_order(state: &AppState, order_id: Uuid) -> Result<Order, AppError> {
    state
        .store
        .order(order_id)
        .ok_or_else(|| AppError::order_not_found(order_id))
}

pub fn order_history(state: &AppState, order_id: Uuid) -> Result<Vec<StatusHistoryEntry>, AppError> {
    get_order(state, order_id)?;
    Ok(state.store.history(order_id))
}

pub fn matching_attempts(state: &AppState, order_id: Uuid) -> Result<Vec<MatchingAttempt>, AppError> {
    get_order(state, order_id)?;
    Ok(state.store.attempts_for_order(order_id))
}

/// PENDING -> CONFIRMED, then straight into a matching cycle.
pub async fn confirm_order(state: &Arc<AppState>, order_id: Uuid) -> Result<ConfirmedOrder, AppError> {
    let change = {
        let lock = state.store.lock_order(order_id).await;
        let order = get_order(state, order_id)?;
        if order.status != OrderStatus::Pending {
            return Err(AppError::InvalidState(format!(
                "only PENDING orders can be confirmed, order is {}",
                order.status
            )));
        }
        apply_transition(state, &lock, OrderStatus::Confirmed, Some("Order confirmed".to_string()))
            .await?
    };
    state.gateway.publish(&change.event()).await;

    let matching = dispatch::start_matching(state, order_id).await?;
    Ok(ConfirmedOrder {
        order: get_order(state, order_id)?,
        matching,
    })
}

/// Cancels the order and every open offer it has. Allowed until pickup.
pub async fn cancel_order(
    state: &AppState,
    order_id: Uuid,
    reason: Option<String>,
) -> Result<Order, AppError> {
    let lock = state.store.lock_order(order_id).await;
    let order = get_order(state, order_id)?;
    if !transitions::can_cancel(order.status) {
        return Err(AppError::CannotCancel(order.status));
    }

    for attempt_id in ledger::cancel_open(&state.store, &lock, "order cancelled") {
        state.timers.cancel(attempt_id);
        state.metrics.active_offers.dec();
        state.metrics.offer("cancelled");
    }

    let note = reason.clone().unwrap_or_else(|| "Order cancelled".to_string());
    let change = apply_transition(state, &lock, OrderStatus::Cancelled, Some(note)).await?;
    drop(lock);

    state
        .gateway
        .publish_all(vec![
            change.event(),
            OutboundEvent::order_cancelled(&change.order, reason),
        ])
        .await;
    Ok(change.order)
}

/// Manual status change from operators or the driver app. MATCHING and
/// MATCHED belong to the matching engine and cannot be set by hand.
pub async fn update_status(
    state: &AppState,
    order_id: Uuid,
    to: OrderStatus,
    note: Option<String>,
) -> Result<Order, AppError> {
    if to == OrderStatus::Cancelled {
        return cancel_order(state, order_id, note).await;
    }

    let lock = state.store.lock_order(order_id).await;
    let order = get_order(state, order_id)?;
    if !transitions::can_transition(order.status, to) {
        return Err(AppError::InvalidStatusTransition {
            from: order.status,
            to,
        });
    }
    if matches!(to, OrderStatus::Matching | OrderStatus::Matched)
        || order.status == OrderStatus::Matching
    {
        return Err(AppError::InvalidState(format!(
            "{} -> {to} is driven by the matching engine",
            order.status
        )));
    }

    let change = apply_transition(state, &lock, to, note).await?;
    drop(lock);

    state.gateway.publish(&change.event()).await;
    Ok(change.order)
}

/// Idempotent: a second completion for a paid order changes nothing.
pub async fn record_payment_completed(
    state: &AppState,
    order_id: Uuid,
    transaction_id: &str,
) -> Result<PaymentUpdate, AppError> {
    let _lock = state.store.lock_order(order_id).await;
    let order = get_order(state, order_id)?;
    if order.payment_status == PaymentStatus::Paid {
        if order.payment_transaction_id.as_deref() != Some(transaction_id) {
            warn!(
                %order_id,
                transaction_id,
                recorded = ?order.payment_transaction_id,
                "second payment for an order that is already paid"
            );
        }
        return Ok(PaymentUpdate::Unchanged);
    }

    state.store.update_order_details(order_id, |order| {
        order.payment_status = PaymentStatus::Paid;
        order.payment_transaction_id = Some(transaction_id.to_string());
    })?;
    info!(%order_id, transaction_id, "payment completed");
    Ok(PaymentUpdate::Applied)
}

/// A failure that arrives after a success is stale and ignored.
pub async fn record_payment_failed(
    state: &AppState,
    order_id: Uuid,
    transaction_id: Option<&str>,
    reason: Option<&str>,
) -> Result<PaymentUpdate, AppError> {
    let _lock = state.store.lock_order(order_id).await;
    let order = get_order(state, order_id)?;
    match order.payment_status {
        PaymentStatus::Paid => {
            warn!(%order_id, ?transaction_id, "payment failure after success ignored");
            return Ok(PaymentUpdate::Unchanged);
        }
        PaymentStatus::Failed => return Ok(PaymentUpdate::Unchanged),
        PaymentStatus::Pending | PaymentStatus::Refunded => {}
    }

    state.store.update_order_details(order_id, |order| {
        order.payment_status = PaymentStatus::Failed;
        if let Some(transaction_id) = transaction_id {
            order.payment_transaction_id = Some(transaction_id.to_string());
        }
    })?;
    warn!(%order_id, ?transaction_id, ?reason, "payment failed");
    Ok(PaymentUpdate::Applied)
}
