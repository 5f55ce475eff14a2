use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::AppError;
use crate::gateway::events::OutboundEvent;
use crate::models::order::{Order, OrderStatus, StatusHistoryEntry};
use crate::retry::retry_with_backoff;
use crate::state::AppState;
use crate::store::OrderLock;

use OrderStatus::*;

/// Outgoing edges of the order status machine.
pub fn allowed_transitions(from: OrderStatus) -> &'static [OrderStatus] {
    match from {
        Pending => &[Confirmed, Matching, Cancelled, Failed],
        Confirmed => &[Matching, Cancelled, Failed],
        Matching => &[Matched, Confirmed, Cancelled],
        Matched => &[DriverAssigned, PickedUp, InTransit, Cancelled],
        DriverAccepted => &[DriverAssigned, Cancelled],
        DriverAssigned => &[PickedUp, InTransit, Cancelled],
        PickedUp => &[InTransit, Failed],
        InTransit => &[Delivered, Failed],
        Delivered | Cancelled | Failed => &[],
    }
}

pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

pub fn can_cancel(status: OrderStatus) -> bool {
    can_transition(status, Cancelled)
}

/// A committed status change, ready to be announced.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub order: Order,
    pub old_status: OrderStatus,
    pub note: Option<String>,
}

impl StatusChange {
    pub fn event(&self) -> OutboundEvent {
        OutboundEvent::status_changed(&self.order, self.old_status, self.note.clone())
    }
}

/// Moves the locked order to `to`, appends history and, when the order
/// leaves a vehicle-holding state for good, hands the vehicle back.
pub(crate) async fn apply_transition(
    state: &AppState,
    lock: &OrderLock,
    to: OrderStatus,
    note: Option<String>,
) -> Result<StatusChange, AppError> {
    let order_id = lock.order_id();
    let current = state
        .store
        .order(order_id)
        .ok_or_else(|| AppError::order_not_found(order_id))?;

    if !can_transition(current.status, to) {
        return Err(AppError::InvalidStatusTransition {
            from: current.status,
            to,
        });
    }

    if to.holds_vehicle() && current.vehicle_id.is_none() {
        return Err(AppError::InvalidState(format!(
            "order {order_id} has no vehicle assigned, cannot move to {to}"
        )));
    }

    let updated = state.store.update_order(order_id, current.status, |order| {
        order.status = to;
        if !to.holds_vehicle() {
            order.vehicle_id = None;
            order.driver_id = None;
        }
    })?;
    record(state, &updated, current.status, note.clone());

    if to.is_terminal() {
        if let Some(vehicle_id) = current.vehicle_id {
            release_vehicle(state, order_id, vehicle_id).await;
        }
    }

    Ok(StatusChange {
        order: updated,
        old_status: current.status,
        note,
    })
}

/// MATCHING -> MATCHED with the winning vehicle and driver attached.
pub(crate) fn assign_vehicle(
    state: &AppState,
    lock: &OrderLock,
    vehicle_id: Uuid,
    driver_id: Uuid,
    note: String,
) -> Result<StatusChange, AppError> {
    let order_id = lock.order_id();
    let updated = state.store.update_order(order_id, Matching, |order| {
        order.status = Matched;
        order.vehicle_id = Some(vehicle_id);
        order.driver_id = Some(driver_id);
    })?;
    record(state, &updated, Matching, Some(note.clone()));

    Ok(StatusChange {
        order: updated,
        old_status: Matching,
        note: Some(note),
    })
}

/// Best effort: a vehicle that cannot be released is logged for operators.
pub(crate) async fn release_vehicle(state: &AppState, order_id: Uuid, vehicle_id: Uuid) {
    let directory = &state.directory;
    let released = retry_with_backoff(&state.settings.directory_retry, "release vehicle", || {
        directory.release(vehicle_id)
    })
    .await;

    match released {
        Ok(true) => info!(%order_id, %vehicle_id, "vehicle released"),
        Ok(false) => info!(%order_id, %vehicle_id, "vehicle was not assigned, nothing to release"),
        Err(err) => error!(%order_id, %vehicle_id, error = %err, "failed to release vehicle"),
    }
}

fn record(state: &AppState, order: &Order, old_status: OrderStatus, note: Option<String>) {
    state.store.append_history(StatusHistoryEntry {
        order_id: order.id,
        status: order.status,
        note,
        timestamp: Utc::now(),
    });

    info!(
        order_id = %order.id,
        from = %old_status,
        to = %order.status,
        "order status changed"
    );
}
