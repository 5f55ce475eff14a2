//! Instant matching: no offer round-trip. The best-fitting vehicle by
//! capacity utilization is claimed directly and the order goes straight to
//! MATCHED.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::candidates::{Candidate, find_candidates};
use crate::engine::dispatch::{DIRECTORY_DOWN, NO_CANDIDATES};
use crate::engine::ledger;
use crate::engine::scoring::{RankingStrategy, UtilizationStrategy};
use crate::error::AppError;
use crate::gateway::events::OutboundEvent;
use crate::models::order::OrderStatus;
use crate::orders::transitions::{apply_transition, assign_vehicle};
use crate::retry::retry_with_backoff;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantMatch {
    pub order_id: Uuid,
    pub matching_id: Uuid,
    pub vehicle_id: Uuid,
    pub driver_id: Uuid,
    pub score: f64,
    pub distance_km: f64,
    pub algorithm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub order_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchMatchResult {
    pub successful: Vec<InstantMatch>,
    pub failed: Vec<BatchFailure>,
}

/// `Ok(None)` when no vehicle could be claimed; the order is then back in
/// CONFIRMED.
pub async fn instant_match(state: &AppState, order_id: Uuid) -> Result<Option<InstantMatch>, AppError> {
    let strategy = &UtilizationStrategy;
    let lock = state.store.lock_order(order_id).await;
    let order = state
        .store
        .order(order_id)
        .ok_or_else(|| AppError::order_not_found(order_id))?;
    if !order.status.is_matchable() {
        return Err(AppError::InvalidState(format!(
            "cannot match order with status {}",
            order.status
        )));
    }

    let mut outbox = Vec::new();
    let change = apply_transition(
        state,
        &lock,
        OrderStatus::Matching,
        Some("Instant matching".to_string()),
    )
    .await?;
    outbox.push(change.event());

    let candidates = match find_candidates(state, &order, strategy, state.settings.fan_out).await {
        Ok(candidates) => candidates,
        Err(err) => {
            let change = apply_transition(
                state,
                &lock,
                OrderStatus::Confirmed,
                Some(DIRECTORY_DOWN.to_string()),
            )
            .await?;
            outbox.push(change.event());
            drop(lock);
            state.gateway.publish_all(outbox).await;
            return Err(err);
        }
    };

    let mut chosen: Option<Candidate> = None;
    for candidate in candidates {
        let directory = &state.directory;
        let vehicle_id = candidate.vehicle.id;
        let claimed = retry_with_backoff(&state.settings.directory_retry, "assign vehicle", || {
            directory.try_assign(vehicle_id)
        })
        .await;

        match claimed {
            Ok(true) => {
                chosen = Some(candidate);
                break;
            }
            Ok(false) => info!(%order_id, %vehicle_id, "vehicle taken, trying next"),
            Err(err) => warn!(%order_id, %vehicle_id, error = %err, "could not claim vehicle"),
        }
    }

    let Some(candidate) = chosen else {
        let change = apply_transition(
            state,
            &lock,
            OrderStatus::Confirmed,
            Some(NO_CANDIDATES.to_string()),
        )
        .await?;
        outbox.push(change.event());
        outbox.push(OutboundEvent::matching_failed(&change.order, NO_CANDIDATES));
        state.metrics.cycle("no_candidates");
        drop(lock);

        warn!(%order_id, "instant matching found no vehicle");
        state.gateway.publish_all(outbox).await;
        return Ok(None);
    };

    let cycle = ledger::current_cycle(&state.store, order_id) + 1;
    let attempt = ledger::record_direct_match(
        &state.store,
        &lock,
        &candidate,
        cycle,
        "instant match",
    );
    let change = assign_vehicle(
        state,
        &lock,
        attempt.vehicle_id,
        attempt.driver_id,
        format!(
            "Matched by {} with driver {}",
            strategy.name(),
            attempt.driver_id
        ),
    )?;
    outbox.push(change.event());
    outbox.push(OutboundEvent::order_matched(&change.order, &attempt, strategy.name()));
    state.metrics.cycle("matched");
    drop(lock);

    info!(
        %order_id,
        vehicle_id = %attempt.vehicle_id,
        driver_id = %attempt.driver_id,
        score = attempt.score,
        "order matched instantly"
    );
    state.gateway.publish_all(outbox).await;

    Ok(Some(InstantMatch {
        order_id,
        matching_id: attempt.id,
        vehicle_id: attempt.vehicle_id,
        driver_id: attempt.driver_id,
        score: attempt.score,
        distance_km: attempt.distance_km,
        algorithm: strategy.name().to_string(),
    }))
}

/// Matches orders lightest package first so small parcels do not lose
/// their vehicles to bulky ones that fit fewer vehicles anyway.
pub async fn batch_match(state: &AppState, order_ids: &[Uuid]) -> BatchMatchResult {
    let mut result = BatchMatchResult::default();
    let mut orders = Vec::with_capacity(order_ids.len());

    for &order_id in order_ids {
        match state.store.order(order_id) {
            Some(order) => orders.push(order),
            None => result.failed.push(BatchFailure {
                order_id,
                reason: format!("order {order_id} not found"),
            }),
        }
    }
    orders.sort_by(|a, b| {
        a.package_details
            .weight_kg
            .total_cmp(&b.package_details.weight_kg)
    });

    for order in orders {
        match instant_match(state, order.id).await {
            Ok(Some(matched)) => result.successful.push(matched),
            Ok(None) => result.failed.push(BatchFailure {
                order_id: order.id,
                reason: NO_CANDIDATES.to_string(),
            }),
            Err(err) => result.failed.push(BatchFailure {
                order_id: order.id,
                reason: err.to_string(),
            }),
        }
    }

    info!(
        matched = result.successful.len(),
        failed = result.failed.len(),
        "batch matching finished"
    );
    result
}
