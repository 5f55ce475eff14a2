//! Sequential offer protocol. One matching cycle offers the order to its
//! ranked candidates one at a time; the first driver to accept wins, a
//! rejection or an expired deadline moves on to the next candidate, and a
//! cycle that runs out of candidates hands the order back to CONFIRMED.
//!
//! Every mutation for one order happens under that order's lock. Events
//! are collected while the lock is held and published after it is dropped.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::candidates::find_candidates;
use crate::engine::ledger::{self, ResolveOutcome};
use crate::error::AppError;
use crate::gateway::events::OutboundEvent;
use crate::models::matching::{MatchingAttempt, MatchingStatus};
use crate::models::order::OrderStatus;
use crate::orders::transitions::{self, apply_transition, assign_vehicle};
use crate::retry::retry_with_backoff;
use crate::state::AppState;
use crate::store::OrderLock;

pub const NO_CANDIDATES: &str = "No suitable vehicle found";
pub const ALL_REJECTED: &str = "All drivers rejected the order";
pub const NONE_ACCEPTED: &str = "No driver accepted the order";
pub const DIRECTORY_DOWN: &str = "Vehicle directory unavailable";
pub const VEHICLE_TAKEN: &str = "vehicle no longer available";

#[derive(Debug, Clone, Serialize)]
pub struct MatchingStarted {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub cycle: u32,
    pub candidates: usize,
    /// The offer currently waiting for a driver, if any.
    pub offer: Option<MatchingAttempt>,
    /// True when a cycle was already running and was returned as is.
    pub already_running: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Applied {
        attempt: MatchingAttempt,
        order_status: OrderStatus,
    },
    AlreadyResolved {
        attempt: MatchingAttempt,
    },
    /// The driver accepted but the vehicle was taken in the meantime; the
    /// offer was turned into a rejection and the cycle moved on.
    VehicleUnavailable {
        attempt: MatchingAttempt,
        order_status: OrderStatus,
    },
}

impl Resolution {
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Applied { .. } => "applied",
            Resolution::AlreadyResolved { .. } => "already_resolved",
            Resolution::VehicleUnavailable { .. } => "vehicle_unavailable",
        }
    }

    /// HTTP view: late answers and lost vehicles are client-visible errors.
    pub fn into_result(self) -> Result<(MatchingAttempt, OrderStatus), AppError> {
        match self {
            Resolution::Applied {
                attempt,
                order_status,
            } => Ok((attempt, order_status)),
            Resolution::AlreadyResolved { attempt } => Err(AppError::AlreadyResolved {
                matching_id: attempt.id,
                status: attempt.status,
            }),
            Resolution::VehicleUnavailable { attempt, .. } => Err(AppError::Conflict(format!(
                "vehicle {} is no longer available",
                attempt.vehicle_id
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Exhaustion {
    Rejected,
    Expired,
    Interrupted,
}

impl Exhaustion {
    fn note(self) -> &'static str {
        match self {
            Exhaustion::Rejected => ALL_REJECTED,
            Exhaustion::Expired => NONE_ACCEPTED,
            Exhaustion::Interrupted => NO_CANDIDATES,
        }
    }
}

/// Starts a matching cycle for a PENDING or CONFIRMED order. Calling it
/// again while an offer is outstanding returns the running cycle.
pub async fn start_matching(state: &AppState, order_id: Uuid) -> Result<MatchingStarted, AppError> {
    let lock = state.store.lock_order(order_id).await;
    let order = state
        .store
        .order(order_id)
        .ok_or_else(|| AppError::order_not_found(order_id))?;

    if order.status == OrderStatus::Matching {
        if let Some(offer) = ledger::outstanding_offer(&state.store, order_id) {
            info!(%order_id, cycle = offer.cycle, "matching already in progress");
            return Ok(MatchingStarted {
                order_id,
                status: order.status,
                cycle: offer.cycle,
                candidates: state
                    .store
                    .attempts_for_order(order_id)
                    .iter()
                    .filter(|attempt| attempt.cycle == offer.cycle)
                    .count(),
                offer: Some(offer),
                already_running: true,
            });
        }
    } else if !order.status.is_matchable() {
        return Err(AppError::InvalidState(format!(
            "cannot start matching for order with status {}",
            order.status
        )));
    }

    let mut outbox = Vec::new();
    if order.status != OrderStatus::Matching {
        let change = apply_transition(
            state,
            &lock,
            OrderStatus::Matching,
            Some("Looking for an available vehicle".to_string()),
        )
        .await?;
        outbox.push(change.event());
    }

    let strategy = state.settings.ranking.strategy();
    let candidates =
        match find_candidates(state, &order, strategy, state.settings.fan_out).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(%order_id, error = %err, "candidate search failed, order stays CONFIRMED");
                let change = apply_transition(
                    state,
                    &lock,
                    OrderStatus::Confirmed,
                    Some(DIRECTORY_DOWN.to_string()),
                )
                .await?;
                outbox.push(change.event());
                state.metrics.cycle("directory_error");
                drop(lock);
                state.gateway.publish_all(outbox).await;
                return Err(err);
            }
        };

    if candidates.is_empty() {
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

        warn!(%order_id, "no suitable vehicle found");
        state.gateway.publish_all(outbox).await;
        return Ok(MatchingStarted {
            order_id,
            status: OrderStatus::Confirmed,
            cycle: ledger::current_cycle(&state.store, order_id),
            candidates: 0,
            offer: None,
            already_running: false,
        });
    }

    let cycle = ledger::current_cycle(&state.store, order_id) + 1;
    let created = ledger::create_attempts(&state.store, &lock, &candidates, cycle);
    for attempt_id in created.superseded_offers {
        disarm(state, attempt_id, "superseded");
    }

    let first = created.attempts[0].id;
    let offer = issue_offer(state, &lock, first, &mut outbox)?;
    drop(lock);

    info!(
        %order_id,
        cycle,
        candidates = created.attempts.len(),
        strategy = strategy.name(),
        "matching cycle started"
    );
    state.gateway.publish_all(outbox).await;

    Ok(MatchingStarted {
        order_id,
        status: OrderStatus::Matching,
        cycle,
        candidates: created.attempts.len(),
        offer: Some(offer),
        already_running: false,
    })
}

/// Driver accepted the offer. The vehicle is claimed with a
/// compare-and-set in the directory before the order is marked MATCHED.
pub async fn accept_matching(state: &AppState, attempt_id: Uuid) -> Result<Resolution, AppError> {
    let order_id = owning_order(state, attempt_id)?;
    let lock = state.store.lock_order(order_id).await;

    let attempt = state
        .store
        .attempt(attempt_id)
        .ok_or_else(|| AppError::matching_not_found(attempt_id))?;
    if attempt.status != MatchingStatus::Pending {
        return Ok(Resolution::AlreadyResolved { attempt });
    }

    let order = state
        .store
        .order(order_id)
        .ok_or_else(|| AppError::order_not_found(order_id))?;
    if order.status != OrderStatus::Matching {
        let reason = format!("order is {}", order.status);
        let attempt = match ledger::resolve(
            &state.store,
            attempt_id,
            MatchingStatus::Cancelled,
            Some(reason),
        )? {
            ResolveOutcome::Resolved(attempt) => {
                disarm(state, attempt_id, "cancelled");
                attempt
            }
            ResolveOutcome::AlreadyResolved(attempt) => attempt,
        };
        return Ok(Resolution::AlreadyResolved { attempt });
    }

    let directory = &state.directory;
    let claimed = retry_with_backoff(&state.settings.directory_retry, "assign vehicle", || {
        directory.try_assign(attempt.vehicle_id)
    })
    .await?;

    let mut outbox = Vec::new();

    if !claimed {
        let rejected = match ledger::resolve(
            &state.store,
            attempt_id,
            MatchingStatus::Rejected,
            Some(VEHICLE_TAKEN.to_string()),
        )? {
            ResolveOutcome::Resolved(attempt) => attempt,
            ResolveOutcome::AlreadyResolved(attempt) => {
                return Ok(Resolution::AlreadyResolved { attempt });
            }
        };
        disarm(state, attempt_id, "vehicle_unavailable");
        warn!(%order_id, %attempt_id, vehicle_id = %rejected.vehicle_id, "vehicle taken before acceptance");

        let order_status = advance_or_exhaust(
            state,
            &lock,
            rejected.cycle,
            Exhaustion::Rejected,
            &mut outbox,
        )
        .await?;
        drop(lock);
        state.gateway.publish_all(outbox).await;
        return Ok(Resolution::VehicleUnavailable {
            attempt: rejected,
            order_status,
        });
    }

    let accepted = match ledger::resolve(&state.store, attempt_id, MatchingStatus::Accepted, None)? {
        ResolveOutcome::Resolved(attempt) => attempt,
        ResolveOutcome::AlreadyResolved(attempt) => {
            drop(lock);
            transitions::release_vehicle(state, order_id, attempt.vehicle_id).await;
            return Ok(Resolution::AlreadyResolved { attempt });
        }
    };
    disarm(state, attempt_id, "accepted");

    let change = assign_vehicle(
        state,
        &lock,
        accepted.vehicle_id,
        accepted.driver_id,
        format!("Matched with driver {}", accepted.driver_id),
    )?;
    for sibling in ledger::cancel_open(&state.store, &lock, "order matched") {
        disarm(state, sibling, "cancelled");
    }
    state.metrics.cycle("matched");
    outbox.push(change.event());
    outbox.push(OutboundEvent::order_matched(
        &change.order,
        &accepted,
        state.settings.ranking.strategy().name(),
    ));
    drop(lock);

    info!(
        %order_id,
        %attempt_id,
        driver_id = %accepted.driver_id,
        vehicle_id = %accepted.vehicle_id,
        "order matched"
    );
    state.gateway.publish_all(outbox).await;

    Ok(Resolution::Applied {
        attempt: accepted,
        order_status: OrderStatus::Matched,
    })
}

pub async fn reject_matching(
    state: &AppState,
    attempt_id: Uuid,
    reason: Option<String>,
) -> Result<Resolution, AppError> {
    let reason = reason.unwrap_or_else(|| "rejected by driver".to_string());
    resolve_declined(state, attempt_id, MatchingStatus::Rejected, reason).await
}

/// Deadline passed without an answer. Safe to call for offers that were
/// already answered: those come back as [`Resolution::AlreadyResolved`].
pub async fn expire_attempt(state: &AppState, attempt_id: Uuid) -> Result<Resolution, AppError> {
    resolve_declined(
        state,
        attempt_id,
        MatchingStatus::Expired,
        "offer expired".to_string(),
    )
    .await
}

async fn resolve_declined(
    state: &AppState,
    attempt_id: Uuid,
    outcome: MatchingStatus,
    reason: String,
) -> Result<Resolution, AppError> {
    let order_id = owning_order(state, attempt_id)?;
    let lock = state.store.lock_order(order_id).await;

    let declined = match ledger::resolve(&state.store, attempt_id, outcome, Some(reason))? {
        ResolveOutcome::Resolved(attempt) => attempt,
        ResolveOutcome::AlreadyResolved(attempt) => {
            return Ok(Resolution::AlreadyResolved { attempt });
        }
    };
    disarm(state, attempt_id, outcome.as_str());
    info!(
        %order_id,
        %attempt_id,
        driver_id = %declined.driver_id,
        outcome = %outcome,
        "offer declined"
    );

    let order = state
        .store
        .order(order_id)
        .ok_or_else(|| AppError::order_not_found(order_id))?;

    let mut outbox = Vec::new();
    let order_status = if order.status == OrderStatus::Matching {
        let exhaustion = if outcome == MatchingStatus::Expired {
            Exhaustion::Expired
        } else {
            Exhaustion::Rejected
        };
        advance_or_exhaust(state, &lock, declined.cycle, exhaustion, &mut outbox).await?
    } else {
        order.status
    };
    drop(lock);

    state.gateway.publish_all(outbox).await;
    Ok(Resolution::Applied {
        attempt: declined,
        order_status,
    })
}

/// Offers the next queued candidate of `cycle`, or ends the cycle and puts
/// the order back to CONFIRMED when none is left.
async fn advance_or_exhaust(
    state: &AppState,
    lock: &OrderLock,
    cycle: u32,
    exhaustion: Exhaustion,
    outbox: &mut Vec<OutboundEvent>,
) -> Result<OrderStatus, AppError> {
    let order_id = lock.order_id();

    if let Some(next) = ledger::next_queued(&state.store, order_id, cycle) {
        issue_offer(state, lock, next.id, outbox)?;
        return Ok(OrderStatus::Matching);
    }
    if ledger::outstanding_offer(&state.store, order_id).is_some() {
        return Ok(OrderStatus::Matching);
    }

    let note = exhaustion.note();
    let change = apply_transition(state, lock, OrderStatus::Confirmed, Some(note.to_string())).await?;
    outbox.push(change.event());
    outbox.push(OutboundEvent::matching_failed(&change.order, note));
    state.metrics.cycle("exhausted");

    warn!(%order_id, cycle, reason = note, "matching cycle exhausted");
    Ok(OrderStatus::Confirmed)
}

/// QUEUED -> PENDING, arms the deadline and queues the MATCHING_REQUEST.
fn issue_offer(
    state: &AppState,
    lock: &OrderLock,
    attempt_id: Uuid,
    outbox: &mut Vec<OutboundEvent>,
) -> Result<MatchingAttempt, AppError> {
    let order_id = lock.order_id();
    let order = state
        .store
        .order(order_id)
        .ok_or_else(|| AppError::order_not_found(order_id))?;

    let attempt = ledger::offer(&state.store, lock, attempt_id, state.settings.offer_ttl)?;
    state.timers.arm(attempt.id, state.settings.offer_ttl);
    state.metrics.active_offers.inc();
    state.metrics.offer("issued");
    outbox.push(OutboundEvent::matching_request(&order, &attempt));

    info!(
        %order_id,
        attempt_id = %attempt.id,
        driver_id = %attempt.driver_id,
        priority = attempt.priority,
        distance_km = attempt.distance_km,
        "offer issued"
    );
    Ok(attempt)
}

/// Bookkeeping for an offer that just left PENDING.
fn disarm(state: &AppState, attempt_id: Uuid, outcome: &str) {
    state.timers.cancel(attempt_id);
    state.metrics.active_offers.dec();
    state.metrics.offer(&outcome.to_ascii_lowercase());
}

fn owning_order(state: &AppState, attempt_id: Uuid) -> Result<Uuid, AppError> {
    state
        .store
        .attempt(attempt_id)
        .map(|attempt| attempt.order_id)
        .ok_or_else(|| AppError::matching_not_found(attempt_id))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub expired: usize,
    pub rearmed: usize,
    pub resumed: usize,
    /// Outbound events still held back after this sweep's flush.
    pub unpublished: usize,
}

/// Restores the offer protocol after a restart or a missed deadline:
/// overdue offers are expired, future ones get their deadline back, and
/// MATCHING orders with nothing outstanding are moved along. Events the
/// broker refused earlier are retried last.
pub async fn recover_pending_offers(state: &AppState) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let now = Utc::now();

    for attempt in ledger::pending_offers(&state.store) {
        if attempt.is_overdue(now) {
            match expire_attempt(state, attempt.id).await {
                Ok(Resolution::Applied { .. }) => report.expired += 1,
                Ok(_) => {}
                Err(err) => warn!(attempt_id = %attempt.id, error = %err, "failed to expire overdue offer"),
            }
        } else if !state.timers.is_armed(attempt.id) {
            let remaining = attempt
                .expires_at
                .and_then(|expires_at| (expires_at - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            state.timers.arm(attempt.id, remaining);
            report.rearmed += 1;
        }
    }

    for order in state.store.orders_in_status(OrderStatus::Matching) {
        match resume_stalled_cycle(state, order.id).await {
            Ok(true) => report.resumed += 1,
            Ok(false) => {}
            Err(err) => warn!(order_id = %order.id, error = %err, "failed to resume matching"),
        }
    }

    report.unpublished = state.gateway.flush_outbox().await;

    if report != RecoveryReport::default() {
        info!(
            expired = report.expired,
            rearmed = report.rearmed,
            resumed = report.resumed,
            unpublished = report.unpublished,
            "offer recovery sweep"
        );
    }
    report
}

async fn resume_stalled_cycle(state: &AppState, order_id: Uuid) -> Result<bool, AppError> {
    let lock = state.store.lock_order(order_id).await;
    let stalled = state
        .store
        .order(order_id)
        .is_some_and(|order| order.status == OrderStatus::Matching)
        && ledger::outstanding_offer(&state.store, order_id).is_none();
    if !stalled {
        return Ok(false);
    }

    let cycle = ledger::current_cycle(&state.store, order_id);
    let mut outbox = Vec::new();
    advance_or_exhaust(state, &lock, cycle, Exhaustion::Interrupted, &mut outbox).await?;
    drop(lock);

    state.gateway.publish_all(outbox).await;
    Ok(true)
}

/// Periodic recovery sweep plus housekeeping of the consumer dedupe set.
pub async fn run_recovery_sweeper(state: std::sync::Arc<AppState>) {
    let mut ticker = tokio::time::interval(state.settings.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        recover_pending_offers(&state).await;
        state.gateway.prune_processed(Duration::from_secs(24 * 60 * 60));
    }
}
