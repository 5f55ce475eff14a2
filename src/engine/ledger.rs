//! Matching ledger: the per-order record of which vehicles were tried in
//! which cycle and how each offer ended. Terminal rows never change again;
//! every write goes through a guarded update.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::engine::candidates::Candidate;
use crate::error::AppError;
use crate::models::matching::{MatchingAttempt, MatchingStatus};
use crate::store::{OrderLock, Store, StoreError};

#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Resolved(MatchingAttempt),
    /// Another writer got there first; carries the row as it is now.
    AlreadyResolved(MatchingAttempt),
}

pub struct CreatedAttempts {
    pub attempts: Vec<MatchingAttempt>,
    /// Offers from earlier cycles that were still outstanding and got cancelled.
    pub superseded_offers: Vec<Uuid>,
}

pub fn current_cycle(store: &Store, order_id: Uuid) -> u32 {
    store
        .attempts_for_order(order_id)
        .iter()
        .map(|attempt| attempt.cycle)
        .max()
        .unwrap_or(0)
}

/// Records one QUEUED row per candidate, in rank order. Open rows from
/// earlier cycles are cancelled first.
pub fn create_attempts(
    store: &Store,
    lock: &OrderLock,
    candidates: &[Candidate],
    cycle: u32,
) -> CreatedAttempts {
    let order_id = lock.order_id();
    let superseded_offers = cancel_open(store, lock, "superseded by a new matching cycle");
    let now = Utc::now();

    let attempts: Vec<MatchingAttempt> = candidates
        .iter()
        .enumerate()
        .map(|(priority, candidate)| MatchingAttempt {
            id: Uuid::new_v4(),
            order_id,
            vehicle_id: candidate.vehicle.id,
            driver_id: candidate.driver.id,
            status: MatchingStatus::Queued,
            cycle,
            priority: priority as u32,
            distance_km: candidate.distance_km,
            estimated_arrival_min: candidate.estimated_arrival_min,
            score: candidate.rank,
            created_at: now,
            offered_at: None,
            expires_at: None,
            resolved_at: None,
            reason: None,
        })
        .collect();

    for attempt in &attempts {
        store.insert_attempt(attempt.clone());
    }

    debug!(%order_id, cycle, attempts = attempts.len(), "matching attempts recorded");
    CreatedAttempts {
        attempts,
        superseded_offers,
    }
}

/// Records a match that skipped the offer protocol (instant matching).
pub fn record_direct_match(
    store: &Store,
    lock: &OrderLock,
    candidate: &Candidate,
    cycle: u32,
    reason: &str,
) -> MatchingAttempt {
    cancel_open(store, lock, "superseded by a direct match");
    let now = Utc::now();

    let attempt = MatchingAttempt {
        id: Uuid::new_v4(),
        order_id: lock.order_id(),
        vehicle_id: candidate.vehicle.id,
        driver_id: candidate.driver.id,
        status: MatchingStatus::Accepted,
        cycle,
        priority: 0,
        distance_km: candidate.distance_km,
        estimated_arrival_min: candidate.estimated_arrival_min,
        score: candidate.rank,
        created_at: now,
        offered_at: Some(now),
        expires_at: None,
        resolved_at: Some(now),
        reason: Some(reason.to_string()),
    };
    store.insert_attempt(attempt.clone());
    attempt
}

/// QUEUED -> PENDING with a deadline of `ttl` from now.
pub fn offer(
    store: &Store,
    lock: &OrderLock,
    attempt_id: Uuid,
    ttl: Duration,
) -> Result<MatchingAttempt, AppError> {
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|err| AppError::Internal(format!("offer ttl out of range: {err}")))?;

    let owner = store
        .attempt(attempt_id)
        .map(|attempt| attempt.order_id)
        .ok_or_else(|| AppError::matching_not_found(attempt_id))?;
    if owner != lock.order_id() {
        return Err(AppError::Internal(format!(
            "matching {attempt_id} does not belong to order {}",
            lock.order_id()
        )));
    }

    let attempt = store.update_attempt(attempt_id, MatchingStatus::Queued, |attempt| {
        attempt.status = MatchingStatus::Pending;
        attempt.offered_at = Some(now);
        attempt.expires_at = Some(now + ttl);
    })?;
    Ok(attempt)
}

/// PENDING -> `outcome`. Exactly one caller wins for a given row; everyone
/// else gets [`ResolveOutcome::AlreadyResolved`].
pub fn resolve(
    store: &Store,
    attempt_id: Uuid,
    outcome: MatchingStatus,
    reason: Option<String>,
) -> Result<ResolveOutcome, AppError> {
    if !outcome.is_terminal() {
        return Err(AppError::Internal(format!(
            "cannot resolve matching {attempt_id} as {outcome}"
        )));
    }

    let result = store.update_attempt(attempt_id, MatchingStatus::Pending, |attempt| {
        attempt.status = outcome;
        attempt.resolved_at = Some(Utc::now());
        attempt.reason = reason;
    });

    match result {
        Ok(attempt) => Ok(ResolveOutcome::Resolved(attempt)),
        Err(StoreError::Conflict { .. }) => store
            .attempt(attempt_id)
            .map(ResolveOutcome::AlreadyResolved)
            .ok_or_else(|| AppError::matching_not_found(attempt_id)),
        Err(StoreError::NotFound { .. }) => Err(AppError::matching_not_found(attempt_id)),
    }
}

/// Lowest-priority QUEUED row of `cycle`.
pub fn next_queued(store: &Store, order_id: Uuid, cycle: u32) -> Option<MatchingAttempt> {
    store
        .attempts_for_order(order_id)
        .into_iter()
        .filter(|attempt| attempt.cycle == cycle && attempt.status == MatchingStatus::Queued)
        .min_by_key(|attempt| attempt.priority)
}

pub fn outstanding_offer(store: &Store, order_id: Uuid) -> Option<MatchingAttempt> {
    store
        .attempts_for_order(order_id)
        .into_iter()
        .find(|attempt| attempt.status == MatchingStatus::Pending)
}

/// Every outstanding offer across all orders, soonest deadline first.
pub fn pending_offers(store: &Store) -> Vec<MatchingAttempt> {
    let mut offers = store.attempts_in_status(MatchingStatus::Pending);
    offers.sort_by_key(|attempt| attempt.expires_at);
    offers
}

/// Cancels every QUEUED or PENDING row of the order. Returns the ids of
/// the rows that were PENDING, whose deadlines the caller must disarm.
pub fn cancel_open(store: &Store, lock: &OrderLock, reason: &str) -> Vec<Uuid> {
    let mut cancelled_offers = Vec::new();

    for attempt in store.attempts_for_order(lock.order_id()) {
        if attempt.status.is_terminal() {
            continue;
        }
        let cancelled = store.update_attempt(attempt.id, attempt.status, |row| {
            row.status = MatchingStatus::Cancelled;
            row.resolved_at = Some(Utc::now());
            row.reason = Some(reason.to_string());
        });
        if cancelled.is_ok() && attempt.status == MatchingStatus::Pending {
            cancelled_offers.push(attempt.id);
        }
    }

    cancelled_offers
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{
        ResolveOutcome, cancel_open, create_attempts, current_cycle, next_queued, offer,
        outstanding_offer, pending_offers, resolve,
    };
    use crate::engine::candidates::Candidate;
    use crate::geo::GeoPoint;
    use crate::models::fleet::{Driver, DriverStatus, Vehicle, VehicleStatus};
    use crate::models::matching::MatchingStatus;
    use crate::store::Store;

    fn candidate(distance_km: f64) -> Candidate {
        let driver_id = Uuid::new_v4();
        Candidate {
            vehicle: Vehicle {
                id: Uuid::new_v4(),
                driver_id,
                plate_number: "1AB-2345".to_string(),
                vehicle_type: "van".to_string(),
                max_weight_kg: 100.0,
                max_volume_m3: 4.0,
                length_m: 2.0,
                width_m: 1.5,
                height_m: 1.5,
                status: VehicleStatus::Available,
                updated_at: Utc::now(),
            },
            driver: Driver {
                id: driver_id,
                name: "Somchai".to_string(),
                status: DriverStatus::Active,
                current_location: Some(GeoPoint::new(13.75, 100.5)),
                rating: 4.8,
                updated_at: Utc::now(),
            },
            distance_km,
            estimated_arrival_min: 2,
            rank: distance_km,
        }
    }

    #[tokio::test]
    async fn attempts_are_queued_in_rank_order() {
        let store = Store::new();
        let order_id = Uuid::new_v4();
        let lock = store.lock_order(order_id).await;

        let created = create_attempts(&store, &lock, &[candidate(1.0), candidate(2.0)], 1);

        assert_eq!(created.attempts.len(), 2);
        assert!(created.superseded_offers.is_empty());
        assert_eq!(current_cycle(&store, order_id), 1);
        let first = next_queued(&store, order_id, 1).unwrap();
        assert_eq!(first.id, created.attempts[0].id);
        assert_eq!(first.priority, 0);
    }

    #[tokio::test]
    async fn resolve_has_exactly_one_winner() {
        let store = Store::new();
        let order_id = Uuid::new_v4();
        let lock = store.lock_order(order_id).await;
        let created = create_attempts(&store, &lock, &[candidate(1.0)], 1);
        let id = created.attempts[0].id;
        offer(&store, &lock, id, Duration::from_secs(60)).unwrap();

        let accepted = resolve(&store, id, MatchingStatus::Accepted, None).unwrap();
        let expired = resolve(&store, id, MatchingStatus::Expired, None).unwrap();

        assert!(matches!(accepted, ResolveOutcome::Resolved(ref a) if a.status == MatchingStatus::Accepted));
        assert!(matches!(expired, ResolveOutcome::AlreadyResolved(ref a) if a.status == MatchingStatus::Accepted));
    }

    #[tokio::test]
    async fn new_cycle_cancels_open_rows_of_the_old_one() {
        let store = Store::new();
        let order_id = Uuid::new_v4();
        let lock = store.lock_order(order_id).await;
        let first = create_attempts(&store, &lock, &[candidate(1.0), candidate(2.0)], 1);
        offer(&store, &lock, first.attempts[0].id, Duration::from_secs(60)).unwrap();

        let second = create_attempts(&store, &lock, &[candidate(3.0)], 2);

        assert_eq!(second.superseded_offers, vec![first.attempts[0].id]);
        assert!(next_queued(&store, order_id, 1).is_none());
        assert!(outstanding_offer(&store, order_id).is_none());
        let old = store.attempt(first.attempts[1].id).unwrap();
        assert_eq!(old.status, MatchingStatus::Cancelled);
        assert_eq!(store.attempts_for_order(order_id).len(), 3);
    }

    #[tokio::test]
    async fn offering_sets_a_deadline() {
        let store = Store::new();
        let order_id = Uuid::new_v4();
        let lock = store.lock_order(order_id).await;
        let created = create_attempts(&store, &lock, &[candidate(1.0)], 1);

        let offered = offer(&store, &lock, created.attempts[0].id, Duration::from_secs(60)).unwrap();

        assert_eq!(offered.status, MatchingStatus::Pending);
        let ttl = offered.expires_at.unwrap() - offered.offered_at.unwrap();
        assert_eq!(ttl.num_seconds(), 60);
        assert!(offer(&store, &lock, offered.id, Duration::from_secs(60)).is_err());
    }

    #[tokio::test]
    async fn cancel_open_reports_outstanding_offers_only() {
        let store = Store::new();
        let order_id = Uuid::new_v4();
        let lock = store.lock_order(order_id).await;
        let created = create_attempts(&store, &lock, &[candidate(1.0), candidate(2.0)], 1);
        offer(&store, &lock, created.attempts[0].id, Duration::from_secs(60)).unwrap();

        let cancelled = cancel_open(&store, &lock, "order cancelled");

        assert_eq!(cancelled, vec![created.attempts[0].id]);
        assert!(
            store
                .attempts_for_order(order_id)
                .iter()
                .all(|attempt| attempt.status == MatchingStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn pending_offers_are_sorted_by_deadline() {
        let store = Store::new();
        let late_order = Uuid::new_v4();
        let soon_order = Uuid::new_v4();

        let lock = store.lock_order(late_order).await;
        let late = create_attempts(&store, &lock, &[candidate(1.0)], 1);
        offer(&store, &lock, late.attempts[0].id, Duration::from_secs(120)).unwrap();
        drop(lock);

        let lock = store.lock_order(soon_order).await;
        let soon = create_attempts(&store, &lock, &[candidate(1.0), candidate(2.0)], 1);
        offer(&store, &lock, soon.attempts[0].id, Duration::from_secs(10)).unwrap();
        drop(lock);

        let ids: Vec<_> = pending_offers(&store).into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![soon.attempts[0].id, late.attempts[0].id]);
    }
}
