use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::directory::CapacityQuery;
use crate::engine::scoring::{self, RankInput, RankingStrategy};
use crate::error::AppError;
use crate::geo::{haversine_km, round_km};
use crate::models::fleet::{Driver, Vehicle, VehicleStatus};
use crate::models::order::Order;
use crate::retry::retry_with_backoff;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub vehicle: Vehicle,
    pub driver: Driver,
    /// Driver to pickup, km.
    pub distance_km: f64,
    pub estimated_arrival_min: u32,
    pub rank: f64,
}

/// Vehicles that can carry the order's package, driven by an active driver
/// with a known position, best first according to `strategy`, at most
/// `limit` of them.
pub async fn find_candidates(
    state: &AppState,
    order: &Order,
    strategy: &dyn RankingStrategy,
    limit: usize,
) -> Result<Vec<Candidate>, AppError> {
    let started = Instant::now();
    let result = search(state, order, strategy, limit).await;

    let outcome = match &result {
        Ok(found) if found.is_empty() => "empty",
        Ok(_) => "found",
        Err(_) => "error",
    };
    state
        .metrics
        .candidate_search_seconds
        .with_label_values(&[outcome])
        .observe(started.elapsed().as_secs_f64());

    result
}

async fn search(
    state: &AppState,
    order: &Order,
    strategy: &dyn RankingStrategy,
    limit: usize,
) -> Result<Vec<Candidate>, AppError> {
    let package = &order.package_details;
    let pickup = order.pickup_location.point();
    let query = CapacityQuery::from(package);
    let retry = &state.settings.directory_retry;
    let directory = &state.directory;

    let vehicles = retry_with_backoff(retry, "find available vehicles", || {
        directory.find_available(&query)
    })
    .await?;

    let mut candidates = Vec::with_capacity(vehicles.len());
    for vehicle in vehicles {
        if vehicle.status != VehicleStatus::Available {
            continue;
        }

        let driver_id = vehicle.driver_id;
        let Some(driver) =
            retry_with_backoff(retry, "load driver", || directory.driver(driver_id)).await?
        else {
            debug!(vehicle_id = %vehicle.id, %driver_id, "vehicle has no known driver");
            continue;
        };
        let Some(location) = driver.dispatchable_location() else {
            debug!(vehicle_id = %vehicle.id, %driver_id, "driver not dispatchable");
            continue;
        };

        let distance_km = round_km(haversine_km(&location, &pickup));
        let input = RankInput {
            package,
            vehicle: &vehicle,
            distance_km,
        };
        let score = scoring::score(&input, strategy);
        if !score.eligible {
            continue;
        }

        candidates.push(Candidate {
            estimated_arrival_min: scoring::estimated_arrival_min(distance_km),
            rank: score.rank,
            distance_km,
            driver,
            vehicle,
        });
    }

    candidates.sort_by(|a, b| {
        strategy
            .compare(a.rank, b.rank)
            .then(a.vehicle.max_weight_kg.total_cmp(&b.vehicle.max_weight_kg))
            .then(a.vehicle.max_volume_m3.total_cmp(&b.vehicle.max_volume_m3))
    });
    candidates.truncate(limit);

    info!(
        order_id = %order.id,
        strategy = strategy.name(),
        candidates = candidates.len(),
        "candidate search finished"
    );

    Ok(candidates)
}
