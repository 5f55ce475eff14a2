#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lastmile_dispatch::config::DispatchSettings;
use lastmile_dispatch::directory::{InMemoryDirectory, VehicleDirectory};
use lastmile_dispatch::engine::timers::run_expiry_worker;
use lastmile_dispatch::gateway::InMemoryBroker;
use lastmile_dispatch::gateway::events::topics;
use lastmile_dispatch::geo::GeoPoint;
use lastmile_dispatch::models::fleet::{Driver, DriverStatus, Vehicle, VehicleStatus};
use lastmile_dispatch::models::order::{Location, Order, PackageDetails, PaymentMethod};
use lastmile_dispatch::orders::{self, NewOrder};
use lastmile_dispatch::retry::RetryPolicy;
use lastmile_dispatch::state::AppState;
use serde_json::Value;
use uuid::Uuid;

pub const PICKUP: (f64, f64) = (13.7563, 100.5018);
pub const DROPOFF: (f64, f64) = (13.7367, 100.5232);

pub struct Harness {
    pub state: Arc<AppState>,
    pub directory: Arc<InMemoryDirectory>,
    pub broker: Arc<InMemoryBroker>,
}

pub fn settings(offer_ttl: Duration) -> DispatchSettings {
    DispatchSettings {
        offer_ttl,
        directory_retry: RetryPolicy::immediate(1),
        broker_retry: RetryPolicy::immediate(1),
        ..DispatchSettings::default()
    }
}

/// Connected state with the expiry worker running.
pub async fn harness(offer_ttl: Duration) -> Harness {
    build(offer_ttl, true).await
}

/// Connected state; fired deadlines go nowhere. Recovery tests use this to
/// leave offers overdue.
pub async fn harness_without_worker(offer_ttl: Duration) -> Harness {
    build(offer_ttl, false).await
}

async fn build(offer_ttl: Duration, with_worker: bool) -> Harness {
    let directory = Arc::new(InMemoryDirectory::new());
    let broker = Arc::new(InMemoryBroker::new());
    let (state, expired_rx) =
        AppState::with_components(settings(offer_ttl), directory.clone(), broker.clone());
    let state = Arc::new(state);
    state.gateway.start().await.unwrap();

    if with_worker {
        tokio::spawn(run_expiry_worker(state.clone(), expired_rx));
    } else {
        drop(expired_rx);
    }

    Harness {
        state,
        directory,
        broker,
    }
}

/// Active driver at `(lat, lng)` with a van of the given capacity.
pub async fn seed_vehicle(
    directory: &InMemoryDirectory,
    (latitude, longitude): (f64, f64),
    max_weight_kg: f64,
) -> (Driver, Vehicle) {
    let driver = directory
        .upsert_driver(Driver {
            id: Uuid::new_v4(),
            name: "Driver".to_string(),
            status: DriverStatus::Active,
            current_location: Some(GeoPoint::new(latitude, longitude)),
            rating: 4.7,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let vehicle = directory
        .upsert_vehicle(Vehicle {
            id: Uuid::new_v4(),
            driver_id: driver.id,
            plate_number: "1AB-2345".to_string(),
            vehicle_type: "van".to_string(),
            max_weight_kg,
            max_volume_m3: 5.0,
            length_m: 2.5,
            width_m: 1.5,
            height_m: 1.5,
            status: VehicleStatus::Available,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    (driver, vehicle)
}

pub fn new_order(weight_kg: f64) -> NewOrder {
    NewOrder {
        customer_id: Uuid::new_v4(),
        pickup_location: Location {
            latitude: PICKUP.0,
            longitude: PICKUP.1,
            address: "Siam Square, Bangkok".to_string(),
        },
        dropoff_location: Location {
            latitude: DROPOFF.0,
            longitude: DROPOFF.1,
            address: "Lumphini Park, Bangkok".to_string(),
        },
        package_details: PackageDetails {
            weight_kg,
            ..PackageDetails::default()
        },
        payment_method: PaymentMethod::Cash,
    }
}

pub async fn place_order(state: &AppState, weight_kg: f64) -> Order {
    orders::create_order(state, new_order(weight_kg)).await.unwrap()
}

pub async fn vehicle_status(directory: &InMemoryDirectory, id: Uuid) -> VehicleStatus {
    directory.vehicle(id).await.unwrap().unwrap().status
}

/// Event names published on `queue`, oldest first.
pub fn published_events(broker: &InMemoryBroker, queue: &str) -> Vec<Value> {
    broker
        .ready_payloads(queue)
        .into_iter()
        .map(|payload| serde_json::from_slice(&payload).unwrap())
        .collect()
}

pub fn events_named(broker: &InMemoryBroker, name: &str) -> Vec<Value> {
    let queue = if name == "MATCHING_REQUEST" {
        topics::DRIVER_REQUESTS
    } else {
        topics::ORDER_EVENTS
    };
    published_events(broker, queue)
        .into_iter()
        .filter(|event| event["event"] == name)
        .collect()
}

pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
