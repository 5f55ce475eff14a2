use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::{CapacityQuery, DirectoryError, VehicleDirectory};
use crate::geo::GeoPoint;
use crate::models::fleet::{Driver, DriverStatus, Vehicle, VehicleStatus};

/// Directory backed by process memory. Stands in for the user-driver service
/// when the dispatcher runs on its own and in tests.
#[derive(Default)]
pub struct InMemoryDirectory {
    vehicles: DashMap<Uuid, Vehicle>,
    drivers: DashMap<Uuid, Driver>,
    outages: AtomicU32,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `calls` directory calls fail as if the service were down.
    pub fn fail_next(&self, calls: u32) {
        self.outages.store(calls, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), DirectoryError> {
        let outage = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match outage {
            Ok(_) => Err(DirectoryError::Unavailable(
                "user-driver service did not respond".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }

    fn flip_status(
        &self,
        vehicle_id: Uuid,
        from: VehicleStatus,
        to: VehicleStatus,
    ) -> Result<bool, DirectoryError> {
        let mut vehicle = self
            .vehicles
            .get_mut(&vehicle_id)
            .ok_or(DirectoryError::NotFound {
                kind: "vehicle",
                id: vehicle_id,
            })?;

        if vehicle.status != from {
            return Ok(false);
        }
        vehicle.status = to;
        vehicle.updated_at = Utc::now();
        Ok(true)
    }
}

fn covers(vehicle: &Vehicle, query: &CapacityQuery) -> bool {
    let within = |bound: f64, wanted: Option<f64>| wanted.is_none_or(|value| bound >= value);

    vehicle.max_weight_kg >= query.weight_kg
        && within(vehicle.max_volume_m3, query.volume_m3)
        && within(vehicle.length_m, query.length_m)
        && within(vehicle.width_m, query.width_m)
        && within(vehicle.height_m, query.height_m)
}

#[async_trait]
impl VehicleDirectory for InMemoryDirectory {
    async fn find_available(&self, query: &CapacityQuery) -> Result<Vec<Vehicle>, DirectoryError> {
        self.check_reachable()?;
        Ok(self
            .vehicles
            .iter()
            .filter(|entry| entry.status == VehicleStatus::Available && covers(entry, query))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn vehicle(&self, id: Uuid) -> Result<Option<Vehicle>, DirectoryError> {
        self.check_reachable()?;
        Ok(self.vehicles.get(&id).map(|entry| entry.value().clone()))
    }

    async fn driver(&self, id: Uuid) -> Result<Option<Driver>, DirectoryError> {
        self.check_reachable()?;
        Ok(self.drivers.get(&id).map(|entry| entry.value().clone()))
    }

    async fn try_assign(&self, vehicle_id: Uuid) -> Result<bool, DirectoryError> {
        self.check_reachable()?;
        self.flip_status(vehicle_id, VehicleStatus::Available, VehicleStatus::Assigned)
    }

    async fn release(&self, vehicle_id: Uuid) -> Result<bool, DirectoryError> {
        self.check_reachable()?;
        self.flip_status(vehicle_id, VehicleStatus::Assigned, VehicleStatus::Available)
    }

    async fn list_vehicles(&self) -> Result<Vec<Vehicle>, DirectoryError> {
        Ok(self
            .vehicles
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_drivers(&self) -> Result<Vec<Driver>, DirectoryError> {
        Ok(self
            .drivers
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn upsert_vehicle(&self, vehicle: Vehicle) -> Result<Vehicle, DirectoryError> {
        self.vehicles.insert(vehicle.id, vehicle.clone());
        Ok(vehicle)
    }

    async fn upsert_driver(&self, driver: Driver) -> Result<Driver, DirectoryError> {
        self.drivers.insert(driver.id, driver.clone());
        Ok(driver)
    }

    async fn set_vehicle_status(
        &self,
        id: Uuid,
        status: VehicleStatus,
    ) -> Result<Vehicle, DirectoryError> {
        let mut vehicle = self
            .vehicles
            .get_mut(&id)
            .ok_or(DirectoryError::NotFound { kind: "vehicle", id })?;

        vehicle.status = status;
        vehicle.updated_at = Utc::now();
        Ok(vehicle.clone())
    }

    async fn set_driver_status(
        &self,
        id: Uuid,
        status: DriverStatus,
    ) -> Result<Driver, DirectoryError> {
        let mut driver = self
            .drivers
            .get_mut(&id)
            .ok_or(DirectoryError::NotFound { kind: "driver", id })?;

        driver.status = status;
        driver.updated_at = Utc::now();
        Ok(driver.clone())
    }

    async fn set_driver_location(
        &self,
        id: Uuid,
        location: GeoPoint,
    ) -> Result<Driver, DirectoryError> {
        let mut driver = self
            .drivers
            .get_mut(&id)
            .ok_or(DirectoryError::NotFound { kind: "driver", id })?;

        driver.current_location = Some(location);
        driver.updated_at = Utc::now();
        Ok(driver.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::InMemoryDirectory;
    use crate::directory::{CapacityQuery, DirectoryError, VehicleDirectory};
    use crate::models::fleet::{Vehicle, VehicleStatus};

    fn van(max_weight_kg: f64) -> Vehicle {
        Vehicle {
            id: Uuid::new_v4(),
            driver_id: Uuid::new_v4(),
            plate_number: "1AB-2345".to_string(),
            vehicle_type: "van".to_string(),
            max_weight_kg,
            max_volume_m3: 4.0,
            length_m: 2.0,
            width_m: 1.5,
            height_m: 1.5,
            status: VehicleStatus::Available,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn capacity_search_filters_by_weight_and_status() {
        let directory = InMemoryDirectory::new();
        let small = directory.upsert_vehicle(van(50.0)).await.unwrap();
        let large = directory.upsert_vehicle(van(500.0)).await.unwrap();
        let mut busy = van(500.0);
        busy.status = VehicleStatus::Maintenance;
        directory.upsert_vehicle(busy).await.unwrap();

        let query = CapacityQuery {
            weight_kg: 100.0,
            ..CapacityQuery::default()
        };
        let found = directory.find_available(&query).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, large.id);
        assert_ne!(found[0].id, small.id);
    }

    #[tokio::test]
    async fn assignment_is_compare_and_set() {
        let directory = InMemoryDirectory::new();
        let vehicle = directory.upsert_vehicle(van(100.0)).await.unwrap();

        assert!(directory.try_assign(vehicle.id).await.unwrap());
        assert!(!directory.try_assign(vehicle.id).await.unwrap());
        assert!(directory.release(vehicle.id).await.unwrap());
        assert!(!directory.release(vehicle.id).await.unwrap());
    }

    #[tokio::test]
    async fn simulated_outage_affects_only_the_next_calls() {
        let directory = InMemoryDirectory::new();
        directory.fail_next(1);

        let query = CapacityQuery::default();
        assert!(matches!(
            directory.find_available(&query).await,
            Err(DirectoryError::Unavailable(_))
        ));
        assert!(directory.find_available(&query).await.is_ok());
    }
}
