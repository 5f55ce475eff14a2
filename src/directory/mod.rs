//! Contract with the vehicle/driver directory owned by the user-driver
//! service. Everything read through it is a snapshot; the only writes are the
//! compare-and-set status flips made when an offer is accepted or released.

mod memory;

pub use memory::InMemoryDirectory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::fleet::{Driver, DriverStatus, Vehicle, VehicleStatus};
use crate::models::order::PackageDetails;

#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
}

impl From<DirectoryError> for AppError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Unavailable(msg) => AppError::UpstreamUnavailable(msg),
            DirectoryError::NotFound { .. } => AppError::NotFound(err.to_string()),
        }
    }
}

/// Hard capacity requirements forwarded to the directory's capacity search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapacityQuery {
    pub weight_kg: f64,
    pub volume_m3: Option<f64>,
    pub length_m: Option<f64>,
    pub width_m: Option<f64>,
    pub height_m: Option<f64>,
}

impl From<&PackageDetails> for CapacityQuery {
    fn from(package: &PackageDetails) -> Self {
        CapacityQuery {
            weight_kg: package.weight_kg,
            volume_m3: package.volume_m3,
            length_m: package.length_m,
            width_m: package.width_m,
            height_m: package.height_m,
        }
    }
}

#[async_trait]
pub trait VehicleDirectory: Send + Sync {
    /// AVAILABLE vehicles whose bounds cover the query.
    async fn find_available(&self, query: &CapacityQuery) -> Result<Vec<Vehicle>, DirectoryError>;

    async fn vehicle(&self, id: Uuid) -> Result<Option<Vehicle>, DirectoryError>;

    async fn driver(&self, id: Uuid) -> Result<Option<Driver>, DirectoryError>;

    /// Flips AVAILABLE -> ASSIGNED; `Ok(false)` when the vehicle was not AVAILABLE.
    async fn try_assign(&self, vehicle_id: Uuid) -> Result<bool, DirectoryError>;

    /// Flips ASSIGNED -> AVAILABLE; `Ok(false)` when the vehicle was not ASSIGNED.
    async fn release(&self, vehicle_id: Uuid) -> Result<bool, DirectoryError>;

    async fn list_vehicles(&self) -> Result<Vec<Vehicle>, DirectoryError>;

    async fn list_drivers(&self) -> Result<Vec<Driver>, DirectoryError>;

    async fn upsert_vehicle(&self, vehicle: Vehicle) -> Result<Vehicle, DirectoryError>;

    async fn upsert_driver(&self, driver: Driver) -> Result<Driver, DirectoryError>;

    async fn set_vehicle_status(
        &self,
        id: Uuid,
        status: VehicleStatus,
    ) -> Result<Vehicle, DirectoryError>;

    async fn set_driver_status(&self, id: Uuid, status: DriverStatus)
    -> Result<Driver, DirectoryError>;

    async fn set_driver_location(
        &self,
        id: Uuid,
        location: GeoPoint,
    ) -> Result<Driver, DirectoryError>;
}
