use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleStatus {
    Available,
    #[serde(alias = "IN_USE")]
    Assigned,
    Maintenance,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Active,
    Inactive,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub plate_number: String,
    pub vehicle_type: String,
    pub max_weight_kg: f64,
    pub max_volume_m3: f64,
    pub length_m: f64,
    pub width_m: f64,
    pub height_m: f64,
    pub status: VehicleStatus,
    pub updated_at: DateTime<Utc>,
}

impl Vehicle {
    pub fn dimensions(&self) -> [f64; 3] {
        [self.length_m, self.width_m, self.height_m]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub status: DriverStatus,
    pub current_location: Option<GeoPoint>,
    pub rating: f64,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    /// Location of a driver that can take offers right now.
    pub fn dispatchable_location(&self) -> Option<GeoPoint> {
        if self.status == DriverStatus::Active {
            self.current_location
        } else {
            None
        }
    }
}
