use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Matching,
    Matched,
    DriverAccepted,
    DriverAssigned,
    PickedUp,
    InTransit,
    Delivered,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 11] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Matching,
        OrderStatus::Matched,
        OrderStatus::DriverAccepted,
        OrderStatus::DriverAssigned,
        OrderStatus::PickedUp,
        OrderStatus::InTransit,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
        OrderStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Matching => "MATCHING",
            OrderStatus::Matched => "MATCHED",
            OrderStatus::DriverAccepted => "DRIVER_ACCEPTED",
            OrderStatus::DriverAssigned => "DRIVER_ASSIGNED",
            OrderStatus::PickedUp => "PICKED_UP",
            OrderStatus::InTransit => "IN_TRANSIT",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Statuses in which the order carries a vehicle and driver reference.
    pub fn holds_vehicle(&self) -> bool {
        matches!(
            self,
            OrderStatus::Matched
                | OrderStatus::DriverAssigned
                | OrderStatus::PickedUp
                | OrderStatus::InTransit
                | OrderStatus::Delivered
        )
    }

    pub fn is_matchable(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Confirmed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| format!("unknown order status: {raw}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    CreditCard,
    BankTransfer,
    Wallet,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
}

impl Location {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackageDetails {
    pub weight_kg: f64,
    #[serde(default)]
    pub volume_m3: Option<f64>,
    #[serde(default)]
    pub length_m: Option<f64>,
    #[serde(default)]
    pub width_m: Option<f64>,
    #[serde(default)]
    pub height_m: Option<f64>,
    #[serde(default)]
    pub is_fragile: bool,
    #[serde(default)]
    pub special_handling: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl PackageDetails {
    pub fn dimensions(&self) -> [Option<f64>; 3] {
        [self.length_m, self.width_m, self.height_m]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub pickup_location: Location,
    pub dropoff_location: Location,
    pub package_details: PackageDetails,
    pub price: f64,
    pub distance_km: f64,
    pub estimated_time_min: u32,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub payment_transaction_id: Option<String>,
    pub status: OrderStatus,
    pub vehicle_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}
