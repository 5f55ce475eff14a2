use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchingStatus {
    /// Recorded as a candidate for the cycle but not offered yet.
    Queued,
    /// Offer outstanding; the driver has until `expires_at` to answer.
    Pending,
    Accepted,
    Rejected,
    Expired,
    Cancelled,
}

impl MatchingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchingStatus::Queued => "QUEUED",
            MatchingStatus::Pending => "PENDING",
            MatchingStatus::Accepted => "ACCEPTED",
            MatchingStatus::Rejected => "REJECTED",
            MatchingStatus::Expired => "EXPIRED",
            MatchingStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MatchingStatus::Queued | MatchingStatus::Pending)
    }
}

impl fmt::Display for MatchingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingAttempt {
    pub id: Uuid,
    pub order_id: Uuid,
    pub vehicle_id: Uuid,
    pub driver_id: Uuid,
    pub status: MatchingStatus,
    pub cycle: u32,
    pub priority: u32,
    pub distance_km: f64,
    pub estimated_arrival_min: u32,
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub offered_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl MatchingAttempt {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == MatchingStatus::Pending
            && self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}
