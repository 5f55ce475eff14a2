use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::matching::MatchingAttempt;
use crate::models::order::{Location, Order, OrderStatus};

pub mod topics {
    /// Order lifecycle events for downstream services.
    pub const ORDER_EVENTS: &str = "order-events";
    /// Offers sent to driver apps.
    pub const DRIVER_REQUESTS: &str = "driver-requests";
    /// Driver responses coming back from driver apps.
    pub const DRIVER_EVENTS: &str = "driver-events";
    pub const PAYMENT_EVENTS: &str = "payment-events";

    pub const ALL: [&str; 4] = [ORDER_EVENTS, DRIVER_REQUESTS, DRIVER_EVENTS, PAYMENT_EVENTS];
}

/// Wire form of every message: `{"id", "event", "data", "timestamp"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: Uuid,
    #[serde(flatten)]
    pub body: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> Envelope<T> {
    pub fn new(body: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundEvent {
    OrderCreated(OrderCreated),
    OrderStatusChanged(OrderStatusChanged),
    MatchingRequest(MatchingRequest),
    OrderMatched(OrderMatched),
    MatchingFailed(MatchingFailed),
    OrderCancelled(OrderCancelled),
}

impl OutboundEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            OutboundEvent::MatchingRequest(_) => topics::DRIVER_REQUESTS,
            _ => topics::ORDER_EVENTS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::OrderCreated(_) => "ORDER_CREATED",
            OutboundEvent::OrderStatusChanged(_) => "ORDER_STATUS_CHANGED",
            OutboundEvent::MatchingRequest(_) => "MATCHING_REQUEST",
            OutboundEvent::OrderMatched(_) => "ORDER_MATCHED",
            OutboundEvent::MatchingFailed(_) => "MATCHING_FAILED",
            OutboundEvent::OrderCancelled(_) => "ORDER_CANCELLED",
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            OutboundEvent::OrderCreated(e) => e.order_id,
            OutboundEvent::OrderStatusChanged(e) => e.order_id,
            OutboundEvent::MatchingRequest(e) => e.order_id,
            OutboundEvent::OrderMatched(e) => e.order_id,
            OutboundEvent::MatchingFailed(e) => e.order_id,
            OutboundEvent::OrderCancelled(e) => e.order_id,
        }
    }

    pub fn order_created(order: &Order) -> Self {
        OutboundEvent::OrderCreated(OrderCreated {
            order_id: order.id,
            customer_id: order.customer_id,
            status: order.status,
            price: order.price,
            distance_km: order.distance_km,
            estimated_time_min: order.estimated_time_min,
        })
    }

    pub fn status_changed(order: &Order, old_status: OrderStatus, note: Option<String>) -> Self {
        OutboundEvent::OrderStatusChanged(OrderStatusChanged {
            order_id: order.id,
            customer_id: order.customer_id,
            old_status,
            new_status: order.status,
            note,
        })
    }

    pub fn matching_request(order: &Order, attempt: &MatchingAttempt) -> Self {
        let package = &order.package_details;
        let dimensions = match package.dimensions() {
            [Some(l), Some(w), Some(h)] => Some(format!("{l}x{w}x{h}")),
            _ => None,
        };

        OutboundEvent::MatchingRequest(MatchingRequest {
            matching_id: attempt.id,
            order_id: order.id,
            driver_id: attempt.driver_id,
            vehicle_id: attempt.vehicle_id,
            pickup: order.pickup_location.clone(),
            dropoff: order.dropoff_location.clone(),
            package_details: PackageSummary {
                weight_kg: package.weight_kg,
                dimensions,
                is_fragile: package.is_fragile,
                special_handling: package.special_handling.clone(),
            },
            price: order.price,
            distance: attempt.distance_km,
            estimated_arrival: attempt.estimated_arrival_min,
            expire_at: attempt.expires_at.unwrap_or_else(Utc::now),
        })
    }

    pub fn order_matched(order: &Order, attempt: &MatchingAttempt, algorithm: &str) -> Self {
        OutboundEvent::OrderMatched(OrderMatched {
            order_id: order.id,
            customer_id: order.customer_id,
            matching_id: attempt.id,
            driver_id: attempt.driver_id,
            vehicle_id: attempt.vehicle_id,
            algorithm: algorithm.to_string(),
        })
    }

    pub fn matching_failed(order: &Order, reason: &str) -> Self {
        OutboundEvent::MatchingFailed(MatchingFailed {
            order_id: order.id,
            customer_id: order.customer_id,
            reason: reason.to_string(),
        })
    }

    pub fn order_cancelled(order: &Order, reason: Option<String>) -> Self {
        OutboundEvent::OrderCancelled(OrderCancelled {
            order_id: order.id,
            customer_id: order.customer_id,
            reason,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub price: f64,
    pub distance_km: f64,
    pub estimated_time_min: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusChanged {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSummary {
    pub weight_kg: f64,
    pub dimensions: Option<String>,
    pub is_fragile: bool,
    pub special_handling: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingRequest {
    pub matching_id: Uuid,
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub vehicle_id: Uuid,
    pub pickup: Location,
    pub dropoff: Location,
    pub package_details: PackageSummary,
    pub price: f64,
    /// Driver to pickup, km.
    pub distance: f64,
    /// Minutes until the driver reaches the pickup.
    pub estimated_arrival: u32,
    pub expire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMatched {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub matching_id: Uuid,
    pub driver_id: Uuid,
    pub vehicle_id: Uuid,
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingFailed {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub reason: Option<String>,
}

/// Inbound envelope before the event name is resolved.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverDecision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverResponse {
    pub matching_id: Uuid,
    pub response: DriverDecision,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompleted {
    pub order_id: Uuid,
    pub transaction_id: String,
    #[serde(default)]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub order_id: Uuid,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    DriverResponse(DriverResponse),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
}

impl InboundEvent {
    /// `Ok(None)` for event names this service does not act on.
    pub fn from_raw(raw: &RawEnvelope) -> Result<Option<Self>, serde_json::Error> {
        let data = raw.data.clone();
        let event = match raw.event.as_str() {
            "DRIVER_RESPONSE" => InboundEvent::DriverResponse(serde_json::from_value(data)?),
            "PAYMENT_COMPLETED" => InboundEvent::PaymentCompleted(serde_json::from_value(data)?),
            "PAYMENT_FAILED" => InboundEvent::PaymentFailed(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::DriverResponse(_) => "DRIVER_RESPONSE",
            InboundEvent::PaymentCompleted(_) => "PAYMENT_COMPLETED",
            InboundEvent::PaymentFailed(_) => "PAYMENT_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use chrono::Utc;

    use super::{
        DriverDecision, Envelope, InboundEvent, MatchingFailed, MatchingRequest, OutboundEvent,
        PackageSummary, RawEnvelope,
    };
    use crate::models::order::Location;

    #[test]
    fn outbound_envelope_has_flat_event_and_camel_case_data() {
        let order_id = Uuid::new_v4();
        let event = OutboundEvent::MatchingFailed(MatchingFailed {
            order_id,
            customer_id: Uuid::new_v4(),
            reason: "No driver accepted the order".to_string(),
        });

        let value = serde_json::to_value(Envelope::new(&event)).unwrap();

        assert_eq!(value["event"], "MATCHING_FAILED");
        assert_eq!(value["data"]["orderId"], json!(order_id));
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_string());
        assert_eq!(event.topic(), "order-events");
    }

    #[test]
    fn matching_request_carries_package_details() {
        let place = |address: &str| Location {
            latitude: 13.75,
            longitude: 100.5,
            address: address.to_string(),
        };
        let event = OutboundEvent::MatchingRequest(MatchingRequest {
            matching_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            driver_id: Uuid::new_v4(),
            vehicle_id: Uuid::new_v4(),
            pickup: place("Siam Square"),
            dropoff: place("Lumphini Park"),
            package_details: PackageSummary {
                weight_kg: 12.5,
                dimensions: Some("0.5x0.4x0.3".to_string()),
                is_fragile: true,
                special_handling: None,
            },
            price: 190.0,
            distance: 1.2,
            estimated_arrival: 2,
            expire_at: Utc::now(),
        });

        let value = serde_json::to_value(Envelope::new(&event)).unwrap();
        let data = &value["data"];

        assert_eq!(value["event"], "MATCHING_REQUEST");
        assert_eq!(event.topic(), "driver-requests");
        assert_eq!(data["packageDetails"]["weightKg"], 12.5);
        assert_eq!(data["packageDetails"]["isFragile"], true);
        assert!(data.get("package").is_none());
        assert_eq!(data["pickup"]["address"], "Siam Square");
        assert!(data["expireAt"].is_string());
    }

    #[test]
    fn driver_response_is_parsed_from_raw_envelope() {
        let matching_id = Uuid::new_v4();
        let raw: RawEnvelope = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "event": "DRIVER_RESPONSE",
            "data": { "matchingId": matching_id, "response": "accept" },
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap();

        match InboundEvent::from_raw(&raw).unwrap() {
            Some(InboundEvent::DriverResponse(response)) => {
                assert_eq!(response.matching_id, matching_id);
                assert_eq!(response.response, DriverDecision::Accept);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn location_updates_are_ignored() {
        let raw: RawEnvelope = serde_json::from_value(json!({
            "event": "DRIVER_LOCATION_UPDATED",
            "data": { "driverId": Uuid::new_v4() },
        }))
        .unwrap();

        assert_eq!(InboundEvent::from_raw(&raw).unwrap(), None);
    }

    #[test]
    fn known_event_with_bad_data_is_an_error() {
        let raw: RawEnvelope = serde_json::from_value(json!({
            "event": "PAYMENT_COMPLETED",
            "data": { "orderId": "not-a-uuid" },
        }))
        .unwrap();

        assert!(InboundEvent::from_raw(&raw).is_err());
    }
}
