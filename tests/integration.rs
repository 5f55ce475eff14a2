mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use lastmile_dispatch::api::rest::router;
use lastmile_dispatch::models::fleet::VehicleStatus;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use common::{DROPOFF, Harness, PICKUP, harness, seed_vehicle, vehicle_status};

async fn setup() -> (axum::Router, Harness) {
    let h = harness(Duration::from_secs(60)).await;
    (router(h.state.clone()), h)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    empty_request("GET", uri)
}

fn patch_request(uri: &str, body: Value) -> Request<Body> {
    json_request("PATCH", uri, body)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn order_body(weight_kg: f64) -> Value {
    json!({
        "customer_id": Uuid::new_v4(),
        "pickup_location": {
            "latitude": PICKUP.0,
            "longitude": PICKUP.1,
            "address": "Siam Square, Bangkok"
        },
        "dropoff_location": {
            "latitude": DROPOFF.0,
            "longitude": DROPOFF.1,
            "address": "Lumphini Park, Bangkok"
        },
        "package_details": { "weight_kg": weight_kg }
    })
}

async fn create_order(app: &axum::Router, weight_kg: f64) -> Value {
    let response = app
        .clone()
        .oneshot(json_request("POST", "/orders", order_body(weight_kg)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _h) = setup().await;
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["broker_connected"], true);
    assert_eq!(body["orders"], 0);
    assert_eq!(body["matching_attempts"], 0);
}

#[tokio::test]
async fn health_reports_degraded_broker() {
    let (app, h) = setup().await;
    h.broker.disconnect();

    let body = body_json(app.oneshot(get_request("/health")).await.unwrap()).await;

    assert_eq!(body["status"], "degraded");
    assert_eq!(body["broker_connected"], false);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _h) = setup().await;
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("active_offers"));
}

#[tokio::test]
async fn create_order_quotes_price() {
    let (app, h) = setup().await;
    let body = create_order(&app, 5.0).await;

    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["payment_method"], "CASH");
    assert_eq!(body["payment_status"], "PENDING");
    assert!(body["price"].as_f64().unwrap() > 0.0);
    assert!(body["distance_km"].as_f64().unwrap() > 0.0);
    assert!(body["vehicle_id"].is_null());

    let created = common::events_named(&h.broker, "ORDER_CREATED");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["data"]["orderId"], body["id"]);
}

#[tokio::test]
async fn create_order_rejects_invalid_fields() {
    let (app, _h) = setup().await;
    let mut body = order_body(0.0);
    body["pickup_location"]["latitude"] = json!(123.0);

    let response = app
        .oneshot(json_request("POST", "/orders", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    let fields = body["fields"].as_array().unwrap();
    assert_eq!(fields.len(), 2);
}

#[tokio::test]
async fn malformed_json_returns_400() {
    let (app, _h) = setup().await;
    let request = Request::builder()
        .method("POST")
        .uri("/orders")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "validation failed");
}

#[tokio::test]
async fn unknown_order_returns_404() {
    let (app, _h) = setup().await;
    let uri = format!("/orders/{}", Uuid::new_v4());

    let response = app.oneshot(get_request(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_order_includes_history() {
    let (app, _h) = setup().await;
    let order = create_order(&app, 5.0).await;
    let id = order["id"].as_str().unwrap();

    let body = body_json(
        app.oneshot(get_request(&format!("/orders/{id}")))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(body["id"], order["id"]);
    let history = body["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["status"], "PENDING");
}

#[tokio::test]
async fn confirm_offers_the_nearest_driver() {
    let (app, h) = setup().await;
    let (near_driver, _) = seed_vehicle(&h.directory, (PICKUP.0 + 0.005, PICKUP.1), 100.0).await;
    seed_vehicle(&h.directory, (PICKUP.0 + 0.03, PICKUP.1), 100.0).await;
    let order = create_order(&app, 5.0).await;
    let id = order["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(empty_request("POST", &format!("/orders/{id}/confirm")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["order"]["status"], "MATCHING");
    assert_eq!(body["matching"]["candidates"], 2);
    assert_eq!(body["matching"]["offer"]["status"], "PENDING");
    assert_eq!(body["matching"]["offer"]["driver_id"], json!(near_driver.id));

    let attempts = body_json(
        app.oneshot(get_request(&format!("/orders/{id}/matching")))
            .await
            .unwrap(),
    )
    .await;
    let statuses: Vec<_> = attempts
        .as_array()
        .unwrap()
        .iter()
        .map(|attempt| attempt["status"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(statuses, vec!["PENDING", "QUEUED"]);
}

#[tokio::test]
async fn accept_matches_order_and_second_accept_is_rejected() {
    let (app, h) = setup().await;
    let (_, vehicle) = seed_vehicle(&h.directory, (PICKUP.0 + 0.005, PICKUP.1), 100.0).await;
    let order = create_order(&app, 5.0).await;
    let id = order["id"].as_str().unwrap();

    let started = body_json(
        app.clone()
            .oneshot(empty_request("POST", &format!("/matching/{id}/start")))
            .await
            .unwrap(),
    )
    .await;
    let matching_id = started["offer"]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(empty_request("POST", &format!("/matching/{matching_id}/accept")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["order_status"], "MATCHED");
    assert_eq!(body["matching"]["status"], "ACCEPTED");
    assert_eq!(vehicle_status(&h.directory, vehicle.id).await, VehicleStatus::Assigned);

    let again = app
        .clone()
        .oneshot(empty_request("POST", &format!("/matching/{matching_id}/accept")))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);

    let order = body_json(
        app.oneshot(get_request(&format!("/orders/{id}")))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(order["status"], "MATCHED");
    assert_eq!(order["vehicle_id"], json!(vehicle.id));
}

#[tokio::test]
async fn rejecting_every_offer_returns_order_to_confirmed() {
    let (app, h) = setup().await;
    seed_vehicle(&h.directory, (PICKUP.0 + 0.005, PICKUP.1), 100.0).await;
    let order = create_order(&app, 5.0).await;
    let id = order["id"].as_str().unwrap();

    let started = body_json(
        app.clone()
            .oneshot(empty_request("POST", &format!("/orders/{id}/confirm")))
            .await
            .unwrap(),
    )
    .await;
    let matching_id = started["matching"]["offer"]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/matching/{matching_id}/reject"),
            json!({ "reason": "too far" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["order_status"], "CONFIRMED");
    assert_eq!(body["matching"]["reason"], "too far");

    let history = body_json(
        app.oneshot(get_request(&format!("/orders/{id}/history")))
            .await
            .unwrap(),
    )
    .await;
    let last = history.as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["status"], "CONFIRMED");
    assert_eq!(last["note"], "All drivers rejected the order");
}

#[tokio::test]
async fn reject_without_body_uses_default_reason() {
    let (app, h) = setup().await;
    seed_vehicle(&h.directory, (PICKUP.0 + 0.005, PICKUP.1), 100.0).await;
    let order = create_order(&app, 5.0).await;
    let id = order["id"].as_str().unwrap();
    let started = body_json(
        app.clone()
            .oneshot(empty_request("POST", &format!("/matching/{id}/start")))
            .await
            .unwrap(),
    )
    .await;
    let matching_id = started["offer"]["id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(empty_request("POST", &format!("/matching/{matching_id}/reject")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["matching"]["status"], "REJECTED");
    assert_eq!(body["matching"]["reason"], "rejected by driver");
}

#[tokio::test]
async fn unknown_matching_returns_404() {
    let (app, _h) = setup().await;
    let uri = format!("/matching/{}/accept", Uuid::new_v4());

    let response = app.oneshot(empty_request("POST", &uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_twice_returns_400() {
    let (app, _h) = setup().await;
    let order = create_order(&app, 5.0).await;
    let id = order["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{id}/cancel"),
            json!({ "reason": "ordered by mistake" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "CANCELLED");

    let again = app
        .oneshot(empty_request("POST", &format!("/orders/{id}/cancel")))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn illegal_status_change_reports_both_ends() {
    let (app, _h) = setup().await;
    let order = create_order(&app, 5.0).await;
    let id = order["id"].as_str().unwrap();

    let response = app
        .oneshot(patch_request(
            &format!("/orders/{id}/status"),
            json!({ "status": "DELIVERED" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["from"], "PENDING");
    assert_eq!(body["to"], "DELIVERED");
}

#[tokio::test]
async fn status_can_move_pending_to_confirmed_manually() {
    let (app, _h) = setup().await;
    let order = create_order(&app, 5.0).await;
    let id = order["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(patch_request(
            &format!("/orders/{id}/status"),
            json!({ "status": "CONFIRMED", "note": "confirmed by phone" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "CONFIRMED");

    let matching = app
        .oneshot(patch_request(
            &format!("/orders/{id}/status"),
            json!({ "status": "MATCHING" }),
        ))
        .await
        .unwrap();
    assert_eq!(matching.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn instant_matching_claims_a_vehicle() {
    let (app, h) = setup().await;
    let (_, vehicle) = seed_vehicle(&h.directory, (PICKUP.0 + 0.005, PICKUP.1), 100.0).await;
    let order = create_order(&app, 5.0).await;
    let id = order["id"].as_str().unwrap();

    let response = app
        .oneshot(empty_request("POST", &format!("/instant-matching/{id}")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["matched"], true);
    assert_eq!(body["result"]["vehicle_id"], json!(vehicle.id));
    assert_eq!(body["result"]["algorithm"], "utilization");
}

#[tokio::test]
async fn instant_matching_without_vehicles_reports_no_match() {
    let (app, _h) = setup().await;
    let order = create_order(&app, 5.0).await;
    let id = order["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(empty_request("POST", &format!("/instant-matching/{id}")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["matched"], false);
    assert!(body["result"].is_null());

    let order = body_json(
        app.oneshot(get_request(&format!("/orders/{id}")))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(order["status"], "CONFIRMED");
}

#[tokio::test]
async fn batch_matching_reports_successes_and_failures() {
    let (app, h) = setup().await;
    seed_vehicle(&h.directory, (PICKUP.0 + 0.005, PICKUP.1), 100.0).await;
    let order = create_order(&app, 5.0).await;
    let missing = Uuid::new_v4();

    let response = app
        .oneshot(json_request(
            "POST",
            "/instant-matching",
            json!({ "order_ids": [order["id"], missing] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["successful"].as_array().unwrap().len(), 1);
    let failed = body["failed"].as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["order_id"], json!(missing));
}

#[tokio::test]
async fn batch_matching_rejects_empty_list() {
    let (app, _h) = setup().await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/instant-matching",
            json!({ "order_ids": [] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn fleet_registration_and_listing() {
    let (app, _h) = setup().await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/drivers",
            json!({
                "name": "Somchai",
                "location": { "latitude": PICKUP.0, "longitude": PICKUP.1 },
                "rating": 9.9
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let driver = body_json(response).await;
    assert_eq!(driver["status"], "ACTIVE");
    assert_eq!(driver["rating"], 5.0);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/vehicles",
            json!({
                "driver_id": driver["id"],
                "plate_number": "2CD-6789",
                "vehicle_type": "pickup",
                "max_weight_kg": 800.0,
                "max_volume_m3": 3.0,
                "length_m": 2.0,
                "width_m": 1.5,
                "height_m": 1.0
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let vehicle = body_json(response).await;
    assert_eq!(vehicle["status"], "AVAILABLE");
    let vehicle_id = vehicle["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(patch_request(
            &format!("/vehicles/{vehicle_id}/status"),
            json!({ "status": "MAINTENANCE" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let vehicles = body_json(app.clone().oneshot(get_request("/vehicles")).await.unwrap()).await;
    assert_eq!(vehicles.as_array().unwrap().len(), 1);
    assert_eq!(vehicles[0]["status"], "MAINTENANCE");

    let drivers = body_json(app.oneshot(get_request("/drivers")).await.unwrap()).await;
    assert_eq!(drivers.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn vehicle_for_unknown_driver_returns_404() {
    let (app, _h) = setup().await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/vehicles",
            json!({
                "driver_id": Uuid::new_v4(),
                "plate_number": "3EF-0001",
                "vehicle_type": "motorcycle",
                "max_weight_kg": 30.0,
                "max_volume_m3": 0.2,
                "length_m": 0.5,
                "width_m": 0.4,
                "height_m": 0.4
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn driver_location_update_validates_coordinates() {
    let (app, h) = setup().await;
    let (driver, _) = seed_vehicle(&h.directory, PICKUP, 100.0).await;

    let response = app
        .clone()
        .oneshot(patch_request(
            &format!("/drivers/{}/location", driver.id),
            json!({ "location": { "latitude": 95.0, "longitude": 100.0 } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(patch_request(
            &format!("/drivers/{}/location", driver.id),
            json!({ "location": { "latitude": 13.8, "longitude": 100.6 } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["current_location"]["latitude"], 13.8);
}
