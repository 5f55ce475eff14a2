use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{patch, post};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::extract::AppJson;
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::fleet::{Driver, DriverStatus, Vehicle, VehicleStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(create_driver).get(list_drivers))
        .route("/drivers/:id/status", patch(update_driver_status))
        .route("/drivers/:id/location", patch(update_driver_location))
        .route("/vehicles", post(create_vehicle).get(list_vehicles))
        .route("/vehicles/:id/status", patch(update_vehicle_status))
}

#[derive(Deserialize)]
pub struct CreateDriverRequest {
    pub name: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default = "default_rating")]
    pub rating: f64,
}

fn default_rating() -> f64 {
    5.0
}

#[derive(Deserialize)]
pub struct CreateVehicleRequest {
    pub driver_id: Uuid,
    pub plate_number: String,
    pub vehicle_type: String,
    pub max_weight_kg: f64,
    pub max_volume_m3: f64,
    pub length_m: f64,
    pub width_m: f64,
    pub height_m: f64,
}

#[derive(Deserialize)]
pub struct DriverStatusRequest {
    pub status: DriverStatus,
}

#[derive(Deserialize)]
pub struct VehicleStatusRequest {
    pub status: VehicleStatus,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

async fn create_driver(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<CreateDriverRequest>,
) -> Result<(StatusCode, Json<Driver>), AppError> {
    let mut errors = Vec::new();
    if payload.name.trim().is_empty() {
        errors.push("name cannot be empty".to_string());
    }
    if payload.location.is_some_and(|location| !location.is_valid()) {
        errors.push("location coordinates are out of range".to_string());
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    let driver = Driver {
        id: Uuid::new_v4(),
        name: payload.name,
        status: DriverStatus::Active,
        current_location: payload.location,
        rating: payload.rating.clamp(0.0, 5.0),
        updated_at: Utc::now(),
    };

    let driver = state.directory.upsert_driver(driver).await?;
    Ok((StatusCode::CREATED, Json(driver)))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Driver>>, AppError> {
    Ok(Json(state.directory.list_drivers().await?))
}

async fn update_driver_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    AppJson(payload): AppJson<DriverStatusRequest>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(state.directory.set_driver_status(id, payload.status).await?))
}

async fn update_driver_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    AppJson(payload): AppJson<UpdateLocationRequest>,
) -> Result<Json<Driver>, AppError> {
    if !payload.location.is_valid() {
        return Err(AppError::Validation(vec![
            "location coordinates are out of range".to_string(),
        ]));
    }
    Ok(Json(
        state
            .directory
            .set_driver_location(id, payload.location)
            .await?,
    ))
}

async fn create_vehicle(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<CreateVehicleRequest>,
) -> Result<(StatusCode, Json<Vehicle>), AppError> {
    let mut errors = Vec::new();
    if payload.plate_number.trim().is_empty() {
        errors.push("plate_number cannot be empty".to_string());
    }
    for (field, value) in [
        ("max_weight_kg", payload.max_weight_kg),
        ("max_volume_m3", payload.max_volume_m3),
        ("length_m", payload.length_m),
        ("width_m", payload.width_m),
        ("height_m", payload.height_m),
    ] {
        if !(value.is_finite() && value > 0.0) {
            errors.push(format!("{field} must be > 0"));
        }
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    if state.directory.driver(payload.driver_id).await?.is_none() {
        return Err(AppError::NotFound(format!(
            "driver {} not found",
            payload.driver_id
        )));
    }

    let vehicle = Vehicle {
        id: Uuid::new_v4(),
        driver_id: payload.driver_id,
        plate_number: payload.plate_number,
        vehicle_type: payload.vehicle_type,
        max_weight_kg: payload.max_weight_kg,
        max_volume_m3: payload.max_volume_m3,
        length_m: payload.length_m,
        width_m: payload.width_m,
        height_m: payload.height_m,
        status: VehicleStatus::Available,
        updated_at: Utc::now(),
    };

    let vehicle = state.directory.upsert_vehicle(vehicle).await?;
    Ok((StatusCode::CREATED, Json(vehicle)))
}

async fn list_vehicles(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Vehicle>>, AppError> {
    Ok(Json(state.directory.list_vehicles().await?))
}

async fn update_vehicle_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    AppJson(payload): AppJson<VehicleStatusRequest>,
) -> Result<Json<Vehicle>, AppError> {
    Ok(Json(state.directory.set_vehicle_status(id, payload.status).await?))
}
