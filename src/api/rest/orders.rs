use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extract::{AppJson, optional_json};
use crate::error::AppError;
use crate::models::matching::MatchingAttempt;
use crate::models::order::{Order, OrderStatus, StatusHistoryEntry};
use crate::orders::{self, ConfirmedOrder, NewOrder};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/history", get(order_history))
        .route("/orders/:id/matching", get(order_matching))
        .route("/orders/:id/confirm", post(confirm_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/status", patch(update_order_status))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Serialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub history: Vec<StatusHistoryEntry>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<NewOrder>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let order = orders::create_order(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetails>, AppError> {
    let order = orders::get_order(&state, id)?;
    let history = state.store.history(id);
    Ok(Json(OrderDetails { order, history }))
}

async fn order_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StatusHistoryEntry>>, AppError> {
    Ok(Json(orders::order_history(&state, id)?))
}

async fn order_matching(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<MatchingAttempt>>, AppError> {
    Ok(Json(orders::matching_attempts(&state, id)?))
}

async fn confirm_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConfirmedOrder>, AppError> {
    Ok(Json(orders::confirm_order(&state, id).await?))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<Order>, AppError> {
    let payload: CancelRequest = optional_json(&body)?;
    Ok(Json(orders::cancel_order(&state, id, payload.reason).await?))
}

async fn update_order_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    AppJson(payload): AppJson<UpdateStatusRequest>,
) -> Result<Json<Order>, AppError> {
    let order = orders::update_status(&state, id, payload.status, payload.note).await?;
    Ok(Json(order))
}
