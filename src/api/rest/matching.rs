use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::post;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extract::{AppJson, optional_json};
use crate::engine::dispatch::{self, MatchingStarted};
use crate::engine::instant::{self, BatchMatchResult, InstantMatch};
use crate::error::AppError;
use crate::models::matching::MatchingAttempt;
use crate::models::order::OrderStatus;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/matching/:id/start", post(start_matching))
        .route("/matching/:id/accept", post(accept_matching))
        .route("/matching/:id/reject", post(reject_matching))
        .route("/instant-matching", post(batch_instant_matching))
        .route("/instant-matching/:id", post(instant_matching))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub order_ids: Vec<Uuid>,
}

#[derive(Serialize)]
pub struct ResolutionResponse {
    pub matching: MatchingAttempt,
    pub order_status: OrderStatus,
}

#[derive(Serialize)]
pub struct InstantMatchResponse {
    pub matched: bool,
    pub result: Option<InstantMatch>,
}

async fn start_matching(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<MatchingStarted>, AppError> {
    Ok(Json(dispatch::start_matching(&state, order_id).await?))
}

async fn accept_matching(
    State(state): State<Arc<AppState>>,
    Path(matching_id): Path<Uuid>,
) -> Result<Json<ResolutionResponse>, AppError> {
    let (matching, order_status) = dispatch::accept_matching(&state, matching_id)
        .await?
        .into_result()?;
    Ok(Json(ResolutionResponse {
        matching,
        order_status,
    }))
}

async fn reject_matching(
    State(state): State<Arc<AppState>>,
    Path(matching_id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<ResolutionResponse>, AppError> {
    let payload: RejectRequest = optional_json(&body)?;
    let (matching, order_status) = dispatch::reject_matching(&state, matching_id, payload.reason)
        .await?
        .into_result()?;
    Ok(Json(ResolutionResponse {
        matching,
        order_status,
    }))
}

async fn instant_matching(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<InstantMatchResponse>, AppError> {
    let result = instant::instant_match(&state, order_id).await?;
    Ok(Json(InstantMatchResponse {
        matched: result.is_some(),
        result,
    }))
}

async fn batch_instant_matching(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<BatchRequest>,
) -> Result<Json<BatchMatchResult>, AppError> {
    if payload.order_ids.is_empty() {
        return Err(AppError::Validation(vec![
            "order_ids must not be empty".to_string(),
        ]));
    }
    Ok(Json(instant::batch_match(&state, &payload.order_ids).await))
}
