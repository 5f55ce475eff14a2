pub mod extract;
pub mod fleet;
pub mod matching;
pub mod orders;

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(orders::router())
        .merge(matching::router())
        .merge(fleet::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    broker_connected: bool,
    orders: usize,
    matching_attempts: usize,
    armed_deadlines: usize,
    unpublished_events: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let broker_connected = state.gateway.is_connected();
    Json(HealthResponse {
        status: if broker_connected { "ok" } else { "degraded" },
        broker_connected,
        orders: state.store.order_count(),
        matching_attempts: state.store.attempt_count(),
        armed_deadlines: state.timers.armed_count(),
        unpublished_events: state.gateway.unpublished_count().await,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
