use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::matching::MatchingStatus;
use crate::models::order::OrderStatus;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: OrderStatus, to: OrderStatus },

    #[error("cannot cancel order with status {0}")]
    CannotCancel(OrderStatus),

    #[error("matching {matching_id} already resolved as {status}")]
    AlreadyResolved {
        matching_id: Uuid,
        status: MatchingStatus,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn order_not_found(id: Uuid) -> Self {
        AppError::NotFound(format!("order {id} not found"))
    }

    pub fn matching_not_found(id: Uuid) -> Self {
        AppError::NotFound(format!("matching {id} not found"))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(vec![rejection.body_text()])
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_)
            | AppError::InvalidState(_)
            | AppError::InvalidStatusTransition { .. }
            | AppError::CannotCancel(_)
            | AppError::AlreadyResolved { .. } => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            AppError::Validation(fields) => json!({
                "error": "validation failed",
                "fields": fields,
            }),
            AppError::InvalidStatusTransition { from, to } => json!({
                "error": self.to_string(),
                "from": from,
                "to": to,
            }),
            other => json!({
                "error": other.to_string()
            }),
        };

        (status, Json(body)).into_response()
    }
}
