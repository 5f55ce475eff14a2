use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::dispatch::{self, Resolution};
use crate::error::AppError;
use crate::gateway::EventHandler;
use crate::gateway::events::{DriverDecision, InboundEvent, topics};
use crate::orders;
use crate::state::AppState;

/// Routes driver responses to the matching engine and payment outcomes to
/// the order book.
pub struct DispatchEventHandler {
    state: Arc<AppState>,
}

impl DispatchEventHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

/// Errors worth a redelivery. Everything else is final and acked.
fn is_transient(err: &AppError) -> bool {
    matches!(
        err,
        AppError::UpstreamUnavailable(_) | AppError::Internal(_)
    )
}

fn settle(event: &'static str, result: Result<(), AppError>) -> Result<(), AppError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if is_transient(&err) => Err(err),
        Err(err) => {
            warn!(event, error = %err, "event could not be applied, dropping");
            Ok(())
        }
    }
}

#[async_trait]
impl EventHandler for DispatchEventHandler {
    async fn handle(&self, event: InboundEvent) -> Result<(), AppError> {
        let name = event.name();
        let state = &self.state;

        let result = match event {
            InboundEvent::DriverResponse(response) => {
                let resolution = match response.response {
                    DriverDecision::Accept => {
                        dispatch::accept_matching(state, response.matching_id).await
                    }
                    DriverDecision::Reject => {
                        dispatch::reject_matching(state, response.matching_id, response.reason)
                            .await
                    }
                };
                resolution.map(|resolution| {
                    if let Resolution::AlreadyResolved { attempt } = &resolution {
                        info!(
                            matching_id = %attempt.id,
                            status = %attempt.status,
                            "late driver response ignored"
                        );
                    }
                })
            }
            InboundEvent::PaymentCompleted(payment) => {
                orders::record_payment_completed(state, payment.order_id, &payment.transaction_id)
                    .await
                    .map(|_| ())
            }
            InboundEvent::PaymentFailed(payment) => orders::record_payment_failed(
                state,
                payment.order_id,
                payment.transaction_id.as_deref(),
                payment.reason.as_deref(),
            )
            .await
            .map(|_| ()),
        };

        settle(name, result)
    }
}

/// Starts the driver-events and payment-events consumers.
pub fn spawn_consumers(state: &Arc<AppState>) -> Vec<JoinHandle<()>> {
    let handler: Arc<dyn EventHandler> = Arc::new(DispatchEventHandler::new(state.clone()));

    [topics::DRIVER_EVENTS, topics::PAYMENT_EVENTS]
        .into_iter()
        .map(|topic| state.gateway.subscribe(topic, handler.clone()))
        .collect()
}
