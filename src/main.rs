use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use lastmile_dispatch::api;
use lastmile_dispatch::config::{Config, LogFormat};
use lastmile_dispatch::engine::{dispatch, timers};
use lastmile_dispatch::error::AppError;
use lastmile_dispatch::gateway::consumers;
use lastmile_dispatch::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Compact => subscriber.compact().init(),
    }

    let (app_state, expired_rx) = AppState::new(config.dispatch.clone());
    let shared_state = Arc::new(app_state);

    shared_state.gateway.start().await?;

    tokio::spawn(timers::run_expiry_worker(shared_state.clone(), expired_rx));
    let consumer_tasks = consumers::spawn_consumers(&shared_state);

    let recovered = dispatch::recover_pending_offers(&shared_state).await;
    tracing::info!(
        expired = recovered.expired,
        rearmed = recovered.rearmed,
        resumed = recovered.resumed,
        unpublished = recovered.unpublished,
        "startup recovery finished"
    );
    tokio::spawn(dispatch::run_recovery_sweeper(shared_state.clone()));

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        ranking = %config.dispatch.ranking,
        offer_ttl_secs = config.dispatch.offer_ttl.as_secs(),
        "http server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    for task in consumer_tasks {
        task.abort();
    }
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
