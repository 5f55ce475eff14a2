use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::directory::{InMemoryDirectory, VehicleDirectory};
use crate::engine::timers::DeadlineTimers;
use crate::gateway::broker::Broker;
use crate::gateway::{EventGateway, InMemoryBroker};
use crate::observability::metrics::Metrics;
use crate::store::Store;

const EXPIRY_QUEUE_SIZE: usize = 1024;

pub struct AppState {
    pub settings: DispatchSettings,
    pub store: Store,
    pub directory: Arc<dyn VehicleDirectory>,
    pub gateway: Arc<EventGateway>,
    pub timers: DeadlineTimers,
    pub metrics: Metrics,
}

impl AppState {
    /// State wired to the in-memory directory and broker. The receiver
    /// carries fired offer deadlines for the expiry worker.
    pub fn new(settings: DispatchSettings) -> (Self, mpsc::Receiver<Uuid>) {
        Self::with_components(
            settings,
            Arc::new(InMemoryDirectory::new()),
            Arc::new(InMemoryBroker::new()),
        )
    }

    pub fn with_components(
        settings: DispatchSettings,
        directory: Arc<dyn VehicleDirectory>,
        broker: Arc<dyn Broker>,
    ) -> (Self, mpsc::Receiver<Uuid>) {
        let (expired_tx, expired_rx) = mpsc::channel(EXPIRY_QUEUE_SIZE);
        let metrics = Metrics::new();
        let gateway = Arc::new(EventGateway::new(
            broker,
            settings.broker_retry.clone(),
            settings.max_redeliveries,
            metrics.clone(),
        ));

        (
            Self {
                settings,
                store: Store::new(),
                directory,
                gateway,
                timers: DeadlineTimers::new(expired_tx),
                metrics,
            },
            expired_rx,
        )
    }
}
