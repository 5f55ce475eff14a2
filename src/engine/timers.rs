use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::dispatch::{self, Resolution};
use crate::state::AppState;

/// One-shot deadline per outstanding offer. A fired deadline is handed to
/// the expiry worker over a channel; the worker does the actual resolution.
#[derive(Clone)]
pub struct DeadlineTimers {
    handles: Arc<DashMap<Uuid, AbortHandle>>,
    expired_tx: mpsc::Sender<Uuid>,
}

impl DeadlineTimers {
    pub fn new(expired_tx: mpsc::Sender<Uuid>) -> Self {
        Self {
            handles: Arc::new(DashMap::new()),
            expired_tx,
        }
    }

    /// Arms (or re-arms) the deadline for `attempt_id`.
    pub fn arm(&self, attempt_id: Uuid, delay: Duration) {
        let handles = self.handles.clone();
        let expired_tx = self.expired_tx.clone();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            // Wait until the handle is registered so removal below cannot race it.
            let _ = armed_rx.await;
            sleep(delay).await;
            handles.remove(&attempt_id);
            if expired_tx.send(attempt_id).await.is_err() {
                warn!(%attempt_id, "expiry worker is gone, deadline dropped");
            }
        });

        if let Some(previous) = self.handles.insert(attempt_id, task.abort_handle()) {
            previous.abort();
        }
        let _ = armed_tx.send(());
    }

    /// Disarms the deadline. Returns whether one was armed.
    pub fn cancel(&self, attempt_id: Uuid) -> bool {
        match self.handles.remove(&attempt_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, attempt_id: Uuid) -> bool {
        self.handles.contains_key(&attempt_id)
    }

    pub fn armed_count(&self) -> usize {
        self.handles.len()
    }
}

/// Resolves offers whose deadline fired. Each expiry runs on its own task so
/// a slow order never holds up another order's deadline.
pub async fn run_expiry_worker(state: Arc<AppState>, mut expired_rx: mpsc::Receiver<Uuid>) {
    info!("offer expiry worker started");

    while let Some(attempt_id) = expired_rx.recv().await {
        let state = state.clone();
        tokio::spawn(async move {
            match dispatch::expire_attempt(&state, attempt_id).await {
                Ok(Resolution::Applied { .. }) => {}
                Ok(other) => {
                    debug!(%attempt_id, outcome = other.label(), "deadline fired for settled offer");
                }
                Err(err) => {
                    warn!(%attempt_id, error = %err, "failed to expire offer");
                }
            }
        });
    }

    info!("offer expiry worker stopped");
}
