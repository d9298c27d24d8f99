//! Periodic liveness sweep.

use crate::coordinator::Coordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::error;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the sweeper task.  The handle is aborted on shutdown.
pub fn spawn(coordinator: Arc<Coordinator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        // The first tick fires immediately; nothing can be stale that early.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = coordinator.sweep_once().await {
                error!(error = %e, "liveness sweep failed");
            }
        }
    })
}
