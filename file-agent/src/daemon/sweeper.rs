//! Periodic reaping of abandoned chunk sessions.

use crate::service::FileMutationService;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn start_session_sweeper(
    service: FileMutationService,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; nothing can be stale at startup
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match service.sweep_expired_sessions().await {
                        Ok(0) => debug!("No expired chunk sessions"),
                        Ok(n) => info!("Reaped {} expired chunk session(s)", n),
                        Err(e) => warn!("Chunk session sweep failed: {}", e),
                    }
                }
            }
        }
        debug!("Session sweeper stopped");
    })
}
