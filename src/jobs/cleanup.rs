//! Spend window cleanup worker.
//!
//! Periodically purges stored spend windows older than the retention horizon
//! and drops in-memory windows for callers that have gone quiet.

use std::{sync::Arc, time::Instant};

use crate::{db::DbResult, limiter::PersistentLimiter};

/// Results from a single cleanup run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupRunResult {
    /// Stored rows deleted.
    pub rows_deleted: u64,
    /// Callers still tracked in memory after the run.
    pub tracked_keys: usize,
    pub duration_ms: u64,
}

/// Starts the cleanup worker. Runs until the task is aborted.
pub async fn start_spend_cleanup_worker(limiter: Arc<PersistentLimiter>, interval_secs: u64) {
    if interval_secs == 0 {
        tracing::info!("Spend cleanup worker disabled by configuration");
        return;
    }

    tracing::info!(interval_secs, "Starting spend cleanup worker");
    let interval = std::time::Duration::from_secs(interval_secs);

    loop {
        tokio::time::sleep(interval).await;

        if limiter.is_closed() {
            tracing::debug!("Spend store closed, stopping cleanup worker");
            return;
        }

        match run_spend_cleanup(&limiter).await {
            Ok(result) if result.rows_deleted > 0 => {
                tracing::info!(
                    rows_deleted = result.rows_deleted,
                    tracked_keys = result.tracked_keys,
                    duration_ms = result.duration_ms,
                    "Spend cleanup run complete"
                );
            }
            Ok(result) => {
                tracing::debug!(
                    tracked_keys = result.tracked_keys,
                    "Spend cleanup run complete, nothing to purge"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Error running spend cleanup");
            }
        }
    }
}

/// Run a single cleanup pass.
pub async fn run_spend_cleanup(limiter: &PersistentLimiter) -> DbResult<CleanupRunResult> {
    let start = Instant::now();
    let rows_deleted = limiter.run_cleanup().await?;
    Ok(CleanupRunResult {
        rows_deleted,
        tracked_keys: limiter.limiter().tracked_keys(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}
