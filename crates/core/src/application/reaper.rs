// Expiry Reaper - background sweep for unanswered notifications
// Scheduled like a maintenance loop: tick, sweep, occasionally purge

use crate::application::constants::PURGE_EVERY_N_SWEEPS;
use crate::application::{BreakQueue, ShutdownToken};
use crate::domain::BreakRequest;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Expiry reaper
///
/// Expires Notified requests once their window has elapsed. Expiry re-checks
/// status and `notified_at` under the group lock, so it never fires early and
/// a request that was confirmed or postponed in the meantime is left alone.
pub struct ExpiryReaper {
    queue: Arc<BreakQueue>,
    sweep_interval: Duration,
    purge_every: u64,
}

impl ExpiryReaper {
    /// Create a reaper using the queue's configured sweep interval
    pub fn new(queue: Arc<BreakQueue>) -> Self {
        let sweep_interval = queue.config().sweep_interval();
        Self {
            queue,
            sweep_interval,
            purge_every: PURGE_EVERY_N_SWEEPS,
        }
    }

    /// Purge resolved requests every `sweeps` ticks instead of the default
    pub fn with_purge_every(mut self, sweeps: u64) -> Self {
        self.purge_every = sweeps.max(1);
        self
    }

    /// Run reaper loop (background task)
    ///
    /// Should be spawned with tokio::spawn; returns once shutdown is signalled.
    pub async fn run(self, mut shutdown: ShutdownToken) {
        info!(
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            purge_every = self.purge_every,
            "Expiry reaper started"
        );

        let mut tick = interval(self.sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweeps: u64 = 0;

        loop {
            if shutdown.is_shutdown() {
                break;
            }
            tokio::select! {
                _ = tick.tick() => {},
                _ = shutdown.wait() => break,
            }

            if let Err(e) = self.run_once().await {
                error!(error = ?e, "Expiry sweep failed");
            }

            sweeps += 1;
            if sweeps % self.purge_every == 0 {
                if let Err(e) = self.queue.purge_resolved().await {
                    error!(error = ?e, "Resolved request purge failed");
                }
            }
        }

        info!(sweeps = sweeps, "Expiry reaper stopped");
    }

    /// Run a single sweep immediately
    pub async fn run_once(&self) -> Result<Vec<BreakRequest>> {
        let expired = self.queue.sweep_expired().await?;
        for request in &expired {
            info!(
                request_id = %request.id,
                user_id = %request.user_id,
                group = %request.group,
                "Notification expired without answer"
            );
        }
        Ok(expired)
    }
}
