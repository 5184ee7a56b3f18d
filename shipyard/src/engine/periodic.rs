//! Fixed-interval loop shared by the two dispatchers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;

use crate::cancellation::CancellationToken;
use crate::errors::ShipyardError;

/// Work performed once per tick.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Performs one tick.
    async fn tick(&self) -> Result<(), ShipyardError>;
}

/// Ticks `task` every `interval` until `scope` is cancelled.
///
/// Ticks never overlap. Cancellation is observed between ticks, so a tick in
/// progress always completes.
#[allow(clippy::cast_possible_truncation)]
pub async fn run_periodic(task: &dyn PeriodicTask, interval: Duration, scope: &CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(loop_name = task.name(), interval_ms = interval.as_millis() as u64, "Loop started");

    loop {
        tokio::select! {
            biased;
            () = scope.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = task.tick().await {
            tracing::warn!(loop_name = task.name(), error = %e, "Tick failed");
        }
    }

    tracing::info!(loop_name = task.name(), reason = ?scope.reason(), "Loop stopped");
}
