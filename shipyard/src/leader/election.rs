//! The election loop.
//!
//! Leadership is modelled as a cancellable scope: acquiring the lease creates
//! a fresh [`CancellationToken`] and runs the duties under it, and losing the
//! lease (or shutdown) cancels it. The duties future is driven inside the
//! election future, so dropping or aborting the election stops the duties too.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{LeaseBackend, LeadershipResult, RenewalResult};
use crate::cancellation::CancellationToken;

/// Work performed only while holding the lease.
#[async_trait]
pub trait LeaderDuties: Send + Sync {
    /// Runs until `scope` is cancelled.
    async fn run(&self, scope: Arc<CancellationToken>);
}

/// Lease timings and identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Name of the lease resource.
    pub lease_name: String,
    /// Identity recorded as holder.
    pub identity: String,
    /// How long an unrenewed lease stays valid.
    pub lease_duration: Duration,
    /// How long the leader keeps leading without a successful renewal.
    pub renew_deadline: Duration,
    /// Interval between acquisition attempts and between renewals.
    pub retry_period: Duration,
}

impl LeaseConfig {
    /// Creates a config with the default timings (15s / 10s / 2s).
    #[must_use]
    pub fn new(lease_name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            lease_name: lease_name.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    /// Overrides the timings.
    #[must_use]
    pub const fn with_timings(
        mut self,
        lease_duration: Duration,
        renew_deadline: Duration,
        retry_period: Duration,
    ) -> Self {
        self.lease_duration = lease_duration;
        self.renew_deadline = renew_deadline;
        self.retry_period = retry_period;
        self
    }

    fn jittered_retry(&self) -> Duration {
        self.retry_period
            .mul_f64(1.0 + 0.2 * rand::random::<f64>())
    }
}

/// Runs the acquire / lead / release cycle for one replica.
pub struct LeaderElection {
    config: LeaseConfig,
    backend: Arc<dyn LeaseBackend>,
    duties: Arc<dyn LeaderDuties>,
}

impl std::fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElection")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LeaderElection {
    /// Creates an election for `duties`.
    #[must_use]
    pub fn new(
        config: LeaseConfig,
        backend: Arc<dyn LeaseBackend>,
        duties: Arc<dyn LeaderDuties>,
    ) -> Self {
        Self {
            config,
            backend,
            duties,
        }
    }

    /// Returns the lease config.
    #[must_use]
    pub const fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Competes for leadership until `shutdown` is cancelled.
    ///
    /// Backend failures are logged and retried; they never end the loop.
    pub async fn run(&self, shutdown: Arc<CancellationToken>) {
        let LeaseConfig {
            lease_name,
            identity,
            ..
        } = &self.config;
        tracing::info!(lease = %lease_name, identity = %identity, "Starting leader election");

        while !shutdown.is_cancelled() {
            match self.backend.try_acquire(lease_name, identity).await {
                Ok(LeadershipResult::Acquired { lease_token, .. }) => {
                    self.lead(&lease_token, &shutdown).await;
                }
                Ok(LeadershipResult::NotLeader { current_leader }) => {
                    tracing::debug!(
                        lease = %lease_name,
                        current_leader = ?current_leader,
                        "Lease held by another replica"
                    );
                }
                Err(e) => {
                    tracing::warn!(lease = %lease_name, error = %e, "Failed to acquire lease");
                }
            }

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.jittered_retry()) => {}
            }
        }
        tracing::info!(lease = %lease_name, identity = %identity, "Leader election stopped");
    }

    async fn lead(&self, lease_token: &str, shutdown: &CancellationToken) {
        let LeaseConfig {
            lease_name,
            identity,
            ..
        } = &self.config;
        let scope = CancellationToken::child_of(shutdown);
        tracing::info!(lease = %lease_name, identity = %identity, "Acquired leadership");

        let duties = async {
            self.duties.run(Arc::clone(&scope)).await;
            scope.cancel("leader duties exited");
        };
        let renewals = self.keep_renewed(lease_token, &scope);
        tokio::join!(duties, renewals);

        tracing::info!(
            lease = %lease_name,
            identity = %identity,
            reason = ?scope.reason(),
            "Leadership ended"
        );
        match self.backend.release(lease_name, lease_token).await {
            Ok(true) => tracing::debug!(lease = %lease_name, "Released lease"),
            Ok(false) => tracing::debug!(lease = %lease_name, "Lease was no longer held"),
            Err(e) => tracing::warn!(lease = %lease_name, error = %e, "Failed to release lease"),
        }
    }

    async fn keep_renewed(&self, lease_token: &str, scope: &CancellationToken) {
        let lease_name = &self.config.lease_name;
        let mut last_renewed = Instant::now();

        loop {
            tokio::select! {
                biased;
                () = scope.cancelled() => return,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }

            let attempt =
                tokio::time::timeout(self.config.renew_deadline, self.backend.renew(lease_name, lease_token))
                    .await;
            match attempt {
                Ok(Ok(RenewalResult::Renewed { .. })) => last_renewed = Instant::now(),
                Ok(Ok(RenewalResult::Lost | RenewalResult::InvalidToken)) => {
                    tracing::warn!(lease = %lease_name, "Lease lost");
                    scope.cancel("lease lost");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(lease = %lease_name, error = %e, "Lease renewal failed");
                }
                Err(_) => {
                    tracing::warn!(lease = %lease_name, "Lease renewal timed out");
                }
            }

            if last_renewed.elapsed() >= self.config.renew_deadline {
                tracing::warn!(lease = %lease_name, "Renew deadline exceeded");
                scope.cancel("renew deadline exceeded");
                return;
            }
        }
    }
}
