//! Lease-based leader election.
//!
//! Exactly one replica at a time runs the leader-only duties (the two
//! dispatch loops). Leadership is a lease with a single holder and an expiry:
//!
//! - **Acquire**: a replica becomes leader when the lease is free or expired
//! - **Renew**: the leader extends the lease every retry period
//! - **Release**: on shutdown or loss the leader gives the lease back
//!
//! A leader that dies without releasing is replaced once its lease expires.
//! Nothing is handed over between leaders; the new leader's sequence
//! dispatcher reconciles whatever was in flight.

pub mod election;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::LeaseError;

pub use election::{LeaderDuties, LeaderElection, LeaseConfig};
pub use memory::InMemoryLeaseBackend;

/// Result of a leadership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    /// Successfully acquired leadership.
    Acquired {
        /// Lease token that must be used for renewal.
        lease_token: String,
        /// Duration until the lease expires.
        lease_duration: Duration,
    },
    /// Leadership is held by another instance.
    NotLeader {
        /// Identifier of the current leader, if known.
        current_leader: Option<String>,
    },
}

impl LeadershipResult {
    /// Returns true if leadership was acquired.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    /// Returns the lease token if leadership was acquired.
    #[must_use]
    pub fn lease_token(&self) -> Option<&str> {
        match self {
            Self::Acquired { lease_token, .. } => Some(lease_token),
            Self::NotLeader { .. } => None,
        }
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    /// Successfully renewed the lease.
    Renewed {
        /// New lease duration.
        lease_duration: Duration,
    },
    /// Lease has expired or was taken by another holder.
    Lost,
    /// The provided lease token is invalid.
    InvalidToken,
}

impl RenewalResult {
    /// Returns true if the lease was successfully renewed.
    #[must_use]
    pub const fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

/// The cluster lease resource.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Attempts to take the lease `lease_name` for `holder`.
    async fn try_acquire(
        &self,
        lease_name: &str,
        holder: &str,
    ) -> Result<LeadershipResult, LeaseError>;

    /// Extends a held lease.
    async fn renew(&self, lease_name: &str, lease_token: &str)
        -> Result<RenewalResult, LeaseError>;

    /// Gives up a held lease. Returns false if it was no longer held.
    async fn release(&self, lease_name: &str, lease_token: &str) -> Result<bool, LeaseError>;

    /// Returns the current holder, if the lease is held and unexpired.
    async fn current_leader(&self, lease_name: &str) -> Result<Option<String>, LeaseError>;
}
