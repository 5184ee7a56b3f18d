//! In-memory lease backend.
//!
//! Replicas sharing one instance through an `Arc` compete for the same
//! leases, which is how multi-replica behaviour is exercised in tests and in
//! single-process deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{LeaseBackend, LeadershipResult, RenewalResult};
use crate::errors::LeaseError;

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    token: String,
    expires_at: DateTime<Utc>,
}

/// In-memory [`LeaseBackend`].
#[derive(Debug)]
pub struct InMemoryLeaseBackend {
    leases: RwLock<HashMap<String, Lease>>,
    lease_duration: Duration,
}

impl Default for InMemoryLeaseBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

impl InMemoryLeaseBackend {
    /// Creates a backend handing out leases of `lease_duration`.
    #[must_use]
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            lease_duration,
        }
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(15))
    }

    fn generate_token() -> String {
        crate::utils::generate_uuid().to_string()
    }
}

#[async_trait]
impl LeaseBackend for InMemoryLeaseBackend {
    async fn try_acquire(
        &self,
        lease_name: &str,
        holder: &str,
    ) -> Result<LeadershipResult, LeaseError> {
        let mut leases = self.leases.write();
        let now = Utc::now();

        if let Some(lease) = leases.get(lease_name) {
            if lease.expires_at > now && lease.holder != holder {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(lease.holder.clone()),
                });
            }
        }

        let lease = Lease {
            holder: holder.to_string(),
            token: Self::generate_token(),
            expires_at: self.expiry(now),
        };
        let token = lease.token.clone();
        leases.insert(lease_name.to_string(), lease);
        drop(leases);

        Ok(LeadershipResult::Acquired {
            lease_token: token,
            lease_duration: self.lease_duration,
        })
    }

    async fn renew(
        &self,
        lease_name: &str,
        lease_token: &str,
    ) -> Result<RenewalResult, LeaseError> {
        let mut leases = self.leases.write();
        let now = Utc::now();
        let expiry = self.expiry(now);

        let Some(lease) = leases.get_mut(lease_name) else {
            return Ok(RenewalResult::Lost);
        };
        if lease.token != lease_token {
            return Ok(RenewalResult::InvalidToken);
        }
        if lease.expires_at <= now {
            return Ok(RenewalResult::Lost);
        }

        lease.expires_at = expiry;
        drop(leases);
        Ok(RenewalResult::Renewed {
            lease_duration: self.lease_duration,
        })
    }

    async fn release(&self, lease_name: &str, lease_token: &str) -> Result<bool, LeaseError> {
        let mut leases = self.leases.write();
        match leases.get(lease_name) {
            Some(lease) if lease.token == lease_token => {
                leases.remove(lease_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_leader(&self, lease_name: &str) -> Result<Option<String>, LeaseError> {
        let now = Utc::now();
        Ok(self
            .leases
            .read()
            .get(lease_name)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder.clone()))
    }
}
