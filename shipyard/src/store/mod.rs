//! Durable state for sequence executions and their outbound events.
//!
//! The store is the only shared state between controller replicas. Every
//! update is a compare-and-update against an [`Expectation`], and the events
//! produced by an update are appended to a transactional outbox in the same
//! atomic step, so a state change and the events announcing it are either both
//! persisted or neither is.
//!
//! Implementations must also enforce that at most one execution per
//! [`ConcurrencyKey`] is `started`: any update moving a record into
//! `started` fails with [`ConflictKind::SlotOccupied`](crate::errors::ConflictKind::SlotOccupied) when another record of
//! the same key already holds the slot.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::event::EventEnvelope;
use crate::execution::{ConcurrencyKey, Expectation, SequenceExecution, SequenceState};

pub use memory::InMemorySequenceStore;

/// A mutation applied to a record under a compare-and-update.
///
/// It returns the events to append to the outbox together with the update.
pub type Mutation = Box<dyn FnOnce(&mut SequenceExecution) -> Vec<EventEnvelope> + Send>;

/// An event waiting in the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    /// Monotonic outbox position.
    pub sequence_no: u64,
    /// Context the event belongs to.
    pub context_id: String,
    /// The event.
    pub envelope: EventEnvelope,
    /// When the event was appended.
    pub enqueued_at: DateTime<Utc>,
}

/// Storage backend for sequence executions.
#[async_trait]
pub trait SequenceStateStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// Fails with [`ConflictKind::AlreadyExists`](crate::errors::ConflictKind::AlreadyExists) if the context ID is taken.
    async fn create(&self, execution: SequenceExecution) -> Result<SequenceExecution, StoreError>;

    /// Reads a record by context ID.
    async fn get_by_context(&self, context_id: &str) -> Result<SequenceExecution, StoreError>;

    /// Applies `mutation` if the record still matches `expected`.
    ///
    /// On success the store bumps the revision, stamps `updated_at`, appends the
    /// returned events to the outbox, and returns the new record. On a
    /// mismatch nothing is written and [`ConflictKind::StateChanged`](crate::errors::ConflictKind::StateChanged) is
    /// returned.
    async fn compare_and_update(
        &self,
        context_id: &str,
        expected: Expectation,
        mutation: Mutation,
    ) -> Result<SequenceExecution, StoreError>;

    /// Lists the records of `key` in `state`, oldest `triggered_at` first.
    async fn list_by_key_and_state(
        &self,
        key: &ConcurrencyKey,
        state: SequenceState,
    ) -> Result<Vec<SequenceExecution>, StoreError>;

    /// Lists the distinct keys having at least one record in any of `states`.
    async fn list_keys_in_states(
        &self,
        states: &[SequenceState],
    ) -> Result<Vec<ConcurrencyKey>, StoreError>;

    /// Returns up to `limit` unacknowledged outbox entries in append order.
    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboundEvent>, StoreError> {
        self.pending_events_after(None, limit).await
    }

    /// Returns up to `limit` unacknowledged outbox entries positioned after
    /// `after`, in append order.
    async fn pending_events_after(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<OutboundEvent>, StoreError>;

    /// Removes an entry from the outbox once it has been published.
    async fn ack_event(&self, sequence_no: u64) -> Result<(), StoreError>;
}
