//! Test doubles for leader duties and the state store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::errors::{ConflictKind, StoreError};
use crate::execution::{ConcurrencyKey, Expectation, SequenceExecution, SequenceState};
use crate::leader::LeaderDuties;
use crate::store::{Mutation, OutboundEvent, SequenceStateStore};

/// Leader duties that do nothing but record their terms.
#[derive(Debug, Default)]
pub struct RecordingDuties {
    active: AtomicUsize,
    max_active: AtomicUsize,
    terms: AtomicUsize,
    last_reason: Mutex<Option<String>>,
}

impl RecordingDuties {
    /// Creates a recorder with no terms.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of terms currently running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns the highest number of concurrently running terms seen.
    #[must_use]
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Returns the number of terms started.
    #[must_use]
    pub fn terms(&self) -> usize {
        self.terms.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason of the last finished term.
    #[must_use]
    pub fn last_reason(&self) -> Option<String> {
        self.last_reason.lock().clone()
    }
}

#[async_trait]
impl LeaderDuties for RecordingDuties {
    async fn run(&self, scope: Arc<CancellationToken>) {
        self.terms.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        scope.cancelled().await;

        *self.last_reason.lock() = scope.reason();
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Store wrapper that rejects the next N compare-and-updates with
/// [`ConflictKind::StateChanged`].
pub struct ConflictInjectingStore {
    inner: Arc<dyn SequenceStateStore>,
    conflicts_remaining: AtomicUsize,
    conflicts_injected: AtomicUsize,
}

impl std::fmt::Debug for ConflictInjectingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictInjectingStore")
            .field("conflicts_remaining", &self.conflicts_remaining)
            .finish_non_exhaustive()
    }
}

impl ConflictInjectingStore {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn SequenceStateStore>) -> Self {
        Self {
            inner,
            conflicts_remaining: AtomicUsize::new(0),
            conflicts_injected: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` updates fail.
    pub fn conflict_next(&self, count: usize) {
        self.conflicts_remaining.store(count, Ordering::SeqCst);
    }

    /// Returns how many conflicts were injected.
    #[must_use]
    pub fn injected(&self) -> usize {
        self.conflicts_injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SequenceStateStore for ConflictInjectingStore {
    async fn create(&self, execution: SequenceExecution) -> Result<SequenceExecution, StoreError> {
        self.inner.create(execution).await
    }

    async fn get_by_context(&self, context_id: &str) -> Result<SequenceExecution, StoreError> {
        self.inner.get_by_context(context_id).await
    }

    async fn compare_and_update(
        &self,
        context_id: &str,
        expected: Expectation,
        mutation: Mutation,
    ) -> Result<SequenceExecution, StoreError> {
        let injected = self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.conflicts_injected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::conflict(context_id, ConflictKind::StateChanged));
        }
        self.inner
            .compare_and_update(context_id, expected, mutation)
            .await
    }

    async fn list_by_key_and_state(
        &self,
        key: &ConcurrencyKey,
        state: SequenceState,
    ) -> Result<Vec<SequenceExecution>, StoreError> {
        self.inner.list_by_key_and_state(key, state).await
    }

    async fn list_keys_in_states(
        &self,
        states: &[SequenceState],
    ) -> Result<Vec<ConcurrencyKey>, StoreError> {
        self.inner.list_keys_in_states(states).await
    }

    async fn pending_events_after(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<OutboundEvent>, StoreError> {
        self.inner.pending_events_after(after, limit).await
    }

    async fn ack_event(&self, sequence_no: u64) -> Result<(), StoreError> {
        self.inner.ack_event(sequence_no).await
    }
}
