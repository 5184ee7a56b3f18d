//! In-memory sequence state store.
//!
//! All records and the outbox live behind one lock, which makes every
//! compare-and-update (including its outbox append and the started-slot
//! check) trivially atomic. State is lost when the process exits; replicas
//! sharing an instance through an `Arc` behave like replicas sharing a
//! database.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{Mutation, OutboundEvent, SequenceStateStore};
use crate::errors::{ConflictKind, StoreError};
use crate::execution::{ConcurrencyKey, Expectation, SequenceExecution, SequenceState};

#[derive(Debug)]
struct StoredExecution {
    insertion: u64,
    execution: SequenceExecution,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, StoredExecution>,
    outbox: BTreeMap<u64, OutboundEvent>,
    next_insertion: u64,
    next_outbox: u64,
}

impl Inner {
    fn slot_holder(&self, key: &ConcurrencyKey, except: &str) -> Option<&str> {
        self.records
            .values()
            .map(|stored| &stored.execution)
            .find(|e| e.state == SequenceState::Started && e.context_id != except && e.key() == *key)
            .map(|e| e.context_id.as_str())
    }
}

/// In-memory [`SequenceStateStore`].
#[derive(Debug, Default)]
pub struct InMemorySequenceStore {
    inner: Mutex<Inner>,
}

impl InMemorySequenceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every record, in insertion order.
    #[must_use]
    pub fn list_all(&self) -> Vec<SequenceExecution> {
        let inner = self.inner.lock();
        let mut stored: Vec<_> = inner.records.values().collect();
        stored.sort_by_key(|s| s.insertion);
        stored.into_iter().map(|s| s.execution.clone()).collect()
    }

    /// Returns how many records of `key` are `started`.
    #[must_use]
    pub fn started_count(&self, key: &ConcurrencyKey) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|s| s.execution.state == SequenceState::Started && s.execution.key() == *key)
            .count()
    }

    /// Returns the number of unacknowledged outbox entries.
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.inner.lock().outbox.len()
    }
}

#[async_trait]
impl SequenceStateStore for InMemorySequenceStore {
    async fn create(&self, execution: SequenceExecution) -> Result<SequenceExecution, StoreError> {
        let mut inner = self.inner.lock();
        if inner.records.contains_key(&execution.context_id) {
            return Err(StoreError::conflict(
                execution.context_id,
                ConflictKind::AlreadyExists,
            ));
        }
        if execution.state == SequenceState::Started {
            if let Some(holder) = inner.slot_holder(&execution.key(), &execution.context_id) {
                tracing::debug!(holder = %holder, "Create rejected, slot occupied");
                return Err(StoreError::conflict(
                    execution.context_id,
                    ConflictKind::SlotOccupied,
                ));
            }
        }

        let insertion = inner.next_insertion;
        inner.next_insertion += 1;
        inner.records.insert(
            execution.context_id.clone(),
            StoredExecution {
                insertion,
                execution: execution.clone(),
            },
        );
        drop(inner);
        Ok(execution)
    }

    async fn get_by_context(&self, context_id: &str) -> Result<SequenceExecution, StoreError> {
        self.inner
            .lock()
            .records
            .get(context_id)
            .map(|s| s.execution.clone())
            .ok_or_else(|| StoreError::NotFound(context_id.to_string()))
    }

    async fn compare_and_update(
        &self,
        context_id: &str,
        expected: Expectation,
        mutation: Mutation,
    ) -> Result<SequenceExecution, StoreError> {
        let mut inner = self.inner.lock();

        let current = inner
            .records
            .get(context_id)
            .map(|s| s.execution.clone())
            .ok_or_else(|| StoreError::NotFound(context_id.to_string()))?;

        if current.state.is_terminal()
            || current.state != expected.state
            || current.revision != expected.revision
        {
            return Err(StoreError::conflict(context_id, ConflictKind::StateChanged));
        }

        let mut updated = current.clone();
        let events = mutation(&mut updated);

        if updated.context_id != current.context_id || updated.key() != current.key() {
            return Err(StoreError::Backend(format!(
                "update of '{context_id}' must not change its identity"
            )));
        }
        if updated.cursor < current.cursor {
            return Err(StoreError::Backend(format!(
                "task cursor of '{context_id}' must not move backwards ({} -> {})",
                current.cursor, updated.cursor
            )));
        }
        if updated.state == SequenceState::Started && current.state != SequenceState::Started {
            if let Some(holder) = inner.slot_holder(&updated.key(), context_id) {
                tracing::debug!(
                    context_id = %context_id,
                    holder = %holder,
                    "Start rejected, slot occupied"
                );
                return Err(StoreError::conflict(context_id, ConflictKind::SlotOccupied));
            }
        }

        updated.revision = current.revision + 1;
        updated.updated_at = Utc::now();

        let now = Utc::now();
        for envelope in events {
            let sequence_no = inner.next_outbox;
            inner.next_outbox += 1;
            inner.outbox.insert(
                sequence_no,
                OutboundEvent {
                    sequence_no,
                    context_id: context_id.to_string(),
                    envelope,
                    enqueued_at: now,
                },
            );
        }

        if let Some(stored) = inner.records.get_mut(context_id) {
            stored.execution = updated.clone();
        }
        drop(inner);
        Ok(updated)
    }

    async fn list_by_key_and_state(
        &self,
        key: &ConcurrencyKey,
        state: SequenceState,
    ) -> Result<Vec<SequenceExecution>, StoreError> {
        let inner = self.inner.lock();
        let mut matching: Vec<&StoredExecution> = inner
            .records
            .values()
            .filter(|s| s.execution.state == state && s.execution.key() == *key)
            .collect();
        matching.sort_by(|a, b| {
            a.execution
                .triggered_at
                .cmp(&b.execution.triggered_at)
                .then(a.insertion.cmp(&b.insertion))
        });
        Ok(matching.into_iter().map(|s| s.execution.clone()).collect())
    }

    async fn list_keys_in_states(
        &self,
        states: &[SequenceState],
    ) -> Result<Vec<ConcurrencyKey>, StoreError> {
        let keys: BTreeSet<ConcurrencyKey> = self
            .inner
            .lock()
            .records
            .values()
            .filter(|s| states.contains(&s.execution.state))
            .map(|s| s.execution.key())
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn pending_events_after(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<OutboundEvent>, StoreError> {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(self
            .inner
            .lock()
            .outbox
            .range((lower, Bound::Unbounded))
            .map(|(_, event)| event.clone())
            .take(limit)
            .collect())
    }

    async fn ack_event(&self, sequence_no: u64) -> Result<(), StoreError> {
        self.inner.lock().outbox.remove(&sequence_no);
        Ok(())
    }
}
