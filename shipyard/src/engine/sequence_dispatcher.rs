//! Periodic admission sweep.
//!
//! Re-evaluates every concurrency key that has pending executions and
//! promotes the oldest one when the key's slot is free. This recovers
//! promotions missed by the event path, for example after a crash between
//! finishing an execution and promoting its successor. Promotions go through
//! the same compare-and-update as the event path, so racing it is harmless.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::ShipyardError;
use crate::execution::SequenceState;

use super::lifecycle::SequenceLifecycle;
use super::periodic::PeriodicTask;

/// Leader-only reconciler for pending executions.
#[derive(Debug, Clone)]
pub struct SequenceDispatcher {
    lifecycle: Arc<SequenceLifecycle>,
}

impl SequenceDispatcher {
    /// Creates a dispatcher over a shared lifecycle.
    #[must_use]
    pub fn new(lifecycle: Arc<SequenceLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Runs one sweep and returns the number of keys examined.
    pub async fn dispatch(&self) -> Result<usize, ShipyardError> {
        let keys = self
            .lifecycle
            .store()
            .list_keys_in_states(&[SequenceState::Waiting, SequenceState::Queued])
            .await?;

        let mut first_error = None;
        for key in &keys {
            let followups = match self.lifecycle.promote_next(key).await {
                Ok(followups) => followups,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to re-evaluate admission");
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            if let Err(e) = self.lifecycle.drive(followups).await {
                first_error.get_or_insert(e);
            }
        }

        if !keys.is_empty() {
            tracing::debug!(keys = keys.len(), "Sequence dispatch sweep done");
        }
        first_error.map_or(Ok(keys.len()), Err)
    }
}

#[async_trait]
impl PeriodicTask for SequenceDispatcher {
    fn name(&self) -> &'static str {
        "sequence-dispatcher"
    }

    async fn tick(&self) -> Result<(), ShipyardError> {
        self.dispatch().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lifecycle::LifecycleSettings;
    use crate::engine::transitions::EventOrigin;
    use crate::event::DEFAULT_NAMESPACE;
    use crate::execution::{ConcurrencyKey, Expectation, PlannedTask, SequenceExecution};
    use crate::model::Task;
    use crate::provider::StaticShipyardProvider;
    use crate::store::{InMemorySequenceStore, SequenceStateStore};
    use crate::testing::fixtures::single_sequence_shipyard;
    use pretty_assertions::assert_eq;

    fn dispatcher() -> (SequenceDispatcher, Arc<InMemorySequenceStore>) {
        let store = Arc::new(InMemorySequenceStore::new());
        let provider = Arc::new(StaticShipyardProvider::with_project(
            "sockshop",
            single_sequence_shipyard("delivery", vec![Task::new("deploy")]),
        ));
        let lifecycle = SequenceLifecycle::new(
            store.clone(),
            provider,
            LifecycleSettings::new(EventOrigin::new(DEFAULT_NAMESPACE, "shipyard-controller")),
        );
        (SequenceDispatcher::new(Arc::new(lifecycle)), store)
    }

    fn pending(context_id: &str, key: &ConcurrencyKey) -> SequenceExecution {
        SequenceExecution::queued(
            context_id,
            key,
            "delivery",
            vec![PlannedTask::from(&Task::new("deploy"))],
            "1",
            format!("{context_id}-trigger"),
        )
    }

    #[tokio::test]
    async fn test_promotes_orphaned_waiting_execution() {
        let (dispatcher, store) = dispatcher();
        let key = ConcurrencyKey::new("sockshop", "dev", "carts");
        store.create(pending("a", &key)).await.unwrap();
        store
            .compare_and_update(
                "a",
                Expectation {
                    state: SequenceState::Queued,
                    revision: 0,
                },
                Box::new(|e: &mut SequenceExecution| {
                    e.state = SequenceState::Waiting;
                    Vec::new()
                }),
            )
            .await
            .unwrap();
        store.create(pending("b", &key)).await.unwrap();

        assert_eq!(dispatcher.dispatch().await.unwrap(), 1);
        assert_eq!(store.get_by_context("a").await.unwrap().state, SequenceState::Started);
        assert_eq!(store.get_by_context("b").await.unwrap().state, SequenceState::Queued);
        assert_eq!(store.outbox_len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let (dispatcher, store) = dispatcher();
        let key = ConcurrencyKey::new("sockshop", "dev", "carts");
        store.create(pending("a", &key)).await.unwrap();
        store.create(pending("b", &key)).await.unwrap();

        dispatcher.dispatch().await.unwrap();
        dispatcher.dispatch().await.unwrap();

        assert_eq!(store.started_count(&key), 1);
        assert_eq!(store.outbox_len(), 2);
    }

    #[tokio::test]
    async fn test_empty_store_is_a_no_op() {
        let (dispatcher, _store) = dispatcher();
        assert_eq!(dispatcher.dispatch().await.unwrap(), 0);
    }
}
