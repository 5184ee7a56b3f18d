//! Outbox drain.
//!
//! Publishes pending outbound events in outbox order and acknowledges each
//! one after a successful publish. When publishing an event fails, the rest
//! of that context's events are held back until the next tick so a context's
//! events are never published out of order; other contexts keep flowing.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::EventPublisher;
use crate::errors::ShipyardError;
use crate::store::{OutboundEvent, SequenceStateStore};

use super::periodic::PeriodicTask;

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events published and acknowledged.
    pub published: usize,
    /// Events left in the outbox because their publish failed.
    pub failed: usize,
    /// Events held back behind a failed event of the same context.
    pub deferred: usize,
}

/// Leader-only publisher of outbox events.
pub struct EventDispatcher {
    store: Arc<dyn SequenceStateStore>,
    publisher: Arc<dyn EventPublisher>,
    batch_size: usize,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Creates a dispatcher publishing at most `batch_size` events per tick.
    #[must_use]
    pub fn new(
        store: Arc<dyn SequenceStateStore>,
        publisher: Arc<dyn EventPublisher>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            publisher,
            batch_size: batch_size.max(1),
        }
    }

    /// Publishes one batch of pending events.
    ///
    /// The outbox is scanned page by page until `batch_size` events have been
    /// published or it is exhausted. A failing context gets one attempt per
    /// tick and never holds back other contexts, however long its backlog.
    pub async fn dispatch(&self) -> Result<DispatchStats, ShipyardError> {
        let mut stats = DispatchStats::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut cursor = None;

        'scan: loop {
            let page = self
                .store
                .pending_events_after(cursor, self.batch_size)
                .await?;
            let exhausted = page.len() < self.batch_size;

            for event in page {
                if stats.published == self.batch_size {
                    break 'scan;
                }
                cursor = Some(event.sequence_no);
                if blocked.contains(&event.context_id) {
                    stats.deferred += 1;
                    continue;
                }
                if let Err(e) = self.publish(&event).await {
                    tracing::warn!(
                        context_id = %event.context_id,
                        event_type = %event.envelope.event_type,
                        sequence_no = event.sequence_no,
                        error = %e,
                        "Publish failed, event stays queued"
                    );
                    stats.failed += 1;
                    blocked.insert(event.context_id);
                    continue;
                }
                stats.published += 1;
            }

            if exhausted || stats.published == self.batch_size {
                break;
            }
        }

        if stats != DispatchStats::default() {
            tracing::debug!(
                published = stats.published,
                failed = stats.failed,
                deferred = stats.deferred,
                "Event dispatch done"
            );
        }
        Ok(stats)
    }

    async fn publish(&self, event: &OutboundEvent) -> Result<(), ShipyardError> {
        let payload = event.envelope.to_vec()?;
        self.publisher
            .publish(&event.envelope.event_type, payload)
            .await?;
        self.store.ack_event(event.sequence_no).await?;
        tracing::debug!(
            context_id = %event.context_id,
            event_type = %event.envelope.event_type,
            "Published event"
        );
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for EventDispatcher {
    fn name(&self) -> &'static str {
        "event-dispatcher"
    }

    async fn tick(&self) -> Result<(), ShipyardError> {
        self.dispatch().await.map(|_| ())
    }
}
