//! Event correlation handler.
//!
//! Runs on every replica and applies each inbound lifecycle event to the
//! execution it belongs to. Delivery may be at-least-once; every apply is a
//! compare-and-update against the state that was read, so a replay finds the
//! record already advanced and does nothing.

use std::sync::Arc;

use crate::bus::BusMessage;
use crate::errors::ShipyardError;
use crate::event::{EventEnvelope, EventKind, Phase};

use super::lifecycle::{Followup, SequenceLifecycle};

/// Applies inbound lifecycle events to sequence executions.
#[derive(Debug, Clone)]
pub struct EventCorrelationHandler {
    lifecycle: Arc<SequenceLifecycle>,
}

impl EventCorrelationHandler {
    /// Creates a handler over a shared lifecycle.
    #[must_use]
    pub fn new(lifecycle: Arc<SequenceLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Decodes and applies a bus message.
    ///
    /// Undecodable payloads are logged and dropped.
    pub async fn handle_message(&self, message: &BusMessage) -> Result<(), ShipyardError> {
        match EventEnvelope::from_slice(&message.payload) {
            Ok(envelope) => self.handle(&envelope).await,
            Err(e) => {
                tracing::warn!(subject = %message.subject, error = %e, "Dropping malformed event");
                Ok(())
            }
        }
    }

    /// Applies one event.
    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<(), ShipyardError> {
        let namespace = &self.lifecycle.origin().namespace;
        let kind = match envelope.kind(namespace) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::debug!(
                    event_type = %envelope.event_type,
                    context_id = %envelope.context_id,
                    error = %e,
                    "Ignoring event outside the lifecycle grammar"
                );
                return Ok(());
            }
        };

        tracing::debug!(
            event_type = %envelope.event_type,
            context_id = %envelope.context_id,
            project = %envelope.data.project,
            "Handling event"
        );

        match kind {
            EventKind::Sequence {
                phase: Phase::Triggered,
                ..
            } => {
                self.lifecycle
                    .drive(vec![Followup::Create(envelope.clone())])
                    .await
            }
            EventKind::Task {
                task,
                phase: Phase::Started,
            } => self.lifecycle.task_started(&task, envelope).await,
            EventKind::Task {
                task,
                phase: Phase::Finished,
            } => self.lifecycle.task_finished(&task, envelope).await,
            // Emitted by this controller; nothing to apply.
            EventKind::Sequence { .. }
            | EventKind::Task {
                phase: Phase::Triggered,
                ..
            } => Ok(()),
        }
    }
}
