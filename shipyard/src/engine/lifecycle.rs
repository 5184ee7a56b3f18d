//! Store-backed sequence lifecycle shared by the event handler and the
//! sequence dispatcher.
//!
//! Every change follows the same shape: read the record, compute the next
//! version of it on a working copy, then write it back with a
//! compare-and-update against the state and revision that were read. The
//! events announcing the change ride along into the outbox. A conflict means
//! another writer got there first; the step re-reads and decides again, a
//! bounded number of times, after which the change is treated as already
//! applied.
//!
//! Work that a change causes on *other* records (promoting the next waiting
//! execution, creating follow-on sequences) is returned as [`Followup`]s and
//! processed from a queue rather than by recursion.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::errors::{ConflictKind, ProviderError, ShipyardError, StoreError};
use crate::event::{EventEnvelope, EventKind, Phase};
use crate::execution::{ConcurrencyKey, SequenceExecution, SequenceResult, SequenceState};
use crate::model::VersionedShipyard;
use crate::provider::ShipyardProvider;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::selector::resolve_triggered_sequences;
use crate::store::{Mutation, SequenceStateStore};

use super::transitions::{self, EventOrigin, TaskOutcome};

/// Work triggered by a committed change.
#[derive(Debug, Clone, PartialEq)]
pub enum Followup {
    /// Create an execution from a `<stage>.<sequence>.triggered` event.
    Create(EventEnvelope),
    /// Decide whether a pending execution may start.
    Admit(String),
    /// Start the oldest pending execution of a key whose slot may be free.
    PromoteNext(ConcurrencyKey),
}

/// Tunables of the lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Namespace and source of emitted events.
    pub origin: EventOrigin,
    /// Retries after a compare-and-update conflict.
    pub conflict_retry: RetryPolicy,
    /// Retries of shipyard lookups.
    pub provider_retry: RetryPolicy,
}

impl LifecycleSettings {
    /// Creates settings with default retry policies.
    #[must_use]
    pub fn new(origin: EventOrigin) -> Self {
        Self {
            origin,
            conflict_retry: RetryPolicy::for_conflicts(5),
            provider_retry: RetryPolicy::default(),
        }
    }

    /// Sets the number of attempts made for a conflicting write.
    #[must_use]
    pub fn with_conflict_attempts(mut self, attempts: usize) -> Self {
        self.conflict_retry = RetryPolicy::for_conflicts(attempts);
        self
    }
}

/// Result of one attempt at a compare-and-update.
enum Attempt<T> {
    Done(T),
    Retry,
}

/// Applies sequence lifecycle transitions against the store.
pub struct SequenceLifecycle {
    store: Arc<dyn SequenceStateStore>,
    provider: Arc<dyn ShipyardProvider>,
    settings: LifecycleSettings,
}

impl std::fmt::Debug for SequenceLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceLifecycle")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SequenceLifecycle {
    /// Creates a lifecycle over a store and a shipyard provider.
    #[must_use]
    pub fn new(
        store: Arc<dyn SequenceStateStore>,
        provider: Arc<dyn ShipyardProvider>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
        }
    }

    /// Returns the event origin.
    #[must_use]
    pub fn origin(&self) -> &EventOrigin {
        &self.settings.origin
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SequenceStateStore> {
        &self.store
    }

    /// Processes `initial` and everything it causes.
    ///
    /// A failing step does not stop the others; the first error is returned.
    pub async fn drive(&self, initial: Vec<Followup>) -> Result<(), ShipyardError> {
        let mut queue: VecDeque<Followup> = initial.into();
        let mut first_error = None;

        while let Some(step) = queue.pop_front() {
            let result = match &step {
                Followup::Create(trigger) => self.create(trigger).await,
                Followup::Admit(context_id) => self.admit(context_id).await,
                Followup::PromoteNext(key) => self.promote_next(key).await,
            };
            match result {
                Ok(more) => queue.extend(more),
                Err(e) => {
                    tracing::warn!(step = %step_name(&step), error = %e, "Lifecycle step failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Creates a queued execution from a sequence trigger event.
    async fn create(&self, trigger: &EventEnvelope) -> Result<Vec<Followup>, ShipyardError> {
        let Ok(EventKind::Sequence {
            stage,
            sequence,
            phase: Phase::Triggered,
        }) = trigger.kind(&self.settings.origin.namespace)
        else {
            return Ok(Vec::new());
        };

        let shipyard = self.shipyard(&trigger.data.project).await?;
        let Some(execution) = transitions::new_execution(trigger, &stage, &sequence, &shipyard)
        else {
            tracing::info!(
                context_id = %trigger.context_id,
                project = %trigger.data.project,
                stage = %stage,
                sequence = %sequence,
                "Triggered sequence not found in shipyard"
            );
            return Ok(Vec::new());
        };

        let context_id = execution.context_id.clone();
        match self.store.create(execution).await {
            Ok(created) => {
                tracing::info!(
                    context_id = %context_id,
                    key = %created.key(),
                    sequence = %created.sequence,
                    "Sequence execution created"
                );
                Ok(vec![Followup::Admit(context_id)])
            }
            Err(e) if e.conflict_kind() == Some(ConflictKind::AlreadyExists) => {
                let existing = self.store.get_by_context(&context_id).await?;
                if existing.state == SequenceState::Queued {
                    Ok(vec![Followup::Admit(context_id)])
                } else {
                    tracing::debug!(context_id = %context_id, "Duplicate sequence trigger ignored");
                    Ok(Vec::new())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Starts a pending execution, or parks it as `waiting` if its key is busy
    /// or an older execution is ahead of it.
    async fn admit(&self, context_id: &str) -> Result<Vec<Followup>, ShipyardError> {
        let policy = &self.settings.conflict_retry;
        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }

            let execution = self.store.get_by_context(context_id).await?;
            if !execution.state.is_pending() {
                return Ok(Vec::new());
            }
            let key = execution.key();

            let busy = self.has_started(&key).await?;
            let first_in_line = self
                .oldest_pending(&key)
                .await?
                .map_or(true, |oldest| oldest.context_id == execution.context_id);

            if busy || !first_in_line {
                match self.park(&execution).await? {
                    Attempt::Retry => continue,
                    Attempt::Done(()) if busy => return Ok(Vec::new()),
                    Attempt::Done(()) => return Ok(vec![Followup::PromoteNext(key)]),
                }
            }

            match self.start(&execution).await {
                Ok(followups) => return Ok(followups),
                Err(e) if e.is_conflict() => {
                    tracing::debug!(context_id = %context_id, error = %e, "Admission conflict, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(context_id = %context_id, "Admission retries exhausted");
        Ok(Vec::new())
    }

    /// Promotes the oldest pending execution of `key` if nothing holds the slot.
    pub async fn promote_next(
        &self,
        key: &ConcurrencyKey,
    ) -> Result<Vec<Followup>, ShipyardError> {
        let policy = &self.settings.conflict_retry;
        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
            if self.has_started(key).await? {
                return Ok(Vec::new());
            }
            let Some(candidate) = self.oldest_pending(key).await? else {
                return Ok(Vec::new());
            };

            match self.start(&candidate).await {
                Ok(followups) => {
                    tracing::info!(
                        context_id = %candidate.context_id,
                        key = %key,
                        "Promoted pending sequence execution"
                    );
                    return Ok(followups);
                }
                Err(e) if e.conflict_kind() == Some(ConflictKind::SlotOccupied) => {
                    return Ok(Vec::new());
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(key = %key, "Promotion retries exhausted");
        Ok(Vec::new())
    }

    /// Applies `<task>.started`.
    pub async fn task_started(&self, task: &str, event: &EventEnvelope) -> Result<(), ShipyardError> {
        let policy = &self.settings.conflict_retry;
        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
            let Some(execution) = self.read_for_task_event(task, event).await? else {
                return Ok(());
            };

            let mut next = execution.clone();
            if !transitions::record_task_started(&mut next, task, event) {
                tracing::debug!(context_id = %event.context_id, task = %task, "Task already started");
                return Ok(());
            }
            match self.commit(&execution, next, Vec::new()).await? {
                Attempt::Done(_) => {
                    tracing::debug!(context_id = %event.context_id, task = %task, "Task started");
                    return Ok(());
                }
                Attempt::Retry => {}
            }
        }
        Ok(())
    }

    /// Applies `<task>.finished`: advance to the next task or finish.
    pub async fn task_finished(
        &self,
        task: &str,
        event: &EventEnvelope,
    ) -> Result<(), ShipyardError> {
        let policy = &self.settings.conflict_retry;
        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
            let Some(execution) = self.read_for_task_event(task, event).await? else {
                return Ok(());
            };

            let mut next = execution.clone();
            let Some(outcome) = transitions::record_task_finished(&mut next, task, event) else {
                tracing::debug!(
                    context_id = %event.context_id,
                    task = %task,
                    "Stale task finished event ignored"
                );
                return Ok(());
            };

            let (events, followups) = match outcome {
                TaskOutcome::Advance => (
                    transitions::advance(&mut next, &self.settings.origin),
                    Vec::new(),
                ),
                TaskOutcome::Finish(result) => self.finish(&mut next, result).await,
            };

            match self.commit(&execution, next, events).await? {
                Attempt::Done(updated) => {
                    tracing::info!(
                        context_id = %updated.context_id,
                        task = %task,
                        failed = event.data.is_failure(),
                        state = %updated.state,
                        result = ?updated.result,
                        "Task finished"
                    );
                    return self.drive(followups).await;
                }
                Attempt::Retry => {}
            }
        }
        tracing::debug!(context_id = %event.context_id, "Task finished retries exhausted");
        Ok(())
    }

    /// Reads the execution a task event refers to; `None` if it cannot apply.
    async fn read_for_task_event(
        &self,
        task: &str,
        event: &EventEnvelope,
    ) -> Result<Option<SequenceExecution>, ShipyardError> {
        let execution = match self.store.get_by_context(&event.context_id).await {
            Ok(execution) => execution,
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(
                    context_id = %event.context_id,
                    task = %task,
                    "Task event for unknown context ignored"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if execution.state == SequenceState::Started {
            Ok(Some(execution))
        } else {
            tracing::debug!(
                context_id = %event.context_id,
                state = %execution.state,
                task = %task,
                "Task event for inactive sequence ignored"
            );
            Ok(None)
        }
    }

    /// Moves `execution` to `started`, finishing it immediately if it has no
    /// tasks.
    async fn start(&self, execution: &SequenceExecution) -> Result<Vec<Followup>, StoreError> {
        let mut next = execution.clone();
        let mut events = transitions::start(&mut next, &self.settings.origin);
        let mut followups = Vec::new();

        if next.plan.is_empty() {
            let (finish_events, finish_followups) =
                self.finish(&mut next, SequenceResult::Pass).await;
            events.extend(finish_events);
            followups = finish_followups;
        }

        let updated = self
            .store
            .compare_and_update(&execution.context_id, execution.expectation(), replace_with(next, events))
            .await?;
        tracing::info!(
            context_id = %updated.context_id,
            key = %updated.key(),
            sequence = %updated.sequence,
            "Sequence execution started"
        );
        Ok(followups)
    }

    /// Marks a queued execution as waiting; a waiting one is left alone.
    async fn park(&self, execution: &SequenceExecution) -> Result<Attempt<()>, ShipyardError> {
        if execution.state == SequenceState::Waiting {
            return Ok(Attempt::Done(()));
        }
        let mut next = execution.clone();
        next.state = SequenceState::Waiting;
        Ok(match self.commit(execution, next, Vec::new()).await? {
            Attempt::Done(updated) => {
                tracing::info!(
                    context_id = %updated.context_id,
                    key = %updated.key(),
                    "Sequence execution waiting for its concurrency slot"
                );
                Attempt::Done(())
            }
            Attempt::Retry => Attempt::Retry,
        })
    }

    /// Finishes a working copy and plans the follow-on sequences.
    async fn finish(
        &self,
        next: &mut SequenceExecution,
        result: SequenceResult,
    ) -> (Vec<EventEnvelope>, Vec<Followup>) {
        let origin = &self.settings.origin;
        let finished = transitions::finish(next, result, origin);

        let follow_ons: Vec<EventEnvelope> = match self.shipyard(&next.project).await {
            Ok(shipyard) => resolve_triggered_sequences(
                &shipyard.document,
                &origin.namespace,
                &finished.event_type,
                &finished.data,
            )
            .iter()
            .map(|target| transitions::follow_on_event(&finished, target, origin))
            .collect(),
            Err(e) => {
                tracing::error!(
                    context_id = %next.context_id,
                    project = %next.project,
                    error = %e,
                    "Shipyard unavailable, follow-on sequences not triggered"
                );
                Vec::new()
            }
        };

        let mut followups = vec![Followup::PromoteNext(next.key())];
        followups.extend(follow_ons.iter().cloned().map(Followup::Create));

        let mut events = vec![finished];
        events.extend(follow_ons);
        (events, followups)
    }

    /// Writes `next` over `current` with the given events.
    async fn commit(
        &self,
        current: &SequenceExecution,
        next: SequenceExecution,
        events: Vec<EventEnvelope>,
    ) -> Result<Attempt<SequenceExecution>, ShipyardError> {
        match self
            .store
            .compare_and_update(&current.context_id, current.expectation(), replace_with(next, events))
            .await
        {
            Ok(updated) => Ok(Attempt::Done(updated)),
            Err(e) if e.is_conflict() => {
                tracing::debug!(context_id = %current.context_id, error = %e, "Write conflict, re-reading");
                Ok(Attempt::Retry)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has_started(&self, key: &ConcurrencyKey) -> Result<bool, StoreError> {
        Ok(!self
            .store
            .list_by_key_and_state(key, SequenceState::Started)
            .await?
            .is_empty())
    }

    async fn oldest_pending(
        &self,
        key: &ConcurrencyKey,
    ) -> Result<Option<SequenceExecution>, StoreError> {
        let waiting = self
            .store
            .list_by_key_and_state(key, SequenceState::Waiting)
            .await?;
        let queued = self
            .store
            .list_by_key_and_state(key, SequenceState::Queued)
            .await?;
        Ok(waiting
            .into_iter()
            .chain(queued)
            .min_by_key(|e| e.triggered_at))
    }

    async fn shipyard(&self, project: &str) -> Result<Arc<VersionedShipyard>, ProviderError> {
        run_with_retry(
            &self.settings.provider_retry,
            |e: &ProviderError| matches!(e, ProviderError::Fetch(_)),
            || self.provider.get_shipyard(project),
        )
        .await
    }
}

fn replace_with(next: SequenceExecution, events: Vec<EventEnvelope>) -> Mutation {
    Box::new(move |record: &mut SequenceExecution| {
        *record = next;
        events
    })
}

fn step_name(step: &Followup) -> String {
    match step {
        Followup::Create(trigger) => format!("create {}", trigger.context_id),
        Followup::Admit(context_id) => format!("admit {context_id}"),
        Followup::PromoteNext(key) => format!("promote {key}"),
    }
}
