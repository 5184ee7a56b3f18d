//! Pure state transitions of a sequence execution.
//!
//! Each function takes a record (usually a working copy), mutates it and
//! returns the events announcing the change. Nothing here touches the store;
//! the lifecycle module applies the results through a compare-and-update.

use crate::event::{EventData, EventEnvelope, EventKind, EventResult, EventStatus, Phase};
use crate::execution::{
    ConcurrencyKey, PlannedTask, SequenceExecution, SequenceResult, SequenceState, TaskExecution,
    TaskState,
};
use crate::model::VersionedShipyard;
use crate::selector::TriggeredSequence;

/// What happens after a task reported its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Trigger the next task.
    Advance,
    /// The sequence is done.
    Finish(SequenceResult),
}

/// Who emits events and under which namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOrigin {
    /// Event type namespace.
    pub namespace: String,
    /// `source` stamped on emitted events.
    pub source: String,
}

impl EventOrigin {
    /// Creates an origin.
    #[must_use]
    pub fn new(namespace: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            source: source.into(),
        }
    }

    fn envelope(&self, kind: &EventKind, context_id: &str, data: EventData) -> EventEnvelope {
        EventEnvelope::new(
            kind.event_type(&self.namespace),
            context_id,
            self.source.clone(),
            data,
        )
    }
}

/// Builds a queued execution for `<stage>.<sequence>.triggered`.
///
/// Returns `None` if the shipyard has no such sequence.
#[must_use]
pub fn new_execution(
    trigger: &EventEnvelope,
    stage: &str,
    sequence: &str,
    shipyard: &VersionedShipyard,
) -> Option<SequenceExecution> {
    let definition = shipyard.document.find_sequence(stage, sequence)?;
    let key = ConcurrencyKey::new(&trigger.data.project, stage, &trigger.data.service);
    let plan = definition.tasks.iter().map(PlannedTask::from).collect();

    let mut execution = SequenceExecution::queued(
        &trigger.context_id,
        &key,
        sequence,
        plan,
        &shipyard.version,
        &trigger.id,
    );
    execution.data = trigger.data.extra.clone();
    execution.triggered_by = trigger.triggered_id.clone();
    Some(execution)
}

fn base_data(execution: &SequenceExecution) -> EventData {
    let mut data = EventData::new(&execution.project, &execution.stage, &execution.service);
    data.extra = execution.data.clone();
    data
}

/// Builds the trigger event of the task at `index` and records it on the
/// execution.
fn trigger_task(
    execution: &mut SequenceExecution,
    index: usize,
    origin: &EventOrigin,
) -> Option<EventEnvelope> {
    let task = execution.plan.get(index)?.clone();
    let mut data = base_data(execution);
    if !task.properties.is_null() {
        data.extra.insert(task.name.clone(), task.properties.clone());
    }
    let event = origin.envelope(
        &EventKind::task(&task.name, Phase::Triggered),
        &execution.context_id,
        data,
    );
    execution
        .tasks
        .push(TaskExecution::triggered(&task.name, &event.id));
    Some(event)
}

/// Moves a pending execution to `started`.
///
/// Emits `<stage>.<sequence>.started` and the first task's trigger event. A
/// sequence without tasks gets no task event; the caller finishes it.
pub fn start(execution: &mut SequenceExecution, origin: &EventOrigin) -> Vec<EventEnvelope> {
    execution.state = SequenceState::Started;
    execution.cursor = 0;

    let started = origin
        .envelope(
            &EventKind::sequence(&execution.stage, &execution.sequence, Phase::Started),
            &execution.context_id,
            base_data(execution),
        )
        .with_triggered_id(&execution.triggered_event_id);

    let mut events = vec![started];
    events.extend(trigger_task(execution, 0, origin));
    events
}

/// Records `<task>.started` on the current task.
///
/// Returns false if the event does not apply (wrong task or already past it).
pub fn record_task_started(
    execution: &mut SequenceExecution,
    task: &str,
    event: &EventEnvelope,
) -> bool {
    if !applies_to_current(execution, task, event) {
        return false;
    }
    let cursor = execution.cursor;
    match execution.tasks.get_mut(cursor) {
        Some(record) if record.state == TaskState::Triggered => {
            record.state = TaskState::Started;
            record.started_at = Some(event.time);
            true
        }
        _ => false,
    }
}

/// Returns true if an event for `task` targets the task at the cursor, which
/// must not have finished yet.
#[must_use]
pub fn applies_to_current(execution: &SequenceExecution, task: &str, event: &EventEnvelope) -> bool {
    let Some(current) = execution.current_task() else {
        return false;
    };
    let id_matches = event
        .triggered_id
        .as_deref()
        .map_or(true, |id| id == current.triggered_event_id);
    current.name == task && id_matches && current.state != TaskState::Finished
}

/// Records `<task>.finished` and decides what comes next.
///
/// Returns `None` if the event does not apply.
pub fn record_task_finished(
    execution: &mut SequenceExecution,
    task: &str,
    event: &EventEnvelope,
) -> Option<TaskOutcome> {
    if !applies_to_current(execution, task, event) {
        return None;
    }
    let cursor = execution.cursor;
    let failed = event.data.is_failure();
    let continue_on_failure = execution
        .plan
        .get(cursor)
        .is_some_and(|t| t.continue_on_failure);

    let record = execution.tasks.get_mut(cursor)?;
    record.state = TaskState::Finished;
    record.finished_at = Some(event.time);
    record.result = event.data.result;
    record.failed = failed;
    record.outcome = serde_json::to_value(&event.data).unwrap_or(serde_json::Value::Null);

    for (key, value) in &event.data.extra {
        execution.data.insert(key.clone(), value.clone());
    }

    let outcome = if failed && !continue_on_failure {
        TaskOutcome::Finish(SequenceResult::Fail)
    } else if cursor + 1 < execution.plan.len() {
        TaskOutcome::Advance
    } else if execution.has_failed_task() {
        TaskOutcome::Finish(SequenceResult::Fail)
    } else {
        TaskOutcome::Finish(SequenceResult::Pass)
    };
    Some(outcome)
}

/// Moves the cursor to the next task and emits its trigger event.
pub fn advance(execution: &mut SequenceExecution, origin: &EventOrigin) -> Vec<EventEnvelope> {
    execution.cursor += 1;
    let index = execution.cursor;
    trigger_task(execution, index, origin).into_iter().collect()
}

/// Marks the execution finished and builds `<stage>.<sequence>.finished`.
pub fn finish(
    execution: &mut SequenceExecution,
    result: SequenceResult,
    origin: &EventOrigin,
) -> EventEnvelope {
    execution.state = SequenceState::Finished;
    execution.result = Some(result);

    let mut data = base_data(execution)
        .with_result(EventResult::from(result))
        .with_status(EventStatus::Succeeded);
    if result == SequenceResult::Fail {
        if let Some(task) = execution.tasks.iter().rev().find(|t| t.failed) {
            data.message = Some(format!("task '{}' failed", task.name));
        }
    }
    origin
        .envelope(
            &EventKind::sequence(&execution.stage, &execution.sequence, Phase::Finished),
            &execution.context_id,
            data,
        )
        .with_triggered_id(&execution.triggered_event_id)
}

/// Builds the `triggered` event of a follow-on sequence.
///
/// The follow-on gets a fresh context ID and points at the finished event
/// that caused it.
#[must_use]
pub fn follow_on_event(
    finished: &EventEnvelope,
    target: &TriggeredSequence,
    origin: &EventOrigin,
) -> EventEnvelope {
    let mut data = EventData::new(
        &finished.data.project,
        &target.stage,
        &finished.data.service,
    );
    data.extra = finished.data.extra.clone();
    origin
        .envelope(
            &EventKind::sequence(&target.stage, &target.sequence, Phase::Triggered),
            &crate::utils::generate_uuid().to_string(),
            data,
        )
        .with_triggered_id(&finished.id)
}
