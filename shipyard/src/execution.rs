//! Sequence and task execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::EventResult;
use crate::model::Task;

/// Lifecycle state of a sequence execution.
///
/// `queued -> waiting -> started -> finished`, where `waiting` may be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    /// Created, admission not yet decided.
    Queued,
    /// Blocked behind another execution of the same concurrency key.
    Waiting,
    /// Holding the concurrency slot; tasks are being triggered.
    Started,
    /// Terminal.
    Finished,
}

impl SequenceState {
    /// Returns true for `finished`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Returns true for states that still await admission.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::Waiting)
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Waiting => write!(f, "waiting"),
            Self::Started => write!(f, "started"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Aggregate outcome of a finished sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceResult {
    /// Every task passed.
    Pass,
    /// At least one task failed.
    Fail,
}

impl From<SequenceResult> for EventResult {
    fn from(result: SequenceResult) -> Self {
        match result {
            SequenceResult::Pass => Self::Pass,
            SequenceResult::Fail => Self::Fail,
        }
    }
}

impl fmt::Display for SequenceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// State of a single task within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Trigger event enqueued.
    Triggered,
    /// Executor reported start.
    Started,
    /// Executor reported an outcome.
    Finished,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Triggered => write!(f, "triggered"),
            Self::Started => write!(f, "started"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// The (project, stage, service) tuple serialising executions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConcurrencyKey {
    /// Project name.
    pub project: String,
    /// Stage name.
    pub stage: String,
    /// Service name.
    pub service: String,
}

impl ConcurrencyKey {
    /// Creates a key.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        stage: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            stage: stage.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for ConcurrencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.stage, self.service)
    }
}

/// Snapshot of a shipyard task taken when the execution is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    /// Task name.
    pub name: String,
    /// Task properties.
    #[serde(default)]
    pub properties: serde_json::Value,
    /// Continue with the next task on failure.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl From<&Task> for PlannedTask {
    fn from(task: &Task) -> Self {
        Self {
            name: task.name.clone(),
            properties: task.properties.clone(),
            continue_on_failure: task.continue_on_failure,
        }
    }
}

/// Execution record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    /// Task name.
    pub name: String,
    /// Current state.
    pub state: TaskState,
    /// ID of the `<task>.triggered` event.
    pub triggered_event_id: String,
    /// When the trigger event was enqueued.
    pub triggered_at: DateTime<Utc>,
    /// When the executor reported start.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the executor reported an outcome.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Reported result.
    #[serde(default)]
    pub result: Option<EventResult>,
    /// True if the task counted as failed.
    #[serde(default)]
    pub failed: bool,
    /// Payload of the `<task>.finished` event.
    #[serde(default)]
    pub outcome: serde_json::Value,
}

impl TaskExecution {
    /// Creates a freshly triggered task record.
    #[must_use]
    pub fn triggered(name: impl Into<String>, triggered_event_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: TaskState::Triggered,
            triggered_event_id: triggered_event_id.into(),
            triggered_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            failed: false,
            outcome: serde_json::Value::Null,
        }
    }
}

/// Precondition for a compare-and-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    /// State the record must still be in.
    pub state: SequenceState,
    /// Revision the record must still have.
    pub revision: u64,
}

/// One run instance of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceExecution {
    /// Globally unique context ID.
    pub context_id: String,
    /// Project name.
    pub project: String,
    /// Stage name.
    pub stage: String,
    /// Service name.
    pub service: String,
    /// Sequence name.
    pub sequence: String,
    /// Lifecycle state.
    pub state: SequenceState,
    /// Aggregate result, set when finished.
    #[serde(default)]
    pub result: Option<SequenceResult>,
    /// Tasks to run, snapshotted from the shipyard.
    pub plan: Vec<PlannedTask>,
    /// Index into `plan` of the active task. Only ever increases.
    pub cursor: usize,
    /// Records of tasks triggered so far, in order.
    #[serde(default)]
    pub tasks: Vec<TaskExecution>,
    /// Data forwarded to every task trigger event.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Shipyard version the plan was taken from.
    pub shipyard_version: String,
    /// ID of the event that created this execution.
    pub triggered_event_id: String,
    /// ID of the finished event that caused this execution, for follow-ons.
    #[serde(default)]
    pub triggered_by: Option<String>,
    /// Creation time; FIFO order within a concurrency key.
    pub triggered_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Incremented by the store on every successful update.
    #[serde(default)]
    pub revision: u64,
}

impl SequenceExecution {
    /// Creates a queued execution.
    #[must_use]
    pub fn queued(
        context_id: impl Into<String>,
        key: &ConcurrencyKey,
        sequence: impl Into<String>,
        plan: Vec<PlannedTask>,
        shipyard_version: impl Into<String>,
        triggered_event_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            context_id: context_id.into(),
            project: key.project.clone(),
            stage: key.stage.clone(),
            service: key.service.clone(),
            sequence: sequence.into(),
            state: SequenceState::Queued,
            result: None,
            plan,
            cursor: 0,
            tasks: Vec::new(),
            data: serde_json::Map::new(),
            shipyard_version: shipyard_version.into(),
            triggered_event_id: triggered_event_id.into(),
            triggered_by: None,
            triggered_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Returns the concurrency key.
    #[must_use]
    pub fn key(&self) -> ConcurrencyKey {
        ConcurrencyKey::new(&self.project, &self.stage, &self.service)
    }

    /// Returns the precondition matching the current record.
    #[must_use]
    pub const fn expectation(&self) -> Expectation {
        Expectation {
            state: self.state,
            revision: self.revision,
        }
    }

    /// Returns the active task record, if a task has been triggered.
    #[must_use]
    pub fn current_task(&self) -> Option<&TaskExecution> {
        if self.state == SequenceState::Started {
            self.tasks.get(self.cursor)
        } else {
            None
        }
    }

    /// Returns the planned task at the cursor.
    #[must_use]
    pub fn current_plan(&self) -> Option<&PlannedTask> {
        self.plan.get(self.cursor)
    }

    /// Returns true if any finished task failed.
    #[must_use]
    pub fn has_failed_task(&self) -> bool {
        self.tasks.iter().any(|t| t.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(name: &str) -> PlannedTask {
        PlannedTask::from(&Task::new(name))
    }

    #[test]
    fn test_state_display_and_flags() {
        assert_eq!(SequenceState::Waiting.to_string(), "waiting");
        assert!(SequenceState::Finished.is_terminal());
        assert!(SequenceState::Queued.is_pending());
        assert!(SequenceState::Waiting.is_pending());
        assert!(!SequenceState::Started.is_pending());
    }

    #[test]
    fn test_state_serialize() {
        let json = serde_json::to_string(&SequenceState::Started).unwrap();
        assert_eq!(json, r#""started""#);
        let result: SequenceResult = serde_json::from_str(r#""fail""#).unwrap();
        assert_eq!(result, SequenceResult::Fail);
    }

    #[test]
    fn test_queued_execution() {
        let key = ConcurrencyKey::new("p", "dev", "s");
        let exec = SequenceExecution::queued(
            "ctx",
            &key,
            "delivery",
            vec![planned("a"), planned("b")],
            "v1",
            "evt",
        );
        assert_eq!(exec.state, SequenceState::Queued);
        assert_eq!(exec.key(), key);
        assert_eq!(exec.key().to_string(), "p/dev/s");
        assert!(exec.current_task().is_none());
        assert_eq!(exec.current_plan().map(|t| t.name.as_str()), Some("a"));
        assert_eq!(
            exec.expectation(),
            Expectation {
                state: SequenceState::Queued,
                revision: 0
            }
        );
    }

    #[test]
    fn test_planned_task_snapshot() {
        let task = Task::new("deploy")
            .with_properties(serde_json::json!({"strategy": "blue_green"}))
            .continue_on_failure();
        let planned = PlannedTask::from(&task);
        assert_eq!(planned.name, "deploy");
        assert!(planned.continue_on_failure);
        assert_eq!(planned.properties["strategy"], "blue_green");
    }

    #[test]
    fn test_sequence_result_to_event_result() {
        assert_eq!(EventResult::from(SequenceResult::Pass), EventResult::Pass);
        assert_eq!(EventResult::from(SequenceResult::Fail), EventResult::Fail);
    }
}
