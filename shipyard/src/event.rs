//! Lifecycle event envelope and event-type grammar.
//!
//! Every message on the bus is an [`EventEnvelope`]. Its `type` encodes what
//! happened and to what:
//!
//! - `<ns>.<stage>.<sequence>.<phase>` for sequence events
//! - `<ns>.<task>.<phase>` for task events
//!
//! where `<ns>` is the configured namespace (default `sh.keptn.event`) and
//! `<phase>` is one of `triggered`, `started`, `finished`. The publish subject
//! of an event is its type.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::errors::{EventError, ShipyardError};

/// Default event namespace.
pub const DEFAULT_NAMESPACE: &str = "sh.keptn.event";

/// CloudEvents spec version stamped on outbound events.
pub const SPEC_VERSION: &str = "1.0";

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9_-]*[A-Za-z0-9])?$")
            .unwrap_or_else(|_| unreachable!("static pattern is valid"))
    })
}

/// Returns true if `segment` is a valid stage/sequence/task name segment.
#[must_use]
pub fn is_valid_segment(segment: &str) -> bool {
    segment_pattern().is_match(segment)
}

/// Lifecycle phase of a sequence or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Work was requested.
    Triggered,
    /// Work was picked up.
    Started,
    /// Work completed (with any outcome).
    Finished,
}

impl Phase {
    /// Returns the phase suffix used in event types.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Started => "started",
            Self::Finished => "finished",
        }
    }

    /// Parses a phase suffix.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "triggered" => Some(Self::Triggered),
            "started" => Some(Self::Started),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `<stage>.<sequence>.<phase>`
    Sequence {
        /// Stage name.
        stage: String,
        /// Sequence name.
        sequence: String,
        /// Phase.
        phase: Phase,
    },
    /// `<task>.<phase>`
    Task {
        /// Task name.
        task: String,
        /// Phase.
        phase: Phase,
    },
}

impl EventKind {
    /// Creates a sequence event kind.
    #[must_use]
    pub fn sequence(stage: impl Into<String>, sequence: impl Into<String>, phase: Phase) -> Self {
        Self::Sequence {
            stage: stage.into(),
            sequence: sequence.into(),
            phase,
        }
    }

    /// Creates a task event kind.
    #[must_use]
    pub fn task(task: impl Into<String>, phase: Phase) -> Self {
        Self::Task {
            task: task.into(),
            phase,
        }
    }

    /// Parses an event type without namespace (`dev.delivery.finished`).
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownType`] if the type does not follow the grammar.
    pub fn parse_local(local_type: &str) -> Result<Self, EventError> {
        let unknown = || EventError::UnknownType(local_type.to_string());
        let segments: Vec<&str> = local_type.split('.').collect();
        let (phase, names) = segments.split_last().ok_or_else(unknown)?;
        let phase = Phase::parse(phase).ok_or_else(unknown)?;
        if !names.iter().all(|s| is_valid_segment(s)) {
            return Err(unknown());
        }
        match names {
            [task] => Ok(Self::task(*task, phase)),
            [stage, sequence] => Ok(Self::sequence(*stage, *sequence, phase)),
            _ => Err(unknown()),
        }
    }

    /// Parses a fully qualified event type (`<ns>.<...>.<phase>`).
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownType`] if the namespace prefix is missing or
    /// the remainder does not follow the grammar.
    pub fn parse(event_type: &str, namespace: &str) -> Result<Self, EventError> {
        let local = strip_namespace(event_type, namespace)
            .ok_or_else(|| EventError::UnknownType(event_type.to_string()))?;
        Self::parse_local(local)
    }

    /// Returns the phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::Sequence { phase, .. } | Self::Task { phase, .. } => *phase,
        }
    }

    /// Returns the type without namespace.
    #[must_use]
    pub fn local_type(&self) -> String {
        match self {
            Self::Sequence {
                stage,
                sequence,
                phase,
            } => format!("{stage}.{sequence}.{phase}"),
            Self::Task { task, phase } => format!("{task}.{phase}"),
        }
    }

    /// Returns the fully qualified type.
    #[must_use]
    pub fn event_type(&self, namespace: &str) -> String {
        format!("{namespace}.{}", self.local_type())
    }
}

/// Strips `"<namespace>."` from an event type.
#[must_use]
pub fn strip_namespace<'a>(event_type: &'a str, namespace: &str) -> Option<&'a str> {
    event_type
        .strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix('.'))
}

/// Outcome reported by a task or sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventResult {
    /// Succeeded.
    Pass,
    /// Succeeded with warnings; counts as pass.
    Warning,
    /// Failed.
    Fail,
}

impl fmt::Display for EventResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Warning => write!(f, "warning"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Execution status reported by a task executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// The executor ran to completion.
    Succeeded,
    /// The executor itself errored.
    Errored,
    /// Unknown status.
    Unknown,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Errored => write!(f, "errored"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Typed event payload.
///
/// The well-known fields are explicit; anything else is kept in `extra` and
/// forwarded untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Project name.
    #[serde(default)]
    pub project: String,
    /// Stage name.
    #[serde(default)]
    pub stage: String,
    /// Service name.
    #[serde(default)]
    pub service: String,
    /// Pass/fail outcome used by selector predicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<EventResult>,
    /// Executor status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    /// Free-form message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Additional payload fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EventData {
    /// Creates data for a project/stage/service triple.
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
            ..Self::default()
        }
    }

    /// Sets the result.
    #[must_use]
    pub fn with_result(mut self, result: EventResult) -> Self {
        self.result = Some(result);
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Adds an extra field.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Looks up a field by name as a string, for selector predicates.
    ///
    /// Only scalar values are visible; objects and arrays yield `None`.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<String> {
        match key {
            "project" => Some(self.project.clone()),
            "stage" => Some(self.stage.clone()),
            "service" => Some(self.service.clone()),
            "result" => self.result.map(|r| r.to_string()),
            "status" => self.status.map(|s| s.to_string()),
            "message" => self.message.clone(),
            other => self.extra.get(other).and_then(scalar_to_string),
        }
    }

    /// Returns true if the payload reports a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.result == Some(EventResult::Fail) || self.status == Some(EventStatus::Errored)
    }
}

/// Renders a scalar JSON value as a string; `None` for null, arrays and objects.
#[must_use]
pub fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

/// The event envelope exchanged over the message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID.
    pub id: String,
    /// Fully qualified event type; also the publish subject.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Producer identity.
    #[serde(default)]
    pub source: String,
    /// Envelope spec version.
    #[serde(default = "default_spec_version")]
    pub specversion: String,
    /// Execution context this event belongs to.
    #[serde(rename = "contextID", alias = "shkeptncontext")]
    pub context_id: String,
    /// ID of the `triggered` event this event responds to.
    #[serde(
        rename = "triggeredID",
        alias = "triggeredid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub triggered_id: Option<String>,
    /// When the event was produced.
    #[serde(default = "chrono::Utc::now")]
    pub time: DateTime<Utc>,
    /// Typed payload.
    #[serde(default)]
    pub data: EventData,
}

impl EventEnvelope {
    /// Creates a new event with a fresh ID.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        context_id: impl Into<String>,
        source: impl Into<String>,
        data: EventData,
    ) -> Self {
        Self {
            id: crate::utils::generate_event_id(),
            event_type: event_type.into(),
            source: source.into(),
            specversion: default_spec_version(),
            context_id: context_id.into(),
            triggered_id: None,
            time: Utc::now(),
            data,
        }
    }

    /// Sets the triggered ID.
    #[must_use]
    pub fn with_triggered_id(mut self, triggered_id: impl Into<String>) -> Self {
        self.triggered_id = Some(triggered_id.into());
        self
    }

    /// Decodes and validates an envelope from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] if the JSON is invalid or the ID,
    /// type or context ID is empty.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EventError> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| EventError::Malformed(e.to_string()))?;
        if envelope.id.trim().is_empty() {
            return Err(EventError::Malformed("missing id".to_string()));
        }
        if envelope.event_type.trim().is_empty() {
            return Err(EventError::Malformed("missing type".to_string()));
        }
        if envelope.context_id.trim().is_empty() {
            return Err(EventError::Malformed("missing contextID".to_string()));
        }
        Ok(envelope)
    }

    /// Encodes the envelope as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_vec(&self) -> Result<Vec<u8>, ShipyardError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses the event type under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownType`] if the type does not follow the grammar.
    pub fn kind(&self, namespace: &str) -> Result<EventKind, EventError> {
        EventKind::parse(&self.event_type, namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_sequence_type() {
        let kind = EventKind::parse("sh.keptn.event.dev.delivery.triggered", DEFAULT_NAMESPACE)
            .unwrap();
        assert_eq!(kind, EventKind::sequence("dev", "delivery", Phase::Triggered));
        assert_eq!(kind.local_type(), "dev.delivery.triggered");
    }

    #[test]
    fn test_parse_task_type() {
        let kind =
            EventKind::parse("sh.keptn.event.mytask.finished", DEFAULT_NAMESPACE).unwrap();
        assert_eq!(kind, EventKind::task("mytask", Phase::Finished));
        assert_eq!(
            kind.event_type(DEFAULT_NAMESPACE),
            "sh.keptn.event.mytask.finished"
        );
    }

    #[test]
    fn test_parse_rejects_bad_types() {
        for bad in [
            "sh.keptn.event.mytask.done",
            "sh.keptn.event.finished",
            "sh.keptn.event.a.b.c.finished",
            "other.ns.mytask.started",
            "sh.keptn.event..started",
            "sh.keptn.eventmytask.started",
        ] {
            assert!(EventKind::parse(bad, DEFAULT_NAMESPACE).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = EventEnvelope::new(
            "sh.keptn.event.mytask.triggered",
            "ctx-1",
            "shipyard-controller",
            EventData::new("proj", "dev", "svc").with_extra("mytask", serde_json::json!({"a": 1})),
        )
        .with_triggered_id("trig-1");

        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "sh.keptn.event.mytask.triggered");
        assert_eq!(json["contextID"], "ctx-1");
        assert_eq!(json["triggeredID"], "trig-1");
        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["data"]["project"], "proj");
        assert_eq!(json["data"]["mytask"]["a"], 1);
        assert!(json["data"].get("result").is_none());
    }

    #[test]
    fn test_from_slice_accepts_legacy_context_field() {
        let raw = br#"{
            "id": "e1",
            "type": "sh.keptn.event.mytask.finished",
            "shkeptncontext": "ctx-9",
            "triggeredid": "t1",
            "data": {"project": "p", "stage": "dev", "service": "s", "result": "fail", "status": "succeeded"}
        }"#;
        let envelope = EventEnvelope::from_slice(raw).unwrap();
        assert_eq!(envelope.context_id, "ctx-9");
        assert_eq!(envelope.triggered_id.as_deref(), Some("t1"));
        assert_eq!(envelope.data.result, Some(EventResult::Fail));
        assert!(envelope.data.is_failure());
    }

    #[test]
    fn test_from_slice_rejects_malformed() {
        assert!(EventEnvelope::from_slice(b"not json").is_err());
        assert!(EventEnvelope::from_slice(br#"{"id":"","type":"x","contextID":"c"}"#).is_err());
        assert!(EventEnvelope::from_slice(br#"{"id":"1","type":"x","contextID":""}"#).is_err());
        assert!(
            EventEnvelope::from_slice(br#"{"id":"1","type":"x","contextID":"c","data":{"result":"maybe"}}"#)
                .is_err()
        );
    }

    #[test]
    fn test_field_lookup() {
        let data = EventData::new("p", "dev", "s")
            .with_result(EventResult::Warning)
            .with_extra("count", serde_json::json!(3))
            .with_extra("nested", serde_json::json!({"x": 1}));
        assert_eq!(data.field("result").as_deref(), Some("warning"));
        assert_eq!(data.field("stage").as_deref(), Some("dev"));
        assert_eq!(data.field("count").as_deref(), Some("3"));
        assert_eq!(data.field("nested"), None);
        assert_eq!(data.field("missing"), None);
        assert!(!data.is_failure());
    }

    #[test]
    fn test_errored_status_is_failure() {
        let data = EventData::new("p", "dev", "s")
            .with_result(EventResult::Pass)
            .with_status(EventStatus::Errored);
        assert!(data.is_failure());
    }
}
