//! Shipyard document model.
//!
//! A shipyard is the declarative pipeline definition of a project: an ordered
//! list of stages, each holding ordered sequences of tasks, plus trigger rules
//! that chain sequences on the outcome of other sequences.
//!
//! ```yaml
//! apiVersion: spec.keptn.sh/0.2.0
//! kind: Shipyard
//! metadata:
//!   name: my-shipyard
//! spec:
//!   stages:
//!     - name: dev
//!       sequences:
//!         - name: delivery
//!           tasks:
//!             - name: deployment
//!               properties:
//!                 strategy: direct
//!             - name: test
//!               continueOnFailure: true
//!         - name: rollback
//!           tasks:
//!             - name: rollback
//!           triggeredOn:
//!             - event: dev.delivery.finished
//!               selector:
//!                 match:
//!                   result: fail
//! ```
//!
//! Trigger rules are kept in their raw form and only interpreted by the
//! [`selector`](crate::selector) evaluator, so a malformed rule never prevents
//! the rest of the document from loading.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::errors::ShipyardParseError;

/// The `kind` every shipyard document must declare.
pub const SHIPYARD_KIND: &str = "Shipyard";

/// A complete shipyard document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipyardDocument {
    /// Schema version, e.g. `spec.keptn.sh/0.2.0`.
    pub api_version: String,
    /// Must be [`SHIPYARD_KIND`].
    pub kind: String,
    /// Document metadata.
    #[serde(default)]
    pub metadata: ShipyardMetadata,
    /// The stages and sequences.
    pub spec: ShipyardSpec,
}

/// Shipyard metadata block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipyardMetadata {
    /// Human readable name.
    #[serde(default)]
    pub name: String,
}

/// Ordered set of stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShipyardSpec {
    /// Stages in declaration order.
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// A named stage holding ordered sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name.
    pub name: String,
    /// Sequences in declaration order.
    #[serde(default)]
    pub sequences: Vec<Sequence>,
}

/// A named, ordered list of tasks plus the rules that trigger it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    /// Sequence name, unique within its stage.
    pub name: String,
    /// Tasks executed in order.
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Rules that trigger this sequence when another sequence finishes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered_on: Vec<TriggerRule>,
}

/// A single task of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task name; also the event type stem (`<task>.triggered`).
    pub name: String,
    /// Opaque properties forwarded to the task executor.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub properties: serde_json::Value,
    /// Keep going with the next task when this one fails.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_failure: bool,
}

impl Task {
    /// Creates a task without properties.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: serde_json::Value::Null,
            continue_on_failure: false,
        }
    }

    /// Sets the task properties.
    #[must_use]
    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }

    /// Marks the task as continue-on-failure.
    #[must_use]
    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// Declarative condition that triggers a sequence.
///
/// `event` names the source event type (`<stage>.<sequence>.finished`), and the
/// optional selector lists equality predicates over the source event's data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    /// Source event type.
    #[serde(default)]
    pub event: String,
    /// Raw selector block; interpreted by the selector evaluator.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub selector: serde_json::Value,
}

impl TriggerRule {
    /// Creates a rule without predicates.
    #[must_use]
    pub fn on(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            selector: serde_json::Value::Null,
        }
    }

    /// Adds an equality predicate to the selector.
    #[must_use]
    pub fn matching(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut predicates: BTreeMap<String, serde_json::Value> = self
            .selector
            .get("match")
            .and_then(|m| serde_json::from_value(m.clone()).ok())
            .unwrap_or_default();
        predicates.insert(key.into(), serde_json::Value::String(value.into()));
        self.selector = serde_json::json!({ "match": predicates });
        self
    }
}

impl ShipyardDocument {
    /// Parses and validates a YAML shipyard document.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid, the kind is wrong, or stage and
    /// sequence names are empty or duplicated.
    pub fn from_yaml(content: &str) -> Result<Self, ShipyardParseError> {
        let document: Self = serde_yaml::from_str(content)
            .map_err(|e| ShipyardParseError::new(format!("YAML error: {e}")))?;
        document.validate()?;
        Ok(document)
    }

    /// Builds a document from stages, for programmatic construction.
    #[must_use]
    pub fn from_stages(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            api_version: "spec.keptn.sh/0.2.0".to_string(),
            kind: SHIPYARD_KIND.to_string(),
            metadata: ShipyardMetadata { name: name.into() },
            spec: ShipyardSpec { stages },
        }
    }

    /// Validates document structure.
    ///
    /// Trigger rules are deliberately not checked here.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violation found.
    pub fn validate(&self) -> Result<(), ShipyardParseError> {
        if self.kind != SHIPYARD_KIND {
            return Err(ShipyardParseError::new(format!(
                "kind must be '{SHIPYARD_KIND}', got '{}'",
                self.kind
            )));
        }
        if self.api_version.trim().is_empty() {
            return Err(ShipyardParseError::new("apiVersion must not be empty"));
        }

        let mut stage_names = HashSet::new();
        for stage in &self.spec.stages {
            if stage.name.trim().is_empty() {
                return Err(ShipyardParseError::new("stage name must not be empty"));
            }
            if !stage_names.insert(stage.name.as_str()) {
                return Err(ShipyardParseError::new(format!(
                    "duplicate stage '{}'",
                    stage.name
                )));
            }

            let mut sequence_names = HashSet::new();
            for sequence in &stage.sequences {
                if sequence.name.trim().is_empty() {
                    return Err(ShipyardParseError::new(format!(
                        "stage '{}' has a sequence without a name",
                        stage.name
                    )));
                }
                if !sequence_names.insert(sequence.name.as_str()) {
                    return Err(ShipyardParseError::new(format!(
                        "duplicate sequence '{}' in stage '{}'",
                        sequence.name, stage.name
                    )));
                }
                if sequence.tasks.iter().any(|t| t.name.trim().is_empty()) {
                    return Err(ShipyardParseError::new(format!(
                        "sequence '{}.{}' has a task without a name",
                        stage.name, sequence.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the stage with the given name.
    #[must_use]
    pub fn find_stage(&self, stage: &str) -> Option<&Stage> {
        self.spec.stages.iter().find(|s| s.name == stage)
    }

    /// Returns the sequence `name` of stage `stage`.
    #[must_use]
    pub fn find_sequence(&self, stage: &str, name: &str) -> Option<&Sequence> {
        self.find_stage(stage)
            .and_then(|s| s.sequences.iter().find(|seq| seq.name == name))
    }
}

impl Stage {
    /// Creates a stage.
    #[must_use]
    pub fn new(name: impl Into<String>, sequences: Vec<Sequence>) -> Self {
        Self {
            name: name.into(),
            sequences,
        }
    }
}

impl Sequence {
    /// Creates a sequence with tasks and no trigger rules.
    #[must_use]
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            tasks,
            triggered_on: Vec::new(),
        }
    }

    /// Adds a trigger rule.
    #[must_use]
    pub fn triggered_on(mut self, rule: TriggerRule) -> Self {
        self.triggered_on.push(rule);
        self
    }
}

/// A shipyard document together with the version marker it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedShipyard {
    /// Commit or version marker from the configuration provider.
    pub version: String,
    /// The parsed document.
    pub document: ShipyardDocument,
}

impl VersionedShipyard {
    /// Wraps a document with its version marker.
    #[must_use]
    pub fn new(version: impl Into<String>, document: ShipyardDocument) -> Self {
        Self {
            version: version.into(),
            document,
        }
    }
}
