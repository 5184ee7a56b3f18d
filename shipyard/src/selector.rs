//! Trigger-rule evaluation.
//!
//! Given a `<stage>.<sequence>.finished` event, find every sequence whose
//! trigger rules match it. A rule matches when its `event` equals the finished
//! event type and every `selector.match` predicate equals the corresponding
//! field of the event data. Predicates within a rule are AND-combined, rules
//! on one sequence are OR-combined.
//!
//! Evaluation never fails: a rule that cannot be interpreted simply does not
//! match.

use std::collections::BTreeMap;

use crate::event::{scalar_to_string, strip_namespace, EventData, EventKind, Phase};
use crate::model::{ShipyardDocument, TriggerRule};

/// A sequence selected for triggering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggeredSequence {
    /// Stage of the sequence.
    pub stage: String,
    /// Sequence name.
    pub sequence: String,
}

impl TriggeredSequence {
    /// Creates a new entry.
    #[must_use]
    pub fn new(stage: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            sequence: sequence.into(),
        }
    }
}

/// A trigger rule reduced to a source type and equality predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompiledRule {
    source_type: String,
    predicates: BTreeMap<String, String>,
}

impl CompiledRule {
    /// Compiles a raw rule; `None` means the rule is malformed.
    fn compile(rule: &TriggerRule, namespace: &str) -> Option<Self> {
        let local = strip_namespace(&rule.event, namespace).unwrap_or(&rule.event);
        match EventKind::parse_local(local).ok()? {
            EventKind::Sequence {
                phase: Phase::Finished,
                ..
            } => {}
            _ => return None,
        }

        let predicates = match &rule.selector {
            serde_json::Value::Null => BTreeMap::new(),
            serde_json::Value::Object(selector) => match selector.get("match") {
                None | Some(serde_json::Value::Null) => BTreeMap::new(),
                Some(serde_json::Value::Object(matches)) => {
                    let mut predicates = BTreeMap::new();
                    for (key, value) in matches {
                        if key.is_empty() {
                            return None;
                        }
                        predicates.insert(key.clone(), scalar_to_string(value)?);
                    }
                    predicates
                }
                Some(_) => return None,
            },
            _ => return None,
        };

        Some(Self {
            source_type: local.to_string(),
            predicates,
        })
    }

    fn matches(&self, local_type: &str, data: &EventData) -> bool {
        self.source_type == local_type
            && self
                .predicates
                .iter()
                .all(|(key, expected)| data.field(key).as_deref() == Some(expected.as_str()))
    }
}

/// Returns every sequence triggered by a finished event, deduplicated, in
/// shipyard declaration order.
///
/// `event_type` may be given with or without the namespace prefix.
#[must_use]
pub fn resolve_triggered_sequences(
    shipyard: &ShipyardDocument,
    namespace: &str,
    event_type: &str,
    data: &EventData,
) -> Vec<TriggeredSequence> {
    let local_type = strip_namespace(event_type, namespace).unwrap_or(event_type);
    let mut triggered: Vec<TriggeredSequence> = Vec::new();

    for stage in &shipyard.spec.stages {
        for sequence in &stage.sequences {
            let matched = sequence.triggered_on.iter().any(|rule| {
                CompiledRule::compile(rule, namespace)
                    .is_some_and(|compiled| compiled.matches(local_type, data))
            });
            if matched {
                let entry = TriggeredSequence::new(&stage.name, &sequence.name);
                if !triggered.contains(&entry) {
                    triggered.push(entry);
                }
            }
        }
    }

    if !triggered.is_empty() {
        tracing::debug!(
            event_type = %local_type,
            matches = triggered.len(),
            "Trigger rules matched"
        );
    }
    triggered
}
