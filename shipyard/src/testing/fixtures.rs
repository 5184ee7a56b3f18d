//! Shipyards and event builders shared by tests.

use std::future::Future;
use std::time::Duration;

use crate::event::{EventData, EventEnvelope, EventKind, EventResult, Phase, DEFAULT_NAMESPACE};
use crate::model::{Sequence, ShipyardDocument, Stage, Task, TriggerRule};

/// Source stamped on events produced by test executors.
pub const TEST_SOURCE: &str = "test-executor";

/// A three-stage shipyard with chained and selector-guarded sequences.
pub const REFERENCE_SHIPYARD: &str = r"apiVersion: spec.keptn.sh/0.2.0
kind: Shipyard
metadata:
  name: test-shipyard
spec:
  stages:
  - name: dev
    sequences:
    - name: delivery
      tasks:
      - name: mytask
        properties:
          strategy: direct
      - name: test
        properties:
          kind: functional
      - name: evaluation
      - name: release
    - name: rollback
      tasks:
      - name: rollback
      triggeredOn:
        - event: dev.artifact-delivery.finished
          selector:
            match:
              result: fail
  - name: hardening
    sequences:
    - name: artifact-delivery
      triggeredOn:
        - event: dev.artifact-delivery.finished
      tasks:
      - name: deployment
        properties:
          strategy: blue_green_service
      - name: test
        properties:
          kind: performance
      - name: evaluation
      - name: release
  - name: production
    sequences:
    - name: artifact-delivery
      triggeredOn:
        - event: hardening.artifact-delivery.finished
      tasks:
      - name: deployment
        properties:
          strategy: blue_green
      - name: release
    - name: remediation
      tasks:
      - name: remediation
      - name: evaluation
";

/// Parses [`REFERENCE_SHIPYARD`].
#[must_use]
pub fn reference_shipyard() -> ShipyardDocument {
    match ShipyardDocument::from_yaml(REFERENCE_SHIPYARD) {
        Ok(doc) => doc,
        Err(e) => panic!("reference shipyard must parse: {e}"),
    }
}

/// A single-stage shipyard: `dev.delivery` plus `dev.rollback` triggered when
/// delivery fails.
#[must_use]
pub fn rollback_shipyard() -> ShipyardDocument {
    ShipyardDocument::from_stages(
        "rollback-shipyard",
        vec![Stage::new(
            "dev",
            vec![
                Sequence::new(
                    "delivery",
                    vec![
                        Task::new("mytask")
                            .with_properties(serde_json::json!({"strategy": "direct"})),
                        Task::new("test"),
                        Task::new("evaluation"),
                        Task::new("release"),
                    ],
                ),
                Sequence::new("rollback", vec![Task::new("rollback")]).triggered_on(
                    TriggerRule::on("dev.delivery.finished").matching("result", "fail"),
                ),
            ],
        )],
    )
}

/// A shipyard with one sequence of the given tasks in stage `dev`.
#[must_use]
pub fn single_sequence_shipyard(sequence: &str, tasks: Vec<Task>) -> ShipyardDocument {
    ShipyardDocument::from_stages(
        "single",
        vec![Stage::new("dev", vec![Sequence::new(sequence, tasks)])],
    )
}

/// Builds a `<stage>.<sequence>.triggered` event with a fresh context ID.
#[must_use]
pub fn sequence_triggered(project: &str, stage: &str, sequence: &str, service: &str) -> EventEnvelope {
    EventEnvelope::new(
        EventKind::sequence(stage, sequence, Phase::Triggered).event_type(DEFAULT_NAMESPACE),
        crate::utils::generate_uuid().to_string(),
        TEST_SOURCE,
        EventData::new(project, stage, service),
    )
}

/// Builds a task event responding to `trigger`.
#[must_use]
pub fn task_response(trigger: &EventEnvelope, task: &str, phase: Phase) -> EventEnvelope {
    EventEnvelope::new(
        EventKind::task(task, phase).event_type(DEFAULT_NAMESPACE),
        trigger.context_id.clone(),
        TEST_SOURCE,
        EventData::new(
            trigger.data.project.clone(),
            trigger.data.stage.clone(),
            trigger.data.service.clone(),
        ),
    )
    .with_triggered_id(trigger.id.clone())
}

/// Builds a `<task>.finished` event with the given result.
#[must_use]
pub fn task_finished(trigger: &EventEnvelope, task: &str, result: EventResult) -> EventEnvelope {
    let mut event = task_response(trigger, task, Phase::Finished);
    event.data.result = Some(result);
    event
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_shipyards_validate() {
        assert!(reference_shipyard().validate().is_ok());
        assert!(rollback_shipyard().validate().is_ok());
    }

    #[test]
    fn test_task_response_correlates() {
        let trigger = sequence_triggered("p", "dev", "delivery", "s");
        let response = task_finished(&trigger, "mytask", EventResult::Fail);
        assert_eq!(response.context_id, trigger.context_id);
        assert_eq!(response.triggered_id.as_deref(), Some(trigger.id.as_str()));
        assert_eq!(response.event_type, "sh.keptn.event.mytask.finished");
        assert!(response.data.is_failure());
    }

    #[tokio::test]
    async fn test_eventually_times_out() {
        assert!(!eventually(Duration::from_millis(30), || async { false }).await);
        assert!(eventually(Duration::from_millis(30), || async { true }).await);
    }
}
