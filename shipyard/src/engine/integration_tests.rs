//! End-to-end scenarios against the in-memory store, bus and lease backend.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pretty_assertions::assert_eq;

use super::*;
use crate::bus::{BusMessage, EventPublisher, InMemoryMessageBus};
use crate::cancellation::CancellationToken;
use crate::config::ControllerConfig;
use crate::controller::ShipyardController;
use crate::event::{EventEnvelope, EventResult, Phase, DEFAULT_NAMESPACE};
use crate::execution::{ConcurrencyKey, SequenceExecution, SequenceResult, SequenceState};
use crate::leader::{InMemoryLeaseBackend, LeaderElection, LeaseBackend, LeaseConfig};
use crate::model::{Sequence, ShipyardDocument, Stage, Task, TriggerRule};
use crate::provider::StaticShipyardProvider;
use crate::store::{InMemorySequenceStore, SequenceStateStore};
use crate::testing::fixtures::{
    eventually, rollback_shipyard, sequence_triggered, task_finished, task_response,
};
use crate::testing::mocks::{ConflictInjectingStore, RecordingDuties};

/// Drives the engine by hand: events in through the handler, events out
/// through explicit dispatcher ticks.
struct Harness {
    store: Arc<InMemorySequenceStore>,
    bus: Arc<InMemoryMessageBus>,
    handler: EventCorrelationHandler,
    sequences: SequenceDispatcher,
    events: EventDispatcher,
}

impl Harness {
    fn new(shipyard: ShipyardDocument) -> Self {
        let store = Arc::new(InMemorySequenceStore::new());
        Self::over(store.clone(), store, shipyard)
    }

    fn over(
        store: Arc<InMemorySequenceStore>,
        engine_store: Arc<dyn SequenceStateStore>,
        shipyard: ShipyardDocument,
    ) -> Self {
        let bus = Arc::new(InMemoryMessageBus::new());
        let provider = Arc::new(StaticShipyardProvider::with_project("sockshop", shipyard));
        let lifecycle = Arc::new(SequenceLifecycle::new(
            Arc::clone(&engine_store),
            provider,
            LifecycleSettings::new(EventOrigin::new(DEFAULT_NAMESPACE, "shipyard-controller")),
        ));
        Self {
            handler: EventCorrelationHandler::new(Arc::clone(&lifecycle)),
            sequences: SequenceDispatcher::new(lifecycle),
            events: EventDispatcher::new(engine_store, bus.clone(), 100),
            store,
            bus,
        }
    }

    async fn send(&self, event: &EventEnvelope) {
        self.handler.handle(event).await.unwrap();
    }

    /// Publishes everything queued and returns what was published.
    async fn flush(&self) -> Vec<EventEnvelope> {
        let before = self.bus.published().len();
        self.events.dispatch().await.unwrap();
        self.bus.published()[before..]
            .iter()
            .map(|m| EventEnvelope::from_slice(&m.payload).unwrap())
            .collect()
    }

    async fn execution(&self, context_id: &str) -> SequenceExecution {
        self.store.get_by_context(context_id).await.unwrap()
    }

    fn executions_of(&self, sequence: &str) -> Vec<SequenceExecution> {
        self.store
            .list_all()
            .into_iter()
            .filter(|e| e.sequence == sequence)
            .collect()
    }
}

fn of_type<'a>(events: &'a [EventEnvelope], context_id: &str, suffix: &str) -> Vec<&'a EventEnvelope> {
    events
        .iter()
        .filter(|e| e.context_id == context_id && e.event_type.ends_with(suffix))
        .collect()
}

fn types(events: &[EventEnvelope]) -> Vec<String> {
    events.iter().map(|e| e.event_type.clone()).collect()
}

#[tokio::test]
async fn test_second_trigger_waits_then_starts_once() {
    let h = Harness::new(single_task_shipyard());
    let a = sequence_triggered("sockshop", "dev", "delivery", "carts");
    let b = sequence_triggered("sockshop", "dev", "delivery", "carts");
    h.send(&a).await;
    h.send(&b).await;

    assert_eq!(h.execution(&b.context_id).await.state, SequenceState::Waiting);
    let published = h.flush().await;
    let deploy_a = of_type(&published, &a.context_id, "deploy.triggered")[0].clone();
    assert!(of_type(&published, &b.context_id, ".triggered").is_empty());

    h.send(&task_finished(&deploy_a, "deploy", EventResult::Fail)).await;
    let published = h.flush().await;

    assert_eq!(h.execution(&b.context_id).await.state, SequenceState::Started);
    assert_eq!(of_type(&published, &b.context_id, "deploy.triggered").len(), 1);

    // A sweep afterwards changes nothing.
    h.sequences.dispatch().await.unwrap();
    assert!(of_type(&h.flush().await, &b.context_id, "deploy.triggered").is_empty());
}

#[tokio::test]
async fn test_failing_task_aborts_sequence() {
    let h = Harness::new(rollback_shipyard());
    let trigger = sequence_triggered("sockshop", "dev", "delivery", "carts");
    h.send(&trigger).await;
    let published = h.flush().await;
    let mytask = of_type(&published, &trigger.context_id, "mytask.triggered")[0].clone();

    h.send(&task_response(&mytask, "mytask", Phase::Started)).await;
    h.send(&task_finished(&mytask, "mytask", EventResult::Fail)).await;
    let published = h.flush().await;

    let execution = h.execution(&trigger.context_id).await;
    assert_eq!(execution.state, SequenceState::Finished);
    assert_eq!(execution.result, Some(SequenceResult::Fail));
    assert!(of_type(&published, &trigger.context_id, "test.triggered").is_empty());
    let finished = of_type(&published, &trigger.context_id, "dev.delivery.finished");
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].data.result, Some(EventResult::Fail));
}

#[tokio::test]
async fn test_continue_on_failure_runs_remaining_tasks() {
    let h = Harness::new(ShipyardDocument::from_stages(
        "lenient",
        vec![Stage::new(
            "dev",
            vec![Sequence::new(
                "delivery",
                vec![Task::new("lint").continue_on_failure(), Task::new("deploy")],
            )],
        )],
    ));
    let trigger = sequence_triggered("sockshop", "dev", "delivery", "carts");
    h.send(&trigger).await;
    let lint = of_type(&h.flush().await, &trigger.context_id, "lint.triggered")[0].clone();

    h.send(&task_finished(&lint, "lint", EventResult::Fail)).await;
    let deploy = of_type(&h.flush().await, &trigger.context_id, "deploy.triggered")[0].clone();
    h.send(&task_finished(&deploy, "deploy", EventResult::Pass)).await;
    h.flush().await;

    let execution = h.execution(&trigger.context_id).await;
    assert_eq!(execution.state, SequenceState::Finished);
    assert_eq!(execution.result, Some(SequenceResult::Fail));
}

#[tokio::test]
async fn test_trigger_rules_create_one_execution_per_sequence() {
    // Two rules on the same sequence both match; the sequence still runs once.
    let promote = Sequence::new("delivery", vec![Task::new("deploy")])
        .triggered_on(TriggerRule::on("dev.delivery.finished"))
        .triggered_on(TriggerRule::on("dev.delivery.finished").matching("result", "pass"));
    let h = Harness::new(ShipyardDocument::from_stages(
        "chain",
        vec![
            Stage::new("dev", vec![Sequence::new("delivery", vec![Task::new("deploy")])]),
            Stage::new("hardening", vec![promote]),
        ],
    ));

    let trigger = sequence_triggered("sockshop", "dev", "delivery", "carts");
    h.send(&trigger).await;
    let deploy = of_type(&h.flush().await, &trigger.context_id, "deploy.triggered")[0].clone();
    h.send(&task_finished(&deploy, "deploy", EventResult::Pass)).await;
    let published = h.flush().await;

    let hardening: Vec<_> = h
        .store
        .list_all()
        .into_iter()
        .filter(|e| e.stage == "hardening")
        .collect();
    assert_eq!(hardening.len(), 1);
    assert_eq!(hardening[0].state, SequenceState::Started);

    // The follow-on trigger comes back over the bus; applying it again is a no-op.
    let follow_on = published
        .iter()
        .find(|e| e.event_type == "sh.keptn.event.hardening.delivery.triggered")
        .unwrap()
        .clone();
    h.send(&follow_on).await;
    assert_eq!(
        h.store
            .list_all()
            .into_iter()
            .filter(|e| e.stage == "hardening")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_replayed_task_finished_does_not_duplicate_trigger() {
    let h = Harness::new(rollback_shipyard());
    let trigger = sequence_triggered("sockshop", "dev", "delivery", "carts");
    h.send(&trigger).await;
    let mytask = of_type(&h.flush().await, &trigger.context_id, "mytask.triggered")[0].clone();
    let finished = task_finished(&mytask, "mytask", EventResult::Pass);

    h.send(&finished).await;
    let first = h.flush().await;
    h.send(&finished).await;
    h.send(&task_response(&mytask, "mytask", Phase::Started)).await;
    let second = h.flush().await;

    assert_eq!(of_type(&first, &trigger.context_id, "test.triggered").len(), 1);
    assert!(second.is_empty(), "replay published {:?}", types(&second));
    assert_eq!(h.execution(&trigger.context_id).await.cursor, 1);
}

#[tokio::test]
async fn test_delivery_failure_promotes_waiting_and_triggers_rollback() {
    let h = Harness::new(rollback_shipyard());
    let first = sequence_triggered("sockshop", "dev", "delivery", "carts");
    let second = sequence_triggered("sockshop", "dev", "delivery", "carts");
    h.send(&first).await;
    h.send(&second).await;

    assert_eq!(h.execution(&first.context_id).await.state, SequenceState::Started);
    assert_eq!(h.execution(&second.context_id).await.state, SequenceState::Waiting);

    let published = h.flush().await;
    let mytask = of_type(&published, &first.context_id, "mytask.triggered")[0].clone();
    assert_eq!(mytask.data.extra["mytask"]["strategy"], "direct");

    h.send(&task_response(&mytask, "mytask", Phase::Started)).await;
    h.send(&task_finished(&mytask, "mytask", EventResult::Fail)).await;
    let published = h.flush().await;

    let first_state = h.execution(&first.context_id).await;
    assert_eq!(first_state.state, SequenceState::Finished);
    assert_eq!(first_state.result, Some(SequenceResult::Fail));

    assert_eq!(h.execution(&second.context_id).await.state, SequenceState::Started);
    assert_eq!(of_type(&published, &second.context_id, "mytask.triggered").len(), 1);

    let rollbacks = h.executions_of("rollback");
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].stage, "dev");
    assert_eq!(rollbacks[0].state, SequenceState::Waiting);
    let finished_id = &of_type(&published, &first.context_id, "dev.delivery.finished")[0].id;
    assert_eq!(rollbacks[0].triggered_by.as_ref(), Some(finished_id));

    // Per-context order on the bus: started before the first task trigger.
    let second_events = types(
        &published
            .iter()
            .filter(|e| e.context_id == second.context_id)
            .cloned()
            .collect::<Vec<_>>(),
    );
    assert_eq!(
        second_events,
        vec![
            "sh.keptn.event.dev.delivery.started".to_string(),
            "sh.keptn.event.mytask.triggered".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_concurrent_triggers_keep_one_started_and_fifo_order() {
    let store = Arc::new(InMemorySequenceStore::new());
    let replicas: Vec<Arc<Harness>> = (0..3)
        .map(|_| Arc::new(Harness::over(store.clone(), store.clone(), single_task_shipyard())))
        .collect();
    let key = ConcurrencyKey::new("sockshop", "dev", "carts");

    let triggers: Vec<EventEnvelope> = (0..12)
        .map(|_| sequence_triggered("sockshop", "dev", "delivery", "carts"))
        .collect();
    let mut handles = Vec::new();
    for (i, trigger) in triggers.iter().enumerate() {
        // Every replica sees every event, as with a plain subscription.
        for replica in &replicas {
            let replica = Arc::clone(replica);
            let trigger = trigger.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(u64::try_from(i).unwrap())).await;
                replica.send(&trigger).await;
            }));
        }
    }
    for result in join_all(handles).await {
        result.unwrap();
    }
    assert_eq!(store.started_count(&key), 1);

    let h = &replicas[0];
    let mut started_order = Vec::new();
    for _ in 0..triggers.len() {
        h.sequences.dispatch().await.unwrap();
        assert_eq!(store.started_count(&key), 1);
        let current = store
            .list_by_key_and_state(&key, SequenceState::Started)
            .await
            .unwrap()
            .remove(0);
        started_order.push(current.triggered_at);

        let published = h.flush().await;
        let deploy = of_type(&published, &current.context_id, "deploy.triggered")[0].clone();
        // Deliver the response to every replica concurrently.
        let finished = task_finished(&deploy, "deploy", EventResult::Pass);
        let mut handles = Vec::new();
        for replica in &replicas {
            let replica = Arc::clone(replica);
            let finished = finished.clone();
            handles.push(tokio::spawn(async move { replica.send(&finished).await }));
        }
        for result in join_all(handles).await {
            result.unwrap();
        }
        assert!(store.started_count(&key) <= 1);
    }

    // The first admission races with creation; every promotion after it is FIFO.
    assert!(started_order[1..].windows(2).all(|w| w[0] <= w[1]));
    assert!(store
        .list_all()
        .iter()
        .all(|e| e.state == SequenceState::Finished));
}

#[tokio::test]
async fn test_conflicts_are_retried() {
    let store = Arc::new(InMemorySequenceStore::new());
    let conflicting = Arc::new(ConflictInjectingStore::new(store.clone()));
    let h = Harness::over(store, conflicting.clone(), rollback_shipyard());

    let trigger = sequence_triggered("sockshop", "dev", "delivery", "carts");
    conflicting.conflict_next(2);
    h.send(&trigger).await;
    assert_eq!(conflicting.injected(), 2);
    assert_eq!(h.execution(&trigger.context_id).await.state, SequenceState::Started);

    let mytask = of_type(&h.flush().await, &trigger.context_id, "mytask.triggered")[0].clone();
    conflicting.conflict_next(1);
    h.send(&task_finished(&mytask, "mytask", EventResult::Pass)).await;
    assert_eq!(h.execution(&trigger.context_id).await.cursor, 1);
    assert_eq!(
        of_type(&h.flush().await, &trigger.context_id, "test.triggered").len(),
        1
    );
}

fn single_task_shipyard() -> ShipyardDocument {
    crate::testing::fixtures::single_sequence_shipyard("delivery", vec![Task::new("deploy")])
}

fn fast_lease(identity: &str) -> LeaseConfig {
    LeaseConfig::new("shipyard-controller", identity).with_timings(
        Duration::from_millis(200),
        Duration::from_millis(120),
        Duration::from_millis(20),
    )
}

/// Samples both recorders for `window` and fails on any overlap.
async fn watch_exclusive(a: &RecordingDuties, b: &RecordingDuties, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    while tokio::time::Instant::now() < deadline {
        assert!(a.active() + b.active() <= 1, "two leaders at once");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_two_replicas_single_leader_and_failover_on_cancel() {
    let backend = Arc::new(InMemoryLeaseBackend::new(Duration::from_millis(200)));
    let duties = [Arc::new(RecordingDuties::new()), Arc::new(RecordingDuties::new())];
    let shutdowns = [
        Arc::new(CancellationToken::new()),
        Arc::new(CancellationToken::new()),
    ];
    let mut handles = Vec::new();
    for (i, identity) in ["replica-a", "replica-b"].into_iter().enumerate() {
        let election = LeaderElection::new(fast_lease(identity), backend.clone(), duties[i].clone());
        let shutdown = Arc::clone(&shutdowns[i]);
        handles.push(tokio::spawn(async move { election.run(shutdown).await }));
    }

    assert!(
        eventually(Duration::from_secs(2), || async {
            duties[0].active() + duties[1].active() == 1
        })
        .await
    );
    watch_exclusive(&duties[0], &duties[1], Duration::from_millis(300)).await;

    let leader = usize::from(duties[0].active() == 0);
    let follower = 1 - leader;
    shutdowns[leader].cancel("leader shutting down");

    assert!(
        eventually(Duration::from_secs(2), || async { duties[follower].active() == 1 }).await
    );
    assert_eq!(duties[leader].active(), 0);
    assert_eq!(duties[0].max_active() + duties[1].max_active(), 2);

    shutdowns[follower].cancel("test over");
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_killed_leader_is_replaced_after_lease_expiry() {
    let backend = Arc::new(InMemoryLeaseBackend::new(Duration::from_millis(200)));
    let first = Arc::new(RecordingDuties::new());
    let second = Arc::new(RecordingDuties::new());
    let shutdown = Arc::new(CancellationToken::new());

    let leader = {
        let election = LeaderElection::new(fast_lease("replica-a"), backend.clone(), first.clone());
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { election.run(shutdown).await })
    };
    assert!(eventually(Duration::from_secs(1), || async { first.active() == 1 }).await);

    let standby = {
        let election =
            LeaderElection::new(fast_lease("replica-b"), backend.clone(), second.clone());
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { election.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(second.active(), 0);

    // Aborting drops the leader's duties without releasing the lease.
    let killed_at = tokio::time::Instant::now();
    leader.abort();
    assert!(leader.await.unwrap_err().is_cancelled());
    assert!(eventually(Duration::from_secs(2), || async { second.active() == 1 }).await);
    assert!(killed_at.elapsed() < Duration::from_millis(200 + 500));

    shutdown.cancel("test over");
    standby.await.unwrap();
}

fn controller_config(identity: &str) -> ControllerConfig {
    ControllerConfig::new()
        .with_identity(identity)
        .with_dispatch_intervals(Duration::from_millis(10), Duration::from_millis(10))
        .with_lease_timings(
            Duration::from_millis(200),
            Duration::from_millis(120),
            Duration::from_millis(20),
        )
}

#[tokio::test]
async fn test_dispatch_resumes_on_surviving_replica() {
    let store = Arc::new(InMemorySequenceStore::new());
    let bus = Arc::new(InMemoryMessageBus::new());
    let leases = Arc::new(InMemoryLeaseBackend::new(Duration::from_millis(200)));
    let provider = Arc::new(StaticShipyardProvider::with_project("sockshop", rollback_shipyard()));

    let spawn = |identity: &str| {
        let controller = ShipyardController::new(
            controller_config(identity),
            store.clone(),
            bus.clone(),
            provider.clone(),
            leases.clone(),
        );
        let shutdown = Arc::new(CancellationToken::new());
        let task = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { controller.run(shutdown).await })
        };
        (task, shutdown)
    };
    let (first, _first_shutdown) = spawn("replica-a");
    assert!(
        eventually(Duration::from_secs(1), || async {
            leases
                .current_leader("keptn/shipyard-controller")
                .await
                .unwrap()
                .as_deref()
                == Some("replica-a")
        })
        .await
    );
    let (second, second_shutdown) = spawn("replica-b");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let trigger = sequence_triggered("sockshop", "dev", "delivery", "carts");
    publish(&bus, &trigger).await;
    let mytask = wait_for(&bus, &trigger.context_id, "mytask.triggered").await;

    first.abort();
    let _ = first.await;

    publish(&bus, &task_finished(&mytask, "mytask", EventResult::Pass)).await;
    let test = wait_for(&bus, &trigger.context_id, "test.triggered").await;
    assert_eq!(test.triggered_id, None);
    assert_eq!(
        store.get_by_context(&trigger.context_id).await.unwrap().cursor,
        1
    );

    second_shutdown.cancel("test over");
    second.await.unwrap().unwrap();
}

async fn publish(bus: &InMemoryMessageBus, event: &EventEnvelope) {
    bus.publish(&event.event_type, event.to_vec().unwrap())
        .await
        .unwrap();
}

async fn wait_for(bus: &InMemoryMessageBus, context_id: &str, suffix: &str) -> EventEnvelope {
    let find = || {
        bus.published()
            .iter()
            .map(|m: &BusMessage| EventEnvelope::from_slice(&m.payload).unwrap())
            .find(|e| e.context_id == context_id && e.event_type.ends_with(suffix))
    };
    assert!(
        eventually(Duration::from_secs(3), || async { find().is_some() }).await,
        "no {suffix} published for {context_id}"
    );
    find().unwrap()
}
