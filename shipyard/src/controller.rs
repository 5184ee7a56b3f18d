//! One controller replica.
//!
//! Every replica consumes the inbound event stream and applies it through the
//! event correlation handler. The two dispatch loops run only on the replica
//! holding the lease; they are the leader's duties and stop when leadership
//! ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use crate::bus::{EventPublisher, MessageBus};
use crate::cancellation::CancellationToken;
use crate::config::ControllerConfig;
use crate::engine::{
    run_periodic, EventCorrelationHandler, EventDispatcher, EventOrigin, LifecycleSettings,
    SequenceDispatcher, SequenceLifecycle,
};
use crate::errors::ShipyardError;
use crate::leader::{LeaderDuties, LeaderElection, LeaseBackend};
use crate::observability::{event_span, leader_span};
use crate::provider::ShipyardProvider;
use crate::store::SequenceStateStore;

/// Source attribute of events emitted by the controller.
pub const CONTROLLER_SOURCE: &str = "shipyard-controller";

/// The leader-only dispatch loops.
#[derive(Debug)]
pub struct Dispatchers {
    sequence: SequenceDispatcher,
    event: EventDispatcher,
    sequence_interval: Duration,
    event_interval: Duration,
    lease: String,
    identity: String,
}

impl Dispatchers {
    /// Creates the loops with their tick intervals.
    #[must_use]
    pub fn new(
        sequence: SequenceDispatcher,
        event: EventDispatcher,
        sequence_interval: Duration,
        event_interval: Duration,
    ) -> Self {
        Self {
            sequence,
            event,
            sequence_interval,
            event_interval,
            lease: String::new(),
            identity: String::new(),
        }
    }

    fn for_lease(mut self, lease: &str, identity: &str) -> Self {
        self.lease = lease.to_string();
        self.identity = identity.to_string();
        self
    }
}

#[async_trait]
impl LeaderDuties for Dispatchers {
    async fn run(&self, scope: Arc<CancellationToken>) {
        let loops = async {
            tokio::join!(
                run_periodic(&self.sequence, self.sequence_interval, &scope),
                run_periodic(&self.event, self.event_interval, &scope),
            );
        };
        loops
            .instrument(leader_span(&self.lease, &self.identity))
            .await;
    }
}

/// A controller replica.
pub struct ShipyardController {
    config: ControllerConfig,
    bus: Arc<dyn MessageBus>,
    handler: EventCorrelationHandler,
    election: LeaderElection,
}

impl std::fmt::Debug for ShipyardController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShipyardController")
            .field("identity", &self.config.identity)
            .field("election", &self.election)
            .finish_non_exhaustive()
    }
}

impl ShipyardController {
    /// Wires a replica from its collaborators.
    pub fn new<B>(
        config: ControllerConfig,
        store: Arc<dyn SequenceStateStore>,
        bus: Arc<B>,
        provider: Arc<dyn ShipyardProvider>,
        leases: Arc<dyn LeaseBackend>,
    ) -> Self
    where
        B: MessageBus + 'static,
    {
        let settings = LifecycleSettings::new(EventOrigin::new(
            &config.event_namespace,
            CONTROLLER_SOURCE,
        ))
        .with_conflict_attempts(config.state_conflict_retries);
        let lifecycle = Arc::new(SequenceLifecycle::new(Arc::clone(&store), provider, settings));

        let publisher: Arc<dyn EventPublisher> = bus.clone();
        let lease_config = config.lease_config();
        let duties = Dispatchers::new(
            SequenceDispatcher::new(Arc::clone(&lifecycle)),
            EventDispatcher::new(store, publisher, config.event_dispatch_batch_size),
            config.sequence_dispatch_interval(),
            config.event_dispatch_interval(),
        )
        .for_lease(&lease_config.lease_name, &lease_config.identity);

        Self {
            handler: EventCorrelationHandler::new(lifecycle),
            election: LeaderElection::new(lease_config, leases, Arc::new(duties)),
            bus,
            config,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Returns the event handler.
    #[must_use]
    pub const fn handler(&self) -> &EventCorrelationHandler {
        &self.handler
    }

    /// Runs the replica until `shutdown` is cancelled.
    ///
    /// Fails only if the inbound subscription cannot be created.
    pub async fn run(&self, shutdown: Arc<CancellationToken>) -> Result<(), ShipyardError> {
        let pattern = format!("{}.>", self.config.event_namespace);
        let subscription = self.bus.subscribe(&pattern).await?;
        tracing::info!(
            identity = %self.config.identity,
            pattern = %pattern,
            "Shipyard controller started"
        );

        tokio::join!(
            self.consume(subscription, &shutdown),
            self.election.run(Arc::clone(&shutdown)),
        );

        tracing::info!(identity = %self.config.identity, "Shipyard controller stopped");
        Ok(())
    }

    async fn consume(&self, mut subscription: crate::bus::Subscription, shutdown: &CancellationToken) {
        loop {
            let message = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                message = subscription.next() => message,
            };
            let Some(message) = message else {
                tracing::warn!(pattern = %subscription.pattern(), "Event subscription closed");
                break;
            };

            let span = event_span(&message.subject);
            if let Err(e) = self.handler.handle_message(&message).instrument(span).await {
                tracing::warn!(subject = %message.subject, error = %e, "Failed to handle event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryMessageBus;
    use crate::execution::SequenceState;
    use crate::leader::InMemoryLeaseBackend;
    use crate::provider::StaticShipyardProvider;
    use crate::store::InMemorySequenceStore;
    use crate::testing::fixtures::{eventually, rollback_shipyard, sequence_triggered};

    fn fast_config(identity: &str) -> ControllerConfig {
        ControllerConfig::new()
            .with_identity(identity)
            .with_dispatch_intervals(Duration::from_millis(10), Duration::from_millis(10))
            .with_lease_timings(
                Duration::from_millis(300),
                Duration::from_millis(200),
                Duration::from_millis(20),
            )
    }

    #[tokio::test]
    async fn test_single_replica_dispatches_started_sequence() {
        let store = Arc::new(InMemorySequenceStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let controller = Arc::new(ShipyardController::new(
            fast_config("replica-1"),
            store.clone(),
            bus.clone(),
            Arc::new(StaticShipyardProvider::with_project("sockshop", rollback_shipyard())),
            Arc::new(InMemoryLeaseBackend::new(Duration::from_millis(300))),
        ));
        let shutdown = Arc::new(CancellationToken::new());
        let handle = {
            let controller = Arc::clone(&controller);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { controller.run(shutdown).await })
        };

        // Let the subscription attach before publishing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let trigger = sequence_triggered("sockshop", "dev", "delivery", "carts");
        bus.publish(&trigger.event_type, trigger.to_vec().unwrap())
            .await
            .unwrap();

        assert!(
            eventually(Duration::from_secs(3), || async {
                store.outbox_len() == 0
                    && bus
                        .published_subjects()
                        .iter()
                        .any(|s| s == "sh.keptn.event.mytask.triggered")
            })
            .await
        );
        let execution = store.get_by_context(&trigger.context_id).await.unwrap();
        assert_eq!(execution.state, SequenceState::Started);

        shutdown.cancel("test over");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
