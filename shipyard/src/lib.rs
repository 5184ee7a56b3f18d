//! # Shipyard
//!
//! A sequence orchestration engine driven by declarative shipyard documents.
//!
//! A shipyard declares stages, each holding named sequences of tasks. The
//! controller reacts to lifecycle events on a message bus:
//!
//! - **Sequence triggers** create executions, serialised per
//!   (project, stage, service) with FIFO admission
//! - **Task responses** advance an execution through its tasks or finish it
//! - **Trigger rules** chain a finished sequence into follow-on sequences
//! - **Leader-only dispatchers** publish queued events and reconcile missed
//!   promotions
//!
//! All state lives behind [`store::SequenceStateStore`], whose
//! compare-and-update is the only concurrency control between replicas.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shipyard::prelude::*;
//!
//! let controller = ShipyardController::new(
//!     ControllerConfig::from_env(),
//!     Arc::new(InMemorySequenceStore::new()),
//!     Arc::new(InMemoryMessageBus::new()),
//!     Arc::new(StaticShipyardProvider::with_project("sockshop", shipyard)),
//!     Arc::new(InMemoryLeaseBackend::default()),
//! );
//! controller.run(Arc::new(CancellationToken::new())).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bus;
pub mod cancellation;
pub mod config;
pub mod controller;
pub mod engine;
pub mod errors;
pub mod event;
pub mod execution;
pub mod leader;
pub mod model;
pub mod observability;
pub mod provider;
pub mod retry;
pub mod selector;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bus::{BusMessage, EventPublisher, InMemoryMessageBus, MessageBus};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::ControllerConfig;
    pub use crate::controller::ShipyardController;
    pub use crate::engine::{
        EventCorrelationHandler, EventDispatcher, EventOrigin, SequenceDispatcher,
        SequenceLifecycle,
    };
    pub use crate::errors::{
        BusError, ConfigError, ConflictKind, EventError, LeaseError, ProviderError,
        ShipyardError, ShipyardParseError, StoreError,
    };
    pub use crate::event::{
        EventData, EventEnvelope, EventKind, EventResult, EventStatus, Phase,
        DEFAULT_NAMESPACE,
    };
    pub use crate::execution::{
        ConcurrencyKey, SequenceExecution, SequenceResult, SequenceState, TaskExecution,
    };
    pub use crate::leader::{InMemoryLeaseBackend, LeaderElection, LeaseBackend, LeaseConfig};
    pub use crate::model::{Sequence, ShipyardDocument, Stage, Task, TriggerRule};
    pub use crate::provider::{ShipyardProvider, StaticShipyardProvider};
    pub use crate::store::{InMemorySequenceStore, SequenceStateStore};
    pub use crate::utils::{generate_uuid, iso_timestamp};
}
