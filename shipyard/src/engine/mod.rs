//! The sequence orchestration engine.
//!
//! - [`transitions`]: pure state changes of one execution and the events they emit
//! - [`lifecycle`]: store-backed admission, task progress, FIFO release and follow-ons
//! - [`handler`]: applies inbound bus events (every replica)
//! - [`sequence_dispatcher`] and [`event_dispatcher`]: leader-only periodic loops
//!
//! Both the event path and the periodic path mutate executions only through
//! the store's compare-and-update, so they can race freely.

pub mod event_dispatcher;
pub mod handler;
pub mod lifecycle;
pub mod periodic;
pub mod sequence_dispatcher;
pub mod transitions;

#[cfg(test)]
mod integration_tests;

pub use event_dispatcher::{DispatchStats, EventDispatcher};
pub use handler::EventCorrelationHandler;
pub use lifecycle::{Followup, LifecycleSettings, SequenceLifecycle};
pub use periodic::{run_periodic, PeriodicTask};
pub use sequence_dispatcher::SequenceDispatcher;
pub use transitions::{EventOrigin, TaskOutcome};
