//! Cooperative cancellation for the controller's background loops.

mod token;

pub use token::{CancelCallback, CancellationToken};
