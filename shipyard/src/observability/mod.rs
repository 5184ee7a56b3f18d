//! Observability utilities.

mod logging;

pub use logging::{event_span, init_logging, leader_span, LogFormat};
