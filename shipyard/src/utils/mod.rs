//! Utility functions for identifier generation and timestamps.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// Generates a random (v4) UUID, used for context IDs.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a time-ordered (v7) UUID string, used for event IDs.
#[must_use]
pub fn generate_event_id() -> String {
    Uuid::now_v7().to_string()
}

/// Returns the current UTC time.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Returns the current time as an RFC 3339 string with millisecond precision.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
