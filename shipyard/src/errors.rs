//! Error types for the shipyard orchestration engine.
//!
//! Each external boundary (state store, message bus, lease, configuration
//! provider) has its own error enum. They fold into [`ShipyardError`] so that
//! callers which only need to log can use a single type.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ShipyardError> = std::result::Result<T, E>;

/// The main error type for shipyard operations.
#[derive(Debug, Error)]
pub enum ShipyardError {
    /// The sequence state store rejected or failed an operation.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The message bus failed to publish or subscribe.
    #[error("{0}")]
    Bus(#[from] BusError),

    /// The lease backend failed.
    #[error("{0}")]
    Lease(#[from] LeaseError),

    /// The shipyard could not be retrieved from the configuration provider.
    #[error("{0}")]
    Provider(#[from] ProviderError),

    /// A shipyard document could not be parsed or validated.
    #[error("{0}")]
    Shipyard(#[from] ShipyardParseError),

    /// Invalid controller configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// An inbound event could not be interpreted.
    #[error("{0}")]
    Event(#[from] EventError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ShipyardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Why a compare-and-update was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The record no longer has the expected state or revision.
    StateChanged,
    /// Another execution already holds `started` for the concurrency key.
    SlotOccupied,
    /// A record with this context ID already exists.
    AlreadyExists,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StateChanged => write!(f, "state changed"),
            Self::SlotOccupied => write!(f, "concurrency slot occupied"),
            Self::AlreadyExists => write!(f, "already exists"),
        }
    }
}

/// Errors raised by a [`SequenceStateStore`](crate::store::SequenceStateStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed.
    #[error("Conflict on context '{context_id}': {kind}")]
    Conflict {
        /// The context whose write was rejected.
        context_id: String,
        /// The reason for the rejection.
        kind: ConflictKind,
    },

    /// No execution exists for the context ID.
    #[error("Sequence execution '{0}' not found")]
    NotFound(String),

    /// The backing store failed.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(context_id: impl Into<String>, kind: ConflictKind) -> Self {
        Self::Conflict {
            context_id: context_id.into(),
            kind,
        }
    }

    /// Returns the conflict kind if this is a conflict.
    #[must_use]
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            Self::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns true if this is a conflict of any kind.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors raised by the message bus.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// Publishing to a subject failed.
    #[error("Failed to publish to '{subject}': {message}")]
    Publish {
        /// The subject that was published to.
        subject: String,
        /// Backend error message.
        message: String,
    },

    /// Creating a subscription failed.
    #[error("Failed to subscribe: {0}")]
    Subscribe(String),

    /// The bus connection is closed.
    #[error("Message bus closed")]
    Closed,
}

/// Errors raised by a lease backend.
#[derive(Debug, Clone, Error)]
pub enum LeaseError {
    /// The backend could not be reached or rejected the call.
    #[error("Lease backend error: {0}")]
    Backend(String),
}

/// Errors raised by a shipyard configuration provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The project has no shipyard.
    #[error("No shipyard found for project '{0}'")]
    ProjectNotFound(String),

    /// The provider could not be reached.
    #[error("Failed to fetch shipyard: {0}")]
    Fetch(String),

    /// The resource payload could not be decoded.
    #[error("Failed to decode shipyard resource: {0}")]
    Decode(String),

    /// The shipyard document is invalid.
    #[error("{0}")]
    Parse(#[from] ShipyardParseError),
}

/// Error raised when a shipyard document cannot be parsed or is invalid.
#[derive(Debug, Clone, Error)]
#[error("Invalid shipyard: {message}")]
pub struct ShipyardParseError {
    /// The error message.
    pub message: String,
}

impl ShipyardParseError {
    /// Creates a new parse error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A duration value could not be parsed.
    #[error("Invalid duration for {key}: '{value}'")]
    InvalidDuration {
        /// The configuration key.
        key: String,
        /// The raw value.
        value: String,
    },

    /// A value is out of range or inconsistent with another value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// The configuration key.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Errors raised while interpreting an inbound event.
#[derive(Debug, Clone, Error)]
pub enum EventError {
    /// The payload is not a valid event envelope.
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// The event type does not follow the lifecycle grammar.
    #[error("Unrecognised event type '{0}'")]
    UnknownType(String),
}
