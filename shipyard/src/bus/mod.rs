//! Message bus abstraction.
//!
//! Subjects are dot-separated tokens. Subscription patterns follow the NATS
//! conventions: `*` matches exactly one token and a trailing `>` matches one or
//! more remaining tokens.

pub mod memory;

use async_trait::async_trait;

use crate::errors::BusError;

pub use memory::{InMemoryMessageBus, Subscription};

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
        }
    }
}

/// Publishing side of the bus.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes `payload` on `subject`.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// A bus that can also hand out subscriptions.
#[async_trait]
pub trait MessageBus: EventPublisher {
    /// Subscribes to every subject matching `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;
}

/// Returns true if `subject` matches the subscription `pattern`.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(s)) if !s.is_empty() => {}
            (Some(p), Some(s)) if p == s && !s.is_empty() => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matches_literal() {
        assert!(subject_matches("a.b.c", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b"));
        assert!(!subject_matches("a.b", "a.b.c"));
    }

    #[test]
    fn test_subject_matches_wildcards() {
        assert!(subject_matches("sh.keptn.event.>", "sh.keptn.event.dev.delivery.triggered"));
        assert!(subject_matches("sh.keptn.event.>", "sh.keptn.event.mytask.started"));
        assert!(!subject_matches("sh.keptn.event.>", "sh.keptn.event"));
        assert!(subject_matches("sh.keptn.event.*.started", "sh.keptn.event.mytask.started"));
        assert!(!subject_matches(
            "sh.keptn.event.*.started",
            "sh.keptn.event.dev.delivery.started"
        ));
        assert!(!subject_matches("sh.>.event", "sh.keptn.event"));
    }

    #[tokio::test]
    async fn test_mock_publisher() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|subject, _| subject == "x.y")
            .times(1)
            .returning(|_, _| Ok(()));
        publisher.publish("x.y", b"{}".to_vec()).await.unwrap();
    }
}
