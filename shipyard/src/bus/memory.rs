//! In-process message bus backed by a tokio broadcast channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{subject_matches, BusMessage, EventPublisher, MessageBus};
use crate::errors::BusError;

const DEFAULT_CAPACITY: usize = 1024;
const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// In-process [`MessageBus`].
///
/// Every subscriber sees every message published after it subscribed. The bus
/// also keeps the most recent published messages for inspection, bounded by
/// the history limit.
#[derive(Debug)]
pub struct InMemoryMessageBus {
    sender: broadcast::Sender<BusMessage>,
    history: Mutex<VecDeque<BusMessage>>,
    history_limit: usize,
    failures_remaining: AtomicUsize,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageBus {
    /// Creates a bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus with the given channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            failures_remaining: AtomicUsize::new(0),
        }
    }

    /// Keeps at most `limit` published messages; zero disables the history.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Makes the next `count` publishes fail, simulating an outage.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Returns the retained published messages, oldest first.
    #[must_use]
    pub fn published(&self) -> Vec<BusMessage> {
        self.history.lock().iter().cloned().collect()
    }

    /// Returns the subjects published so far, in order.
    #[must_use]
    pub fn published_subjects(&self) -> Vec<String> {
        self.history.lock().iter().map(|m| m.subject.clone()).collect()
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventPublisher for InMemoryMessageBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.take_failure() {
            return Err(BusError::Publish {
                subject: subject.to_string(),
                message: "simulated outage".to_string(),
            });
        }
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
        };
        if self.history_limit > 0 {
            let mut history = self.history.lock();
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(message.clone());
        }
        // No receivers is not an error; the message is simply not delivered.
        let _ = self.sender.send(message);
        Ok(())
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        if pattern.is_empty() {
            return Err(BusError::Subscribe("empty subject pattern".to_string()));
        }
        Ok(Subscription {
            pattern: pattern.to_string(),
            receiver: self.sender.subscribe(),
        })
    }
}

/// A stream of messages matching a subject pattern.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    receiver: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    /// Returns the subscription pattern.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Waits for the next matching message; `None` once the bus is dropped.
    pub async fn next(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if subject_matches(&self.pattern, &message.subject) => {
                    return Some(message)
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        skipped,
                        "Subscriber lagged, messages dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
