//! Live delivery to connected subscribers.
//!
//! Broadcasting is best-effort: nothing is acknowledged or retained, and a
//! subscriber that connects after a broadcast never sees it.

use dashmap::DashMap;
use flowrelay_protocol::subjects::ALL_TOPICS;
use flowrelay_protocol::Message;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default per-topic buffer capacity.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Broadcast errors.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Topic is not one of the relay's fixed topics.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

/// Pushes messages to live subscribers of a topic.
///
/// Must not block the caller and must be safe to call from every pipeline.
pub trait Broadcaster: Send + Sync {
    /// Deliver a message. Returns the number of subscribers reached.
    fn broadcast(&self, topic: &str, message: &Message) -> Result<usize, BroadcastError>;
}

/// A [`Broadcaster`] holding one broadcast channel per fixed topic.
#[derive(Debug)]
pub struct TopicHub {
    topics: DashMap<String, broadcast::Sender<Arc<Message>>>,
    capacity: usize,
}

impl TopicHub {
    /// Create a hub with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a hub with a specific per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let topics = DashMap::new();
        for topic in ALL_TOPICS {
            topics.insert(topic.to_string(), broadcast::channel(capacity).0);
        }
        Self { topics, capacity }
    }

    /// Subscribe to a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is unknown.
    pub fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Arc<Message>>, BroadcastError> {
        let sender = self
            .topics
            .get(topic)
            .ok_or_else(|| BroadcastError::UnknownTopic(topic.to_string()))?;
        debug!(topic = %topic, subscribers = sender.receiver_count() + 1, "Live subscriber joined");
        Ok(sender.subscribe())
    }

    /// Number of live subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Get the topic capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TopicHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster for TopicHub {
    fn broadcast(&self, topic: &str, message: &Message) -> Result<usize, BroadcastError> {
        let sender = self
            .topics
            .get(topic)
            .ok_or_else(|| BroadcastError::UnknownTopic(topic.to_string()))?;
        let recipients = sender.send(Arc::new(message.clone())).unwrap_or_default();
        trace!(topic = %topic, id = %message.id(), recipients, "Broadcast message");
        Ok(recipients)
    }
}
