//! Message persistence.
//!
//! The relay only needs an upsert and a recent-first query. Ordering is by
//! creation time with ties broken by first insertion, which keeps it total and
//! stable even when timestamps collide across processes.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flowrelay_protocol::{Message, MessageKind};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::trace;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store is unavailable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store refused to write a message.
    #[error("Write rejected for {id}: {reason}")]
    Rejected {
        /// Id of the rejected message.
        id: String,
        /// Store-provided reason.
        reason: String,
    },
}

/// Persistent message storage.
///
/// Implementations must be safe to call concurrently from every pipeline.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message, replacing any stored message with the same id.
    async fn save(&self, message: &Message) -> Result<(), StoreError>;

    /// The most recent messages, newest first, at most `limit` of them.
    async fn recent(&self, limit: usize) -> Result<Vec<Message>, StoreError>;

    /// The most recent messages of one kind, newest first.
    async fn recent_by_kind(
        &self,
        kind: MessageKind,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
}

struct StoredMessage {
    sequence: u64,
    message: Message,
}

/// An in-memory [`MessageStore`].
#[derive(Default)]
pub struct MemoryStore {
    messages: DashMap<String, StoredMessage>,
    next_sequence: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Message> {
        self.messages.get(id).map(|stored| stored.message.clone())
    }

    fn newest(&self, limit: usize, filter: impl Fn(&Message) -> bool) -> Vec<Message> {
        let mut matching: Vec<(u64, Message)> = self
            .messages
            .iter()
            .filter(|entry| filter(&entry.message))
            .map(|entry| (entry.sequence, entry.message.clone()))
            .collect();

        matching.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| seq_b.cmp(seq_a))
        });
        matching.truncate(limit);

        matching.into_iter().map(|(_, message)| message).collect()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: &Message) -> Result<(), StoreError> {
        match self.messages.entry(message.id().to_string()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().message = message.clone();
                trace!(id = %message.id(), "Overwrote message");
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredMessage {
                    sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
                    message: message.clone(),
                });
                trace!(id = %message.id(), "Stored message");
            }
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        Ok(self.newest(limit, |_| true))
    }

    async fn recent_by_kind(
        &self,
        kind: MessageKind,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self.newest(limit, |message| message.kind() == kind))
    }
}
