//! The canonical message record.
//!
//! A message is built once at the publish boundary and rebuilt by value every
//! time a subscriber decodes it off the bus. Identity, kind and creation time
//! never change after construction; only the task pipeline derives a new
//! value with updated content.

use crate::subjects;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use uuid::Uuid;

/// Maximum content length, in UTF-16 code units.
pub const MAX_CONTENT_LENGTH: usize = 1000;

/// Maximum sender length, in UTF-16 code units.
pub const MAX_SENDER_LENGTH: usize = 255;

/// Sender used for system-originated messages.
pub const SYSTEM_SENDER: &str = "SYSTEM";

/// Suffix appended to task content once processing completes.
pub const TASK_COMPLETION_MARKER: &str = " [PROCESSED]";

/// Last timestamp handed out, in nanoseconds since the epoch.
static LAST_TIMESTAMP_NANOS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Produce a creation timestamp.
///
/// Timestamps are strictly increasing within a process, even when the wall
/// clock stalls or steps backwards. They carry no ordering guarantee across
/// processes.
#[must_use]
pub fn next_timestamp() -> DateTime<Utc> {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
    let previous = LAST_TIMESTAMP_NANOS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last.saturating_add(1)))
        })
        .unwrap_or_else(|last| last);
    Utc.timestamp_nanos(now.max(previous.saturating_add(1)))
}

/// Validation errors for producer input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Content exceeds [`MAX_CONTENT_LENGTH`].
    #[error("Content length {length} exceeds maximum {MAX_CONTENT_LENGTH}")]
    ContentTooLong {
        /// Length in UTF-16 code units.
        length: usize,
    },

    /// Sender exceeds [`MAX_SENDER_LENGTH`].
    #[error("Sender length {length} exceeds maximum {MAX_SENDER_LENGTH}")]
    SenderTooLong {
        /// Length in UTF-16 code units.
        length: usize,
    },
}

/// Validate message content.
///
/// # Errors
///
/// Returns an error if the content is longer than [`MAX_CONTENT_LENGTH`].
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    let length = content.encode_utf16().count();
    if length > MAX_CONTENT_LENGTH {
        return Err(ValidationError::ContentTooLong { length });
    }
    Ok(())
}

/// Validate a message sender.
///
/// # Errors
///
/// Returns an error if the sender is longer than [`MAX_SENDER_LENGTH`].
pub fn validate_sender(sender: &str) -> Result<(), ValidationError> {
    let length = sender.encode_utf16().count();
    if length > MAX_SENDER_LENGTH {
        return Err(ValidationError::SenderTooLong { length });
    }
    Ok(())
}

/// The closed set of message kinds. Each kind owns one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Chat,
    Notification,
    Task,
}

impl MessageKind {
    /// All kinds, in pipeline order.
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Chat,
        MessageKind::Notification,
        MessageKind::Task,
    ];

    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::Chat => "CHAT",
            MessageKind::Notification => "NOTIFICATION",
            MessageKind::Task => "TASK",
        }
    }

    /// Bus subject this kind is published on.
    #[must_use]
    pub const fn subject(self) -> &'static str {
        match self {
            MessageKind::Chat => subjects::CHAT_SUBJECT,
            MessageKind::Notification => subjects::NOTIFICATION_SUBJECT,
            MessageKind::Task => subjects::TASK_SUBJECT,
        }
    }

    /// Broadcast topic this kind is delivered to.
    #[must_use]
    pub const fn topic(self) -> &'static str {
        match self {
            MessageKind::Chat => subjects::CHAT_TOPIC,
            MessageKind::Notification => subjects::NOTIFICATION_TOPIC,
            MessageKind::Task => subjects::TASK_TOPIC,
        }
    }

    /// Look up the kind owning a bus subject.
    #[must_use]
    pub fn from_subject(subject: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.subject() == subject)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown message kind: {s}"))
    }
}

/// A relayed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    #[serde(rename = "username")]
    sender: String,
    content: String,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(rename = "timestamp", with = "timestamp")]
    created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message with a fresh id and creation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender or content fails validation.
    pub fn new(
        sender: impl Into<String>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Result<Self, ValidationError> {
        let sender = sender.into();
        let content = content.into();
        validate_sender(&sender)?;
        validate_content(&content)?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            sender,
            content,
            kind,
            created_at: next_timestamp(),
        })
    }

    /// Create a chat message.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender or content fails validation.
    pub fn chat(
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Self::new(sender, content, MessageKind::Chat)
    }

    /// Create a system notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the content fails validation.
    pub fn notification(content: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(SYSTEM_SENDER, content, MessageKind::Notification)
    }

    /// Create a task awaiting processing.
    ///
    /// # Errors
    ///
    /// Returns an error if the content fails validation.
    pub fn task(task_data: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(SYSTEM_SENDER, task_data, MessageKind::Task)
    }

    /// Unique message identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Originating sender.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Message payload text.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Message kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Derive the completed form of a task: same identity, content with the
    /// completion marker appended.
    ///
    /// Call once per published task. Producer content that happens to end
    /// with the marker still gets its own.
    #[must_use]
    pub fn completed(&self) -> Self {
        let mut completed = self.clone();
        completed.content.push_str(TASK_COMPLETION_MARKER);
        completed
    }
}

/// Timestamps are UTC instants written without an offset. Inputs with an
/// explicit offset are accepted and normalized to UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f";
    const PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.naive_utc().format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(naive) = NaiveDateTime::parse_from_str(&raw, PARSE_FORMAT) {
            return Ok(naive.and_utc());
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::chat("alice", "hi").unwrap();
        assert_eq!(msg.sender(), "alice");
        assert_eq!(msg.content(), "hi");
        assert_eq!(msg.kind(), MessageKind::Chat);
        assert!(!msg.id().is_empty());
    }

    #[test]
    fn test_system_messages_use_sentinel_sender() {
        assert_eq!(Message::notification("maintenance").unwrap().sender(), SYSTEM_SENDER);
        assert_eq!(Message::task("build-x").unwrap().sender(), SYSTEM_SENDER);
    }

    #[test]
    fn test_unique_ids_and_increasing_timestamps() {
        let first = Message::chat("a", "1").unwrap();
        let second = Message::chat("a", "2").unwrap();
        assert_ne!(first.id(), second.id());
        assert!(second.created_at() > first.created_at());
    }

    #[test]
    fn test_content_limit_counts_utf16_units() {
        assert!(Message::chat("a", "x".repeat(MAX_CONTENT_LENGTH)).is_ok());
        assert_eq!(
            Message::chat("a", "x".repeat(MAX_CONTENT_LENGTH + 1)).unwrap_err(),
            ValidationError::ContentTooLong {
                length: MAX_CONTENT_LENGTH + 1
            }
        );

        // Each emoji is two UTF-16 code units.
        let emoji = "\u{1F600}".repeat(MAX_CONTENT_LENGTH / 2 + 1);
        assert!(Message::chat("a", emoji).is_err());
    }

    #[test]
    fn test_completed_appends_marker_once() {
        let task = Message::task("build-x").unwrap();
        let done = task.completed();
        assert_eq!(done.content(), "build-x [PROCESSED]");
        assert_eq!(done.id(), task.id());
        assert_eq!(done.created_at(), task.created_at());
        assert_eq!(done.sender(), task.sender());
        assert_eq!(done.kind(), task.kind());
    }

    #[test]
    fn test_completed_keeps_producer_marker_text() {
        let task = Message::task("deploy [PROCESSED]").unwrap();
        assert_eq!(
            task.completed().content(),
            "deploy [PROCESSED] [PROCESSED]"
        );
    }

    #[test]
    fn test_sender_limit() {
        assert!(Message::chat("a".repeat(MAX_SENDER_LENGTH), "hi").is_ok());
        assert_eq!(
            Message::chat("a".repeat(70_000), "hi").unwrap_err(),
            ValidationError::SenderTooLong { length: 70_000 }
        );
    }

    #[test]
    fn test_kind_routing() {
        assert_eq!(MessageKind::Chat.subject(), "chat.messages");
        assert_eq!(MessageKind::Notification.topic(), "/topic/notifications");
        assert_eq!(
            MessageKind::from_subject("tasks.process"),
            Some(MessageKind::Task)
        );
        assert_eq!(MessageKind::from_subject("tasks"), None);
        assert_eq!("task".parse::<MessageKind>(), Ok(MessageKind::Task));
        assert!("EMAIL".parse::<MessageKind>().is_err());
    }
}
