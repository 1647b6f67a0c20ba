//! Message bus abstraction.
//!
//! The relay talks to its publish/subscribe transport through these traits so
//! the transport can be swapped without touching the pipelines. Publishing is
//! fire-and-forget: success means the transport accepted the payload, not
//! that any subscriber processed it.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

/// Maximum subject name length.
pub const MAX_SUBJECT_LENGTH: usize = 256;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport could not be reached.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The connection was never opened or has been closed.
    #[error("Not connected")]
    NotConnected,

    /// The transport rejected a publish.
    #[error("Publish to {subject} failed: {reason}")]
    Publish {
        /// Target subject.
        subject: String,
        /// Transport-provided reason.
        reason: String,
    },

    /// Invalid subject name.
    #[error("Invalid subject: {0}")]
    InvalidSubject(&'static str),
}

/// Validate a subject name.
///
/// # Errors
///
/// Returns an error message if the subject name is invalid.
pub fn validate_subject(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Subject cannot be empty");
    }
    if name.len() > MAX_SUBJECT_LENGTH {
        return Err("Subject too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && c != ' ') {
        return Err("Subject contains invalid characters");
    }
    Ok(())
}

/// Receives payloads delivered on a subscribed subject.
///
/// Invoked once per message, in publish order for a given subscription.
/// Implementations own their error reporting; nothing is returned to the bus.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one raw payload.
    async fn handle(&self, subject: &str, payload: Bytes);
}

/// Opens connections to a bus transport.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the transport at `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BusConnection>, BusError>;
}

/// An open connection to a bus transport.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Publish a payload to a subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe a handler to a subject.
    ///
    /// Only messages published after the subscription starts are delivered.
    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError>;

    /// Close the connection and cancel every subscription opened on it.
    ///
    /// Calling this more than once has no further effect.
    async fn close(&self);

    /// Check if the connection is still open.
    fn is_connected(&self) -> bool;
}

/// A live subscription. Dropping it cancels delivery.
pub struct Subscription {
    id: u64,
    subject: String,
    worker: JoinHandle<()>,
}

impl Subscription {
    /// Wrap the worker task delivering a subject's messages.
    #[must_use]
    pub fn new(id: u64, subject: impl Into<String>, worker: JoinHandle<()>) -> Self {
        Self {
            id,
            subject: subject.into(),
            worker,
        }
    }

    /// Subscription identifier, unique per bus.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The subscribed subject.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Whether the delivery worker is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.worker.is_finished()
    }

    /// Cancel the subscription.
    ///
    /// A handler invocation in progress is abandoned at its next suspension
    /// point; no further invocations start.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.worker.abort();
        debug!(subject = %self.subject, subscription = self.id, "Subscription cancelled");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_validation() {
        assert!(validate_subject("chat.messages").is_ok());
        assert!(validate_subject("tasks.process").is_ok());
        assert!(validate_subject("").is_err());
        assert!(validate_subject("has space").is_err());

        let long_name = "a".repeat(MAX_SUBJECT_LENGTH + 1);
        assert!(validate_subject(&long_name).is_err());
    }

    #[tokio::test]
    async fn test_subscription_drop_aborts_worker() {
        let worker = tokio::spawn(std::future::pending::<()>());
        let abort = worker.abort_handle();
        let subscription = Subscription::new(1, "chat.messages", worker);
        assert!(subscription.is_active());
        assert_eq!(subscription.subject(), "chat.messages");

        subscription.unsubscribe();
        for _ in 0..10 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(abort.is_finished());
    }
}
