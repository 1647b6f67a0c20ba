//! Per-channel message pipelines.
//!
//! Each pipeline decodes a payload, processes it according to its kind, then
//! persists and broadcasts the result. A failure at any step drops that
//! message only; the pipeline keeps consuming.
//!
//! Task messages are completed on a detached task after the processing delay,
//! so a slow task never holds up the subscription worker. Detached tasks are
//! keyed by message id: a redelivery arriving while the original is still in
//! flight is ignored. Once a pipeline is closed it accepts nothing new, and
//! tasks still waiting are abandoned.

use crate::broadcast::{BroadcastError, Broadcaster};
use crate::bus::MessageHandler;
use crate::stats::RelayStats;
use crate::store::{MessageStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flowrelay_protocol::{codec, CodecError, Message, MessageKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Errors that drop a single message.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Payload could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(#[from] CodecError),

    /// Payload arrived on the subject of a different kind.
    #[error("Expected {expected} message, got {actual}")]
    KindMismatch {
        /// Kind owned by the pipeline.
        expected: MessageKind,
        /// Kind carried by the payload.
        actual: MessageKind,
    },

    /// Persistence failed.
    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    /// Live delivery failed.
    #[error("Broadcast failed: {0}")]
    Broadcast(#[from] BroadcastError),
}

/// The pipeline serving one message kind.
#[derive(Clone)]
pub(crate) struct Pipeline {
    kind: MessageKind,
    store: Arc<dyn MessageStore>,
    broadcaster: Arc<dyn Broadcaster>,
    stats: Arc<RelayStats>,
    task_delay: Duration,
    in_flight: Arc<DashMap<String, AbortHandle>>,
    closed: Arc<AtomicBool>,
}

impl Pipeline {
    pub(crate) fn new(
        kind: MessageKind,
        store: Arc<dyn MessageStore>,
        broadcaster: Arc<dyn Broadcaster>,
        stats: Arc<RelayStats>,
        task_delay: Duration,
    ) -> Self {
        Self {
            kind,
            store,
            broadcaster,
            stats,
            task_delay,
            in_flight: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn kind(&self) -> MessageKind {
        self.kind
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Refuse further work and abandon every task still waiting out the
    /// processing delay.
    pub(crate) fn close(&self) {
        // Set before draining; `schedule` checks it under the entry lock.
        self.closed.store(true, Ordering::SeqCst);

        let abandoned = self.in_flight.len();
        for entry in self.in_flight.iter() {
            entry.value().abort();
        }
        self.in_flight.clear();
        if abandoned > 0 {
            debug!(kind = %self.kind, abandoned, "Abandoned in-flight tasks");
        }
    }

    async fn process(&self, payload: &[u8]) -> Result<(), PipelineError> {
        let message = codec::decode(payload)?;

        if message.kind() != self.kind {
            return Err(PipelineError::KindMismatch {
                expected: self.kind,
                actual: message.kind(),
            });
        }

        match self.kind {
            MessageKind::Task => {
                self.schedule(message);
                Ok(())
            }
            MessageKind::Chat | MessageKind::Notification => self.deliver(&message).await,
        }
    }

    /// Persist, then broadcast on the pipeline's topic.
    async fn deliver(&self, message: &Message) -> Result<(), PipelineError> {
        self.store.save(message).await?;
        self.stats.record_persisted();

        let recipients = self.broadcaster.broadcast(self.kind.topic(), message)?;
        self.stats.record_broadcast();

        debug!(
            kind = %self.kind,
            id = %message.id(),
            recipients,
            "Message relayed"
        );
        Ok(())
    }

    fn schedule(&self, message: Message) {
        let id = message.id().to_string();

        match self.in_flight.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.stats.record_duplicate();
                debug!(id = %id, "Task already in flight; redelivery ignored");
            }
            Entry::Vacant(_) if self.closed.load(Ordering::SeqCst) => {
                debug!(id = %id, "Pipeline closed; task not scheduled");
            }
            Entry::Vacant(slot) => {
                let pipeline = self.clone();
                let worker = tokio::spawn(async move {
                    tokio::time::sleep(pipeline.task_delay).await;

                    let completed = message.completed();
                    if let Err(e) = pipeline.deliver(&completed).await {
                        pipeline.stats.record_dropped();
                        warn!(kind = %pipeline.kind, id = %id, error = %e, "Task dropped");
                    }
                    pipeline.in_flight.remove(&id);
                });
                slot.insert(worker.abort_handle());
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Pipeline {
    async fn handle(&self, subject: &str, payload: Bytes) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.stats.record_received();

        if let Err(e) = self.process(&payload).await {
            self.stats.record_dropped();
            warn!(subject = %subject, kind = %self.kind, error = %e, "Message dropped");
        }
    }
}
