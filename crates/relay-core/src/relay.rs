//! The relay core.
//!
//! A [`Relay`] owns the bus connection, the store and broadcaster handles,
//! and one pipeline per message kind. It is built once at startup and shared
//! by reference with whatever layer exposes the producer-facing API.
//!
//! Publishing and consuming are decoupled: a submission succeeds as soon as
//! the bus accepts it, and a later failure in the consuming pipeline is
//! logged and dropped without reaching the producer. Nothing is retried.

use crate::broadcast::Broadcaster;
use crate::bus::{BusConnection, BusError, Connector, Subscription};
use crate::pipeline::Pipeline;
use crate::stats::{RelayStats, StatsSnapshot};
use crate::store::{MessageStore, StoreError};
use dashmap::DashMap;
use flowrelay_protocol::{codec, CodecError, Message, MessageKind, ValidationError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

/// Default simulated processing time for tasks.
pub const DEFAULT_TASK_DELAY: Duration = Duration::from_secs(2);

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Producer input failed validation. Nothing was published.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Message could not be encoded.
    #[error("Encoding failed: {0}")]
    Codec(#[from] CodecError),

    /// The bus could not be reached or a subscription could not be set up.
    #[error("Connection failed: {0}")]
    Connection(#[source] BusError),

    /// The bus rejected a publish, or the relay is not running.
    #[error("Publish failed: {0}")]
    Publish(#[source] BusError),

    /// The store failed a read.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// `start()` was called on a running relay.
    #[error("Relay already running")]
    AlreadyRunning,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bus endpoint.
    pub endpoint: String,
    /// Simulated processing time for task messages.
    pub task_delay: Duration,
}

impl RelayConfig {
    /// Configuration for a bus endpoint with the default task delay.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            task_delay: DEFAULT_TASK_DELAY,
        }
    }

    /// Override the task processing delay.
    #[must_use]
    pub fn with_task_delay(mut self, task_delay: Duration) -> Self {
        self.task_delay = task_delay;
        self
    }
}

/// Lifecycle state of one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// A pipeline with its live subscription.
struct ActivePipeline {
    pipeline: Pipeline,
    subscription: Subscription,
}

/// The relay core.
pub struct Relay {
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    store: Arc<dyn MessageStore>,
    broadcaster: Arc<dyn Broadcaster>,
    stats: Arc<RelayStats>,
    /// Open bus connection while running.
    connection: RwLock<Option<Arc<dyn BusConnection>>>,
    /// Serializes start/stop and owns the subscriptions.
    active: Mutex<Vec<ActivePipeline>>,
    states: DashMap<MessageKind, PipelineState>,
}

impl Relay {
    /// Create a stopped relay.
    #[must_use]
    pub fn new(
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn MessageStore>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        info!(endpoint = %config.endpoint, task_delay = ?config.task_delay, "Creating relay");

        let states = DashMap::new();
        for kind in MessageKind::ALL {
            states.insert(kind, PipelineState::Stopped);
        }

        Self {
            config,
            connector,
            store,
            broadcaster,
            stats: Arc::new(RelayStats::default()),
            connection: RwLock::new(None),
            active: Mutex::new(Vec::new()),
            states,
        }
    }

    /// Connect to the bus and subscribe every pipeline.
    ///
    /// On failure nothing is left running and the connection is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is already running, the bus is
    /// unreachable or a subscription fails.
    pub async fn start(&self) -> Result<(), RelayError> {
        let mut active = self.active.lock().await;
        if !active.is_empty() {
            return Err(RelayError::AlreadyRunning);
        }

        self.set_all(PipelineState::Starting);

        let connection = match self.connector.connect(&self.config.endpoint).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(endpoint = %self.config.endpoint, error = %e, "Bus connection failed");
                self.set_all(PipelineState::Stopped);
                return Err(RelayError::Connection(e));
            }
        };

        for kind in MessageKind::ALL {
            let pipeline = Pipeline::new(
                kind,
                Arc::clone(&self.store),
                Arc::clone(&self.broadcaster),
                Arc::clone(&self.stats),
                self.config.task_delay,
            );

            match connection
                .subscribe(kind.subject(), Arc::new(pipeline.clone()))
                .await
            {
                Ok(subscription) => {
                    active.push(ActivePipeline {
                        pipeline,
                        subscription,
                    });
                    self.states.insert(kind, PipelineState::Running);
                    debug!(kind = %kind, subject = kind.subject(), "Pipeline running");
                }
                Err(e) => {
                    error!(kind = %kind, error = %e, "Subscription failed; aborting start");
                    active.clear();
                    connection.close().await;
                    self.set_all(PipelineState::Stopped);
                    return Err(RelayError::Connection(e));
                }
            }
        }

        *self.connection.write().await = Some(connection);
        info!(endpoint = %self.config.endpoint, "Relay started");

        Ok(())
    }

    /// Cancel every subscription and close the bus connection.
    ///
    /// Tasks waiting out the processing delay are abandoned rather than
    /// awaited. Safe to call at any time, including after a failed start.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let connection = self.connection.write().await.take();

        for ActivePipeline {
            pipeline,
            subscription,
        } in active.drain(..)
        {
            self.states.insert(pipeline.kind(), PipelineState::Stopping);
            pipeline.close();
            subscription.unsubscribe();
            self.states.insert(pipeline.kind(), PipelineState::Stopped);
        }

        if let Some(connection) = connection {
            connection.close().await;
            info!("Relay stopped");
        }

        self.set_all(PipelineState::Stopped);
    }

    /// Submit a chat message.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the bus rejects the publish.
    pub async fn submit_chat(&self, sender: &str, content: &str) -> Result<Message, RelayError> {
        self.publish(Message::chat(sender, content)?).await
    }

    /// Submit a system notification.
    ///
    /// The title is informational only; the body becomes the content.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the bus rejects the publish.
    pub async fn submit_notification(&self, title: &str, body: &str) -> Result<Message, RelayError> {
        let message = Message::notification(body)?;
        debug!(id = %message.id(), title = %title, "Submitting notification");
        self.publish(message).await
    }

    /// Submit a task for processing.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the bus rejects the publish.
    pub async fn submit_task(&self, task_data: &str) -> Result<Message, RelayError> {
        self.publish(Message::task(task_data)?).await
    }

    async fn publish(&self, message: Message) -> Result<Message, RelayError> {
        let payload = codec::encode(&message)?;

        let connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(RelayError::Publish(BusError::NotConnected))?;

        connection
            .publish(message.kind().subject(), payload)
            .await
            .map_err(RelayError::Publish)?;
        self.stats.record_published();

        debug!(id = %message.id(), kind = %message.kind(), "Published message");
        Ok(message)
    }

    /// The most recent messages, newest first, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Message>, RelayError> {
        Ok(self.store.recent(limit).await?)
    }

    /// The most recent messages of one kind, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_recent_by_kind(
        &self,
        kind: MessageKind,
        limit: usize,
    ) -> Result<Vec<Message>, RelayError> {
        Ok(self.store.recent_by_kind(kind, limit).await?)
    }

    /// Current state of a pipeline.
    #[must_use]
    pub fn pipeline_state(&self, kind: MessageKind) -> PipelineState {
        self.states
            .get(&kind)
            .map(|state| *state)
            .unwrap_or(PipelineState::Stopped)
    }

    /// Whether every pipeline is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        MessageKind::ALL
            .into_iter()
            .all(|kind| self.pipeline_state(kind) == PipelineState::Running)
    }

    /// Get relay statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn set_all(&self, state: PipelineState) {
        for kind in MessageKind::ALL {
            self.states.insert(kind, state);
        }
    }
}
