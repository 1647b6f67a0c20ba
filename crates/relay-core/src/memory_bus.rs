//! In-process bus broker.
//!
//! `MemoryBus` plays the role of the external pub/sub server on a single
//! node. Every subject is a bounded broadcast channel; every subscription is
//! served by its own worker task, so one slow handler never stalls another
//! subject, and messages on one subscription are handled in publish order.

use crate::bus::{
    validate_subject, BusConnection, BusError, Connector, MessageHandler, Subscription,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

/// Endpoint scheme served by [`MemoryBus`].
pub const MEMORY_SCHEME: &str = "memory://";

/// Default per-subject buffer capacity.
const DEFAULT_SUBJECT_CAPACITY: usize = 1024;

/// Broker state shared by every connection.
struct Broker {
    name: String,
    subjects: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
    open: AtomicBool,
    next_subscription_id: AtomicU64,
}

impl Broker {
    fn sender(&self, subject: &str) -> broadcast::Sender<Bytes> {
        self.subjects
            .entry(subject.to_string())
            .or_insert_with(|| {
                debug!(broker = %self.name, subject = %subject, "Creating subject");
                broadcast::channel(self.capacity).0
            })
            .clone()
    }
}

/// An in-process publish/subscribe broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBus {
    broker: Arc<Broker>,
}

impl MemoryBus {
    /// Create a broker reachable at `memory://<name>`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_SUBJECT_CAPACITY)
    }

    /// Create a broker with a specific per-subject capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        info!(broker = %name, capacity, "Creating memory bus");
        Self {
            broker: Arc::new(Broker {
                name,
                subjects: DashMap::new(),
                capacity: capacity.max(1),
                open: AtomicBool::new(true),
                next_subscription_id: AtomicU64::new(1),
            }),
        }
    }

    /// Broker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.broker.name
    }

    /// Endpoint string connecting to this broker.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{MEMORY_SCHEME}{}", self.broker.name)
    }

    /// Connect without going through endpoint resolution.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker has been shut down.
    pub fn open_connection(&self) -> Result<MemoryConnection, BusError> {
        if !self.broker.open.load(Ordering::Acquire) {
            return Err(BusError::Connection(format!(
                "broker {} is shut down",
                self.broker.name
            )));
        }
        debug!(broker = %self.broker.name, "Connection opened");
        Ok(MemoryConnection {
            broker: Arc::clone(&self.broker),
            open: Arc::new(AtomicBool::new(true)),
            workers: DashMap::new(),
        })
    }

    /// Number of live subscribers on a subject.
    #[must_use]
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.broker
            .subjects
            .get(subject)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Shut the broker down.
    ///
    /// New connections are refused, publishes fail and every subscription
    /// worker ends once its subject channel closes.
    pub fn shutdown(&self) {
        if self.broker.open.swap(false, Ordering::AcqRel) {
            self.broker.subjects.clear();
            info!(broker = %self.broker.name, "Memory bus shut down");
        }
    }
}

#[async_trait]
impl Connector for MemoryBus {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BusConnection>, BusError> {
        let name = endpoint.strip_prefix(MEMORY_SCHEME).ok_or_else(|| {
            BusError::Connection(format!("unsupported endpoint: {endpoint}"))
        })?;

        if name != self.broker.name {
            return Err(BusError::Connection(format!("unknown broker: {name}")));
        }

        let connection: Arc<dyn BusConnection> = Arc::new(self.open_connection()?);
        Ok(connection)
    }
}

/// A connection to a [`MemoryBus`].
pub struct MemoryConnection {
    broker: Arc<Broker>,
    open: Arc<AtomicBool>,
    workers: DashMap<u64, AbortHandle>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.ensure_open()?;
        validate_subject(subject).map_err(BusError::InvalidSubject)?;

        if !self.broker.open.load(Ordering::Acquire) {
            return Err(BusError::Publish {
                subject: subject.to_string(),
                reason: "broker is shut down".to_string(),
            });
        }

        // No receivers is not an error: the transport accepted the payload.
        let recipients = self.broker.sender(subject).send(payload).unwrap_or_default();
        trace!(subject = %subject, recipients, "Published payload");

        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        self.ensure_open()?;
        validate_subject(subject).map_err(BusError::InvalidSubject)?;

        if !self.broker.open.load(Ordering::Acquire) {
            return Err(BusError::NotConnected);
        }

        let receiver = self.broker.sender(subject).subscribe();
        let id = self
            .broker
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed);

        let worker = tokio::spawn(run_worker(
            subject.to_string(),
            receiver,
            handler,
            Arc::clone(&self.open),
        ));

        self.workers.retain(|_, handle| !handle.is_finished());
        self.workers.insert(id, worker.abort_handle());

        debug!(subject = %subject, subscription = id, "Subscribed");

        Ok(Subscription::new(id, subject, worker))
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        for entry in self.workers.iter() {
            entry.value().abort();
        }
        let cancelled = self.workers.len();
        self.workers.clear();

        info!(broker = %self.broker.name, subscriptions = cancelled, "Connection closed");
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        for entry in self.workers.iter() {
            entry.value().abort();
        }
    }
}

/// Deliver one subscription's messages to its handler, one at a time.
async fn run_worker(
    subject: String,
    mut receiver: broadcast::Receiver<Bytes>,
    handler: Arc<dyn MessageHandler>,
    open: Arc<AtomicBool>,
) {
    loop {
        match receiver.recv().await {
            Ok(payload) => {
                if !open.load(Ordering::Acquire) {
                    break;
                }

                let outcome = AssertUnwindSafe(handler.handle(&subject, payload))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    error!(subject = %subject, "Handler panicked; message dropped");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(subject = %subject, skipped, "Subscriber lagged; messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    debug!(subject = %subject, "Subscription worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<Bytes>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, _subject: &str, payload: Bytes) {
            let _ = self.0.send(payload);
        }
    }

    struct PanicOnce {
        panicked: Mutex<bool>,
        tx: mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl MessageHandler for PanicOnce {
        async fn handle(&self, _subject: &str, payload: Bytes) {
            let first = {
                let mut panicked = self.panicked.lock().unwrap();
                !std::mem::replace(&mut *panicked, true)
            };
            if first {
                panic!("handler failure");
            }
            let _ = self.tx.send(payload);
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_connect_endpoint_resolution() {
        let bus = MemoryBus::new("local");
        assert_eq!(bus.endpoint(), "memory://local");

        assert!(bus.connect("memory://local").await.is_ok());
        assert!(matches!(
            bus.connect("memory://other").await,
            Err(BusError::Connection(_))
        ));
        assert!(matches!(
            bus.connect("nats://localhost:4222").await,
            Err(BusError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_subscribe_in_order() {
        let bus = MemoryBus::new("local");
        let conn = bus.open_connection().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = conn
            .subscribe("chat.messages", Arc::new(Forward(tx)))
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count("chat.messages"), 1);

        for i in 0..5u8 {
            conn.publish("chat.messages", Bytes::from(vec![i]))
                .await
                .unwrap();
        }

        for i in 0..5u8 {
            assert_eq!(recv(&mut rx).await.unwrap()[..], [i]);
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_accepted() {
        let bus = MemoryBus::new("local");
        let conn = bus.open_connection().unwrap();
        assert!(conn
            .publish("notifications", Bytes::from_static(b"x"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_no_backlog_replay() {
        let bus = MemoryBus::new("local");
        let conn = bus.open_connection().unwrap();
        conn.publish("tasks.process", Bytes::from_static(b"early"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = conn
            .subscribe("tasks.process", Arc::new(Forward(tx)))
            .await
            .unwrap();
        conn.publish("tasks.process", Bytes::from_static(b"late"))
            .await
            .unwrap();

        assert_eq!(&recv(&mut rx).await.unwrap()[..], b"late");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_cancels() {
        let bus = MemoryBus::new("local");
        let conn = bus.open_connection().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = conn
            .subscribe("chat.messages", Arc::new(Forward(tx)))
            .await
            .unwrap();

        conn.close().await;
        conn.close().await;
        assert!(!conn.is_connected());

        assert!(matches!(
            conn.publish("chat.messages", Bytes::from_static(b"x")).await,
            Err(BusError::NotConnected)
        ));

        let publisher = bus.open_connection().unwrap();
        publisher
            .publish("chat.messages", Bytes::from_static(b"after close"))
            .await
            .unwrap();
        assert!(recv(&mut rx).await.is_none());
        drop(sub);
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_stop_worker() {
        let bus = MemoryBus::new("local");
        let conn = bus.open_connection().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = PanicOnce {
            panicked: Mutex::new(false),
            tx,
        };

        let _sub = conn
            .subscribe("chat.messages", Arc::new(handler))
            .await
            .unwrap();
        conn.publish("chat.messages", Bytes::from_static(b"first"))
            .await
            .unwrap();
        conn.publish("chat.messages", Bytes::from_static(b"second"))
            .await
            .unwrap();

        assert_eq!(&recv(&mut rx).await.unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn test_shutdown_refuses_connections() {
        let bus = MemoryBus::new("local");
        let conn = bus.open_connection().unwrap();
        bus.shutdown();

        assert!(matches!(
            bus.connect("memory://local").await,
            Err(BusError::Connection(_))
        ));
        assert!(matches!(
            conn.publish("chat.messages", Bytes::from_static(b"x")).await,
            Err(BusError::Publish { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_subject() {
        let bus = MemoryBus::new("local");
        let conn = bus.open_connection().unwrap();
        assert!(matches!(
            conn.publish("", Bytes::new()).await,
            Err(BusError::InvalidSubject(_))
        ));
    }
}
