//! HTTP and WebSocket handlers.
//!
//! The HTTP routes are the producer surface; the WebSocket route streams
//! relayed messages to live subscribers.

use crate::config::Config;
use crate::metrics::{self, LiveConnectionGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flowrelay_core::{MemoryBus, MemoryStore, Relay, RelayConfig, RelayError, TopicHub};
use flowrelay_protocol::subjects::{is_topic, ALL_TOPICS};
use flowrelay_protocol::{CodecError, Message, MessageKind};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error, info, warn};

/// Default page size for the recent-messages query.
pub const DEFAULT_RECENT_LIMIT: usize = 20;

/// Largest page the recent-messages query returns.
pub const MAX_RECENT_LIMIT: usize = 1000;

/// Shared server state.
pub struct AppState {
    /// The relay core.
    pub relay: Relay,
    /// Live subscriber hub the relay broadcasts into.
    pub hub: Arc<TopicHub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state. The relay is not started.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let broker = config
            .bus
            .url
            .strip_prefix(flowrelay_core::memory_bus::MEMORY_SCHEME)
            .unwrap_or("local");
        let bus = MemoryBus::with_capacity(broker, config.bus.subject_capacity);
        let hub = Arc::new(TopicHub::with_capacity(config.relay.broadcast_capacity));

        let relay = Relay::new(
            RelayConfig::new(config.bus.url.clone()).with_task_delay(config.relay.task_delay()),
            Arc::new(bus),
            Arc::new(MemoryStore::new()),
            hub.clone(),
        );

        Self { relay, hub, config }
    }
}

/// CORS policy for browser clients of the API.
fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        let origin = HeaderValue::from_str(origin)
            .with_context(|| format!("Invalid CORS origin: {origin}"))?;
        AllowOrigin::exact(origin)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]))
}

/// Build the HTTP router.
///
/// # Errors
///
/// Returns an error if the configured CORS origin is not a valid header value.
pub fn build_router(state: Arc<AppState>) -> Result<Router> {
    let cors = cors_layer(&state.config.cors_origin)?;

    Ok(Router::new()
        .route("/api/messages/chat", post(chat_handler))
        .route("/api/messages/notification", post(notification_handler))
        .route("/api/messages/task", post(task_handler))
        .route("/api/messages/recent", get(recent_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .with_state(state))
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the relay cannot start or the server fails to bind.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    state.relay.start().await?;

    let app = build_router(state.clone())?;
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("flowrelay listening on {}", addr);
    info!("Live endpoint: ws://{}/ws", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    state.relay.stop().await;
    served?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Relay failures as HTTP responses.
#[derive(Debug)]
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::Validation(_) | RelayError::Codec(CodecError::PayloadTooLarge(_)) => {
                metrics::record_rejection("validation");
                StatusCode::BAD_REQUEST
            }
            RelayError::Publish(_) | RelayError::Connection(_) => {
                metrics::record_rejection("publish");
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::Codec(_) | RelayError::Store(_) | RelayError::AlreadyRunning => {
                metrics::record_error("internal");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        warn!(status = %status, error = %self.0, "Request failed");
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Chat submission body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub username: String,
    pub content: String,
}

/// Notification submission body.
#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    pub title: String,
    pub message: String,
}

/// Task submission body.
#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "taskData")]
    pub task_data: String,
}

/// Recent-messages query.
#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// Live subscription query: comma-separated topics.
#[derive(Debug, Default, Deserialize)]
pub struct LiveQuery {
    pub topics: Option<String>,
}

fn accepted(message: &Message, started: Instant, ack: &'static str) -> &'static str {
    metrics::record_submission(message.kind().as_str());
    metrics::record_latency(started.elapsed().as_secs_f64());
    debug!(id = %message.id(), kind = %message.kind(), "Submission accepted");
    ack
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<&'static str, ApiError> {
    let started = Instant::now();
    let message = state
        .relay
        .submit_chat(&request.username, &request.content)
        .await?;
    Ok(accepted(&message, started, "Message sent successfully"))
}

async fn notification_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NotificationRequest>,
) -> Result<&'static str, ApiError> {
    let started = Instant::now();
    let message = state
        .relay
        .submit_notification(&request.title, &request.message)
        .await?;
    Ok(accepted(&message, started, "Notification sent successfully"))
}

async fn task_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TaskRequest>,
) -> Result<&'static str, ApiError> {
    let started = Instant::now();
    let message = state.relay.submit_task(&request.task_data).await?;
    Ok(accepted(&message, started, "Task submitted successfully"))
}

async fn recent_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<Message>>, Response> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(MAX_RECENT_LIMIT);

    let messages = match query.kind.as_deref() {
        None => state.relay.list_recent(limit).await,
        Some(raw) => {
            let kind: MessageKind = raw.parse().map_err(|e: String| {
                (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e }))).into_response()
            })?;
            state.relay.list_recent_by_kind(kind, limit).await
        }
    };

    messages
        .map(Json)
        .map_err(|e| ApiError::from(e).into_response())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pipelines: serde_json::Map<String, serde_json::Value> = MessageKind::ALL
        .into_iter()
        .map(|kind| {
            (
                kind.subject().to_string(),
                serde_json::json!(state.relay.pipeline_state(kind)),
            )
        })
        .collect();

    let running = state.relay.is_running();
    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if running { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "bus": state.config.bus.url,
            "pipelines": pipelines,
        })),
    )
}

/// Relay statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let live: serde_json::Map<String, serde_json::Value> = ALL_TOPICS
        .into_iter()
        .map(|topic| (topic.to_string(), serde_json::json!(state.hub.subscriber_count(topic))))
        .collect();

    Json(serde_json::json!({
        "relay": state.relay.stats(),
        "live_subscribers": live,
    }))
}

/// Parse the requested topics, defaulting to all of them.
fn parse_topics(raw: Option<&str>) -> Result<Vec<String>, String> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(ALL_TOPICS.iter().map(|t| t.to_string()).collect());
    };

    let mut topics = Vec::new();
    for topic in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !is_topic(topic) {
            return Err(format!("Unknown topic: {topic}"));
        }
        if !topics.iter().any(|t| t == topic) {
            topics.push(topic.to_string());
        }
    }
    Ok(topics)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<LiveQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let topics = match parse_topics(query.topics.as_deref()) {
        Ok(topics) => topics,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e })))
                .into_response()
        }
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, topics))
}

/// Stream relayed messages to a WebSocket client.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, topics: Vec<String>) {
    let _metrics_guard = LiveConnectionGuard::new();
    let (mut sender, mut receiver) = socket.split();

    // Merge every topic receiver into one stream.
    let (live_tx, mut live_rx) = mpsc::unbounded_channel::<(String, Arc<Message>)>();
    let mut forwarders = Vec::with_capacity(topics.len());

    for topic in topics {
        let mut rx = match state.hub.subscribe(&topic) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Live subscribe failed");
                continue;
            }
        };
        let tx = live_tx.clone();
        forwarders.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if tx.send((topic.clone(), message)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Live subscriber lagged");
                    }
                }
            }
        }));
    }
    drop(live_tx);

    debug!(topics = forwarders.len(), "Live subscriber connected");

    loop {
        tokio::select! {
            biased;

            Some((topic, message)) = live_rx.recv() => {
                let body = serde_json::json!({ "topic": topic, "message": &*message });
                metrics::record_live_message(&topic);
                if sender.send(WsMessage::Text(body.to_string())).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Live subscribers only listen.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                }
            }
        }
    }

    for forwarder in forwarders {
        forwarder.abort();
    }

    debug!("Live subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn running_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.bus.url = "memory://test".to_string();
        config.relay.task_delay_ms = 10;
        let state = Arc::new(AppState::new(config));
        state.relay.start().await.unwrap();
        state
    }

    async fn recent(state: &Arc<AppState>, query: RecentQuery) -> Vec<Message> {
        recent_handler(State(state.clone()), Query(query))
            .await
            .unwrap()
            .0
    }

    async fn wait_for(state: &Arc<AppState>, count: usize) -> Vec<Message> {
        for _ in 0..200 {
            let messages = recent(state, RecentQuery::default()).await;
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} messages");
    }

    #[tokio::test]
    async fn test_submit_chat_and_list() {
        let state = running_state().await;

        let response = chat_handler(
            State(state.clone()),
            Json(ChatRequest {
                username: "alice".to_string(),
                content: "hi".to_string(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let messages = wait_for(&state, 1).await;
        assert_eq!(messages[0].sender(), "alice");
        assert_eq!(messages[0].content(), "hi");
    }

    #[tokio::test]
    async fn test_oversized_submission_is_bad_request() {
        let state = running_state().await;

        let response = task_handler(
            State(state.clone()),
            Json(TaskRequest {
                task_data: "x".repeat(1001),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.relay.stats().published, 0);
    }

    #[tokio::test]
    async fn test_oversized_username_is_bad_request() {
        let state = running_state().await;

        let response = chat_handler(
            State(state.clone()),
            Json(ChatRequest {
                username: "a".repeat(70_000),
                content: "hi".to_string(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.relay.stats().published, 0);
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/messages/chat")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin() {
        let state = Arc::new(AppState::new(Config::default()));
        let router = build_router(state).unwrap();

        let allowed = router
            .clone()
            .oneshot(preflight("http://localhost:3000"))
            .await
            .unwrap();
        assert_eq!(
            allowed.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            Some(&HeaderValue::from_static("http://localhost:3000"))
        );

        let denied = router.oneshot(preflight("http://evil.test")).await.unwrap();
        assert!(denied
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[test]
    fn test_invalid_cors_origin() {
        let mut config = Config::default();
        config.cors_origin = "bad\norigin".to_string();
        assert!(build_router(Arc::new(AppState::new(config))).is_err());
    }

    #[tokio::test]
    async fn test_submission_when_stopped_is_unavailable() {
        let state = running_state().await;
        state.relay.stop().await;

        let response = notification_handler(
            State(state.clone()),
            Json(NotificationRequest {
                title: "t".to_string(),
                message: "m".to_string(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_recent_limit_and_kind_filter() {
        let state = running_state().await;
        for i in 0..3 {
            state.relay.submit_chat("alice", &i.to_string()).await.unwrap();
        }
        state.relay.submit_task("build-x").await.unwrap();
        wait_for(&state, 4).await;

        let limited = recent(
            &state,
            RecentQuery {
                limit: Some(2),
                kind: None,
            },
        )
        .await;
        assert_eq!(limited.len(), 2);

        let tasks = recent(
            &state,
            RecentQuery {
                limit: None,
                kind: Some("task".to_string()),
            },
        )
        .await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].content(), "build-x [PROCESSED]");

        let bad = recent_handler(
            State(state.clone()),
            Query(RecentQuery {
                limit: None,
                kind: Some("EMAIL".to_string()),
            }),
        )
        .await;
        assert_eq!(bad.unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reflects_pipelines() {
        let state = running_state().await;
        let response = health_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        state.relay.stop().await;
        let response = health_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_parse_topics() {
        assert_eq!(parse_topics(None).unwrap().len(), 3);
        assert_eq!(parse_topics(Some("")).unwrap().len(), 3);
        assert_eq!(
            parse_topics(Some("/topic/chat, /topic/chat,/topic/tasks")).unwrap(),
            vec!["/topic/chat".to_string(), "/topic/tasks".to_string()]
        );
        assert!(parse_topics(Some("/topic/chat,chat.messages")).is_err());
    }
}
