//! # flowrelay-core
//!
//! Bus abstraction, channel pipelines and the relay core.
//!
//! - **Bus** - Connection lifecycle, publish and cancelable subscriptions
//! - **MemoryBus** - Single-node in-process broker
//! - **Store** - Upsert-by-id persistence with a recent-first query
//! - **Broadcast** - Best-effort push to live subscribers
//! - **Relay** - Three fixed pipelines plus the producer-facing API
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ publish ┌─────────────┐ subscribe ┌─────────────┐
//! │  Relay API  │────────▶│     Bus     │──────────▶│  Pipelines  │
//! └─────────────┘         └─────────────┘           └─────────────┘
//!        ▲                                            │        │
//!        │ recent                                save │        │ broadcast
//!        │                                            ▼        ▼
//!        │                                   ┌──────────┐ ┌──────────┐
//!        └───────────────────────────────────│  Store   │ │ TopicHub │
//!                                            └──────────┘ └──────────┘
//! ```

pub mod broadcast;
pub mod bus;
pub mod memory_bus;
mod pipeline;
pub mod relay;
pub mod stats;
pub mod store;

pub use broadcast::{BroadcastError, Broadcaster, TopicHub};
pub use bus::{BusConnection, BusError, Connector, MessageHandler, Subscription};
pub use memory_bus::{MemoryBus, MemoryConnection};
pub use pipeline::PipelineError;
pub use relay::{PipelineState, Relay, RelayConfig, RelayError, DEFAULT_TASK_DELAY};
pub use stats::{RelayStats, StatsSnapshot};
pub use store::{MemoryStore, MessageStore, StoreError};
