//! # flowrelay
//!
//! Message relay server: accepts chat, notification and task submissions
//! over HTTP, relays them through the bus and streams the results to
//! WebSocket subscribers.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! flowrelay
//!
//! # Run with environment variables
//! FLOWRELAY_PORT=8080 FLOWRELAY_BUS_URL=memory://local flowrelay
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowrelay=debug,flowrelay_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting flowrelay on {}:{} (bus {})",
        config.host,
        config.port,
        config.bus.url
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
