//! juggler-server: websocket bus server backed by Redis.
//!
//! ## Configuration
//! - JUGGLER_CONFIG: path to a YAML config file (default: "config.yaml")
//! - JUGGLER_HOST / JUGGLER_PORT: listener overrides
//! - JUGGLER_REDIS_URL: Redis backend override
//! - JUGGLER_LOG: tracing filter (default: "info")

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use juggler::broker::RedisBroker;
use juggler::config::{Config, LOG_ENV_VAR};
use juggler::metrics::Metrics;
use juggler::server::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting juggler server");

    let config = Config::load()?;
    let metrics = Arc::new(Metrics::new());

    let broker = Arc::new(
        RedisBroker::new(&config.redis, config.broker.clone(), metrics.clone()).await?,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");

    let server = Arc::new(Server::new(
        broker.clone(),
        broker,
        &config,
        metrics,
    ));

    server.serve(listener).await?;
    Ok(())
}
