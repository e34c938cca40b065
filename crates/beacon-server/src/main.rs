//! # Beacon Server
//!
//! Realtime presence synchronization server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (or a config file at ./beacon.toml)
//! beacon
//!
//! # Run with environment variables
//! BEACON_PORT=4000 BEACON_HOST=0.0.0.0 beacon
//! ```

use anyhow::Result;
use beacon_server::{config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Beacon server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
