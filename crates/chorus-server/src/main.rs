//! # Chorus Server
//!
//! WebSocket broadcast relay: every text message a client sends is relayed
//! to every connected client.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! chorus
//!
//! # Run with a custom config file
//! CHORUS_CONFIG=/path/to/chorus.toml chorus
//!
//! # Run with environment variables
//! CHORUS_PORT=8080 CHORUS_HOST=0.0.0.0 chorus
//! ```

mod config;
mod handlers;
mod metrics;
mod shutdown;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Chorus server on {}:{}", config.host, config.port);

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
