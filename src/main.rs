mod config;
mod forwarder;
mod platform;
mod slack;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::forwarder::Forwarder;
use crate::slack::SlackClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,slack_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Environment variables may come from a local .env file
    if let Ok(path) = dotenvy::dotenv() {
        info!("Loaded environment from: {}", path.display());
    }

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Forwarding messages from channel: {}", config.relay.source_channel_id);
    info!("  To target channel: {}", config.relay.target_channel_id);
    info!("  Port: {}", config.server.port);

    let api = Arc::new(SlackClient::new(config.slack.clone()));
    let forwarder = Arc::new(Forwarder::new(api, config.relay.clone()));

    info!("Slack Message Forwarder is starting...");
    platform::slack::run(&config, forwarder).await?;

    Ok(())
}
