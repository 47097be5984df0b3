use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub signing_secret: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

/// Which channel is watched and where relayed messages go.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub source_channel_id: String,
    #[serde(default)]
    pub target_channel_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_events_path")]
    pub events_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            signing_secret: String::new(),
            api_base_url: default_api_base_url(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            events_path: default_events_path(),
            health_path: default_health_path(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn default_api_base_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_events_path() -> String {
    "/slack/events".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Config {
    /// Load the TOML file at `path` (if it exists), then apply environment
    /// overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            info!(
                "No config file at {}, using environment only",
                path.display()
            );
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from environment variables. `lookup` returns the value
    /// for a variable name, if set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides: [(&str, &mut String); 6] = [
            ("SLACK_BOT_TOKEN", &mut self.slack.bot_token),
            ("SLACK_SIGNING_SECRET", &mut self.slack.signing_secret),
            ("SLACK_API_BASE_URL", &mut self.slack.api_base_url),
            ("SOURCE_CHANNEL_ID", &mut self.relay.source_channel_id),
            ("TARGET_CHANNEL_ID", &mut self.relay.target_channel_id),
            ("BIND_ADDRESS", &mut self.server.bind_address),
        ];
        for (key, field) in overrides {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *field = value;
            }
        }

        if let Some(port) = lookup("PORT").filter(|v| !v.is_empty()) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT value: {}", port))?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("slack.bot_token / SLACK_BOT_TOKEN", &self.slack.bot_token),
            (
                "slack.signing_secret / SLACK_SIGNING_SECRET",
                &self.slack.signing_secret,
            ),
            (
                "relay.source_channel_id / SOURCE_CHANNEL_ID",
                &self.relay.source_channel_id,
            ),
            (
                "relay.target_channel_id / TARGET_CHANNEL_ID",
                &self.relay.target_channel_id,
            ),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            bail!("Missing required configuration: {}", missing.join(", "));
        }
        Ok(())
    }
}
