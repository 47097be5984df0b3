use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SlackConfig;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UserInfo {
    /// The user's handle
    pub name: String,
    #[serde(default)]
    pub real_name: Option<String>,
}

impl UserInfo {
    /// Real name when set, otherwise the handle.
    pub fn display_name(&self) -> &str {
        self.real_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
}

/// Body of a `chat.postMessage` call. Unset unfurl flags are left out so
/// Slack applies its defaults.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutgoingMessage {
    pub channel: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unfurl_links: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unfurl_media: Option<bool>,
}

impl OutgoingMessage {
    /// A message with link and media previews turned off.
    pub fn without_previews(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            text: text.into(),
            unfurl_links: Some(false),
            unfurl_media: Some(false),
        }
    }

    /// A message whose links get unfurled.
    pub fn with_link_previews(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            text: text.into(),
            unfurl_links: Some(true),
            unfurl_media: None,
        }
    }
}

/// The Slack Web API calls the relay needs.
#[async_trait]
pub trait SlackApi: Send + Sync {
    async fn user_info(&self, user_id: &str) -> Result<UserInfo>;

    async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo>;

    /// Post a message and return its timestamp.
    async fn post_message(&self, message: &OutgoingMessage) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    user: UserInfo,
}

#[derive(Debug, Deserialize)]
struct ChannelInfoResponse {
    channel: ChannelInfo,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ts: String,
}

pub struct SlackClient {
    client: reqwest::Client,
    config: SlackConfig,
}

impl SlackClient {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, method: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_base_url.trim_end_matches('/'),
            method
        )
    }

    async fn get<T: DeserializeOwned>(&self, method: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.url(method);
        debug!("Calling Slack API: GET {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.bot_token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to send request to Slack {}", method))?;

        Self::parse_response(method, response).await
    }

    async fn post<B, T>(&self, method: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(method);
        debug!("Calling Slack API: POST {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.bot_token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to Slack {}", method))?;

        Self::parse_response(method, response).await
    }

    /// Slack reports most failures as HTTP 200 with `"ok": false`, so the
    /// envelope is checked before decoding the payload.
    async fn parse_response<T: DeserializeOwned>(
        method: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();
            bail!(
                "Slack {} rate limited (retry after {}s)",
                method,
                retry_after
            );
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            bail!("Slack {} HTTP error ({}): {}", method, status, error_body);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Slack {} response", method))?;

        if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let error = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown_error");
            bail!("Slack {} failed: {}", method, error);
        }

        serde_json::from_value(body)
            .with_context(|| format!("Unexpected Slack {} response shape", method))
    }
}

#[async_trait]
impl SlackApi for SlackClient {
    async fn user_info(&self, user_id: &str) -> Result<UserInfo> {
        let response: UserInfoResponse = self.get("users.info", &[("user", user_id)]).await?;
        Ok(response.user)
    }

    async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        let response: ChannelInfoResponse = self
            .get("conversations.info", &[("channel", channel_id)])
            .await?;
        Ok(response.channel)
    }

    async fn post_message(&self, message: &OutgoingMessage) -> Result<String> {
        let response: PostMessageResponse = self.post("chat.postMessage", message).await?;
        Ok(response.ts)
    }
}
