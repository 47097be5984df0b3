//! Slack Events API receiver.
//!
//! Verifies request signatures, answers the `url_verification` handshake and
//! hands every `message` event to an [`EventHandler`] on its own task. Also
//! serves the health check.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::platform::{EventHandler, FileAttachment, IncomingMessage};

type HmacSha256 = Hmac<Sha256>;

/// Requests older (or newer) than this are treated as replays.
const MAX_REQUEST_AGE_SECS: u64 = 60 * 5;

#[derive(Clone)]
struct ReceiverState {
    signing_secret: Arc<str>,
    handler: Arc<dyn EventHandler>,
}

// ── Slack wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        event: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// A `message` event. Everything except the channel may be absent depending
/// on the subtype.
#[derive(Debug, Deserialize)]
struct MessageEvent {
    channel: String,
    user: Option<String>,
    text: Option<String>,
    bot_id: Option<String>,
    subtype: Option<String>,
    ts: Option<String>,
    #[serde(default)]
    files: Vec<SlackFile>,
}

#[derive(Debug, Deserialize)]
struct SlackFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    filetype: String,
    #[serde(default)]
    permalink: String,
}

impl From<MessageEvent> for IncomingMessage {
    fn from(event: MessageEvent) -> Self {
        IncomingMessage {
            channel_id: event.channel,
            user_id: event.user,
            text: event.text,
            bot_id: event.bot_id,
            subtype: event.subtype,
            ts: event.ts,
            files: event
                .files
                .into_iter()
                .map(|f| FileAttachment {
                    name: f.name,
                    filetype: f.filetype,
                    permalink: f.permalink,
                })
                .collect(),
        }
    }
}

/// Convert an inner event to an [`IncomingMessage`]. Returns `None` for
/// non-message events and for message events without a channel.
fn message_from_event(event: serde_json::Value) -> Option<IncomingMessage> {
    if event.get("type").and_then(|t| t.as_str()) != Some("message") {
        return None;
    }
    match serde_json::from_value::<MessageEvent>(event) {
        Ok(message) => Some(message.into()),
        Err(e) => {
            warn!("Skipping malformed message event: {}", e);
            None
        }
    }
}

// ── Signature verification ─────────────────────────────────────────────────────

/// Check `X-Slack-Signature` against an HMAC-SHA256 of
/// `v0:{timestamp}:{body}` keyed by the signing secret.
fn verify_signature(
    headers: &HeaderMap,
    body: &[u8],
    signing_secret: &str,
    now: i64,
) -> Result<()> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .with_context(|| format!("missing {} header", name))
    };
    let timestamp = header("x-slack-request-timestamp")?;
    let signature = header("x-slack-signature")?;

    let ts: i64 = timestamp
        .parse()
        .with_context(|| format!("invalid request timestamp: {}", timestamp))?;
    if now.abs_diff(ts) > MAX_REQUEST_AGE_SECS {
        bail!("request timestamp too old: {}", ts);
    }

    let expected = signature
        .strip_prefix("v0=")
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .context("malformed signature")?;

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .map_err(|_| anyhow!("invalid signing secret"))?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| anyhow!("signature mismatch"))
}

// ── Handlers ───────────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "OK",
        "message": "Slack Message Forwarder is running",
    }))
}

async fn handle_events(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let now = chrono::Utc::now().timestamp();
    if let Err(e) = verify_signature(&headers, &body, &state.signing_secret, now) {
        warn!("Rejected Slack request: {:#}", e);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!("Failed to parse Slack event envelope: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match envelope {
        Envelope::UrlVerification { challenge } => {
            info!("Answering Slack URL verification");
            Json(json!({ "challenge": challenge })).into_response()
        }
        Envelope::EventCallback { event } => {
            let event_type = event
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("unknown")
                .to_string();
            match message_from_event(event) {
                Some(message) => dispatch(state.handler.clone(), message),
                None => debug!("Ignoring Slack event: {}", event_type),
            }
            StatusCode::OK.into_response()
        }
        Envelope::Other => {
            debug!("Ignoring Slack envelope");
            StatusCode::OK.into_response()
        }
    }
}

/// Run the handler on its own task so Slack gets its acknowledgement right
/// away. A panicking handler only takes down its own task.
fn dispatch(handler: Arc<dyn EventHandler>, message: IncomingMessage) {
    let task = tokio::spawn(async move { handler.handle(message).await });
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("Event handler task failed: {}", e);
        }
    });
}

// ── Server ─────────────────────────────────────────────────────────────────────

pub fn router(config: &Config, handler: Arc<dyn EventHandler>) -> Router {
    let state = ReceiverState {
        signing_secret: Arc::from(config.slack.signing_secret.as_str()),
        handler,
    };

    Router::new()
        .route(&config.server.events_path, post(handle_events))
        .route(&config.server.health_path, get(health))
        .with_state(state)
}

/// Serve the Events API until Ctrl-C.
pub async fn run(config: &Config, handler: Arc<dyn EventHandler>) -> Result<()> {
    let app = router(config, handler);

    let addr = config.server.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!(
        "Listening for Slack events on {}{}",
        addr, config.server.events_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}
