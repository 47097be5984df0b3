pub mod slack;

use async_trait::async_trait;

/// A message event received from the chat platform
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingMessage {
    /// Channel the message was posted in
    pub channel_id: String,
    /// Author's user ID; absent on some subtypes (edits, deletions)
    pub user_id: Option<String>,
    /// The message text
    pub text: Option<String>,
    /// Set when the message was posted by a bot or integration
    pub bot_id: Option<String>,
    pub subtype: Option<String>,
    pub ts: Option<String>,
    /// Attached files, in the order they were shared
    pub files: Vec<FileAttachment>,
}

impl IncomingMessage {
    /// True for messages posted by a bot, including the relay's own posts.
    pub fn is_from_bot(&self) -> bool {
        self.bot_id.is_some() || self.subtype.as_deref() == Some("bot_message")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileAttachment {
    pub name: String,
    pub filetype: String,
    pub permalink: String,
}

/// Receives every message event the platform delivers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage);
}
