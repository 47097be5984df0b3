use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::RelayConfig;
use crate::platform::{EventHandler, FileAttachment, IncomingMessage};
use crate::slack::{OutgoingMessage, SlackApi};

/// Relays messages from the source channel into the target channel.
/// Stateless: every event is handled on its own.
pub struct Forwarder {
    api: Arc<dyn SlackApi>,
    relay: RelayConfig,
}

pub fn format_message(channel_name: &str, author: &str, text: &str) -> String {
    format!("*Message from #{channel_name}:*\n*{author}:* {text}")
}

pub fn format_file(channel_name: &str, author: &str, file: &FileAttachment) -> String {
    format!(
        "*File shared in #{channel_name} by {author}:*\n📎 *{}* ({})\n{}",
        file.name, file.filetype, file.permalink
    )
}

impl Forwarder {
    pub fn new(api: Arc<dyn SlackApi>, relay: RelayConfig) -> Self {
        Self { api, relay }
    }

    fn should_relay(&self, message: &IncomingMessage) -> bool {
        if message.channel_id != self.relay.source_channel_id {
            debug!("Skipping message from channel {}", message.channel_id);
            return false;
        }
        if message.is_from_bot() {
            info!("Ignoring bot message to prevent loops");
            return false;
        }
        true
    }

    async fn relay(&self, message: &IncomingMessage) -> Result<()> {
        let author_id = message
            .user_id
            .as_deref()
            .context("Message event has no author")?;

        let (user, channel) = futures::try_join!(
            async {
                self.api
                    .user_info(author_id)
                    .await
                    .with_context(|| format!("Failed to look up user {}", author_id))
            },
            async {
                self.api
                    .channel_info(&self.relay.source_channel_id)
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to look up channel {}",
                            self.relay.source_channel_id
                        )
                    })
            },
        )?;

        let author = user.display_name();
        debug!(
            "Relaying message {} by {}",
            message.ts.as_deref().unwrap_or("-"),
            author
        );
        let target = &self.relay.target_channel_id;

        let text = format_message(&channel.name, author, message.text.as_deref().unwrap_or(""));
        match self
            .api
            .post_message(&OutgoingMessage::without_previews(target, text))
            .await
        {
            Ok(ts) => info!("Message forwarded successfully: {}", ts),
            Err(e) => error!("Error forwarding message: {:#}", e),
        }

        if message.files.is_empty() {
            return Ok(());
        }

        let mut forwarded = 0;
        for file in &message.files {
            let text = format_file(&channel.name, author, file);
            match self
                .api
                .post_message(&OutgoingMessage::with_link_previews(target, text))
                .await
            {
                Ok(_) => forwarded += 1,
                Err(e) => error!("Error forwarding file '{}': {:#}", file.name, e),
            }
        }
        info!(
            "File(s) forwarded successfully: {}/{}",
            forwarded,
            message.files.len()
        );

        Ok(())
    }
}

#[async_trait]
impl EventHandler for Forwarder {
    async fn handle(&self, message: IncomingMessage) {
        if !self.should_relay(&message) {
            return;
        }
        if let Err(e) = self.relay(&message).await {
            error!("Error forwarding message: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slack::{ChannelInfo, UserInfo};
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SOURCE: &str = "C0SOURCE";
    const TARGET: &str = "C0TARGET";

    /// Records every call; individual calls can be made to fail.
    struct FakeSlack {
        real_name: Option<String>,
        fail_lookup: bool,
        fail_posts_containing: Option<String>,
        lookups: AtomicUsize,
        posts: Mutex<Vec<OutgoingMessage>>,
    }

    impl FakeSlack {
        fn new() -> Self {
            Self {
                real_name: Some("Alice".to_string()),
                fail_lookup: false,
                fail_posts_containing: None,
                lookups: AtomicUsize::new(0),
                posts: Mutex::new(Vec::new()),
            }
        }

        fn posts(&self) -> Vec<OutgoingMessage> {
            self.posts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SlackApi for FakeSlack {
        async fn user_info(&self, _user_id: &str) -> Result<UserInfo> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail_lookup {
                bail!("user_not_found");
            }
            Ok(UserInfo {
                name: "alice99".to_string(),
                real_name: self.real_name.clone(),
            })
        }

        async fn channel_info(&self, _channel_id: &str) -> Result<ChannelInfo> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(ChannelInfo {
                name: "general".to_string(),
            })
        }

        async fn post_message(&self, message: &OutgoingMessage) -> Result<String> {
            self.posts.lock().unwrap().push(message.clone());
            if let Some(needle) = &self.fail_posts_containing {
                if message.text.contains(needle.as_str()) {
                    bail!("ratelimited");
                }
            }
            Ok("1700000000.000100".to_string())
        }
    }

    /// Collects formatted log output while the returned guard is alive.
    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        (capture, tracing::subscriber::set_default(subscriber))
    }

    fn forwarder(api: Arc<FakeSlack>) -> Forwarder {
        Forwarder::new(
            api,
            RelayConfig {
                source_channel_id: SOURCE.to_string(),
                target_channel_id: TARGET.to_string(),
            },
        )
    }

    fn message(channel: &str, text: &str) -> IncomingMessage {
        IncomingMessage {
            channel_id: channel.to_string(),
            user_id: Some("U1".to_string()),
            text: Some(text.to_string()),
            ts: Some("1699999999.000001".to_string()),
            ..Default::default()
        }
    }

    fn file(name: &str, filetype: &str) -> FileAttachment {
        FileAttachment {
            name: name.to_string(),
            filetype: filetype.to_string(),
            permalink: format!("https://example.slack.com/files/U1/F1/{name}"),
        }
    }

    #[test]
    fn test_format_message() {
        assert_eq!(
            format_message("general", "Alice", "hello"),
            "*Message from #general:*\n*Alice:* hello"
        );
    }

    #[test]
    fn test_format_file() {
        let f = FileAttachment {
            name: "report.pdf".into(),
            filetype: "pdf".into(),
            permalink: "https://x.slack.com/files/F1".into(),
        };
        assert_eq!(
            format_file("general", "Alice", &f),
            "*File shared in #general by Alice:*\n📎 *report.pdf* (pdf)\nhttps://x.slack.com/files/F1"
        );
    }

    #[tokio::test]
    async fn test_other_channel_is_ignored() {
        let api = Arc::new(FakeSlack::new());
        forwarder(api.clone())
            .handle(message("C0ELSEWHERE", "hello"))
            .await;

        assert_eq!(api.lookups.load(Ordering::SeqCst), 0);
        assert!(api.posts().is_empty());
    }

    #[tokio::test]
    async fn test_bot_messages_are_ignored() {
        let api = Arc::new(FakeSlack::new());
        let fwd = forwarder(api.clone());

        let mut with_bot_id = message(SOURCE, "beep");
        with_bot_id.bot_id = Some("B1".to_string());
        fwd.handle(with_bot_id).await;

        let mut bot_subtype = message(SOURCE, "beep");
        bot_subtype.subtype = Some("bot_message".to_string());
        fwd.handle(bot_subtype).await;

        let mut elsewhere = message("C0ELSEWHERE", "beep");
        elsewhere.bot_id = Some("B1".to_string());
        fwd.handle(elsewhere).await;

        assert_eq!(api.lookups.load(Ordering::SeqCst), 0);
        assert!(api.posts().is_empty());
    }

    #[tokio::test]
    async fn test_relays_text_without_previews() {
        let api = Arc::new(FakeSlack::new());
        forwarder(api.clone()).handle(message(SOURCE, "hello")).await;

        let posts = api.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].channel, TARGET);
        assert_eq!(posts[0].text, "*Message from #general:*\n*Alice:* hello");
        assert_eq!(posts[0].unfurl_links, Some(false));
        assert_eq!(posts[0].unfurl_media, Some(false));
    }

    #[tokio::test]
    async fn test_author_falls_back_to_handle() {
        let mut fake = FakeSlack::new();
        fake.real_name = None;
        let api = Arc::new(fake);
        forwarder(api.clone()).handle(message(SOURCE, "hello")).await;

        assert_eq!(
            api.posts()[0].text,
            "*Message from #general:*\n*alice99:* hello"
        );
    }

    #[tokio::test]
    async fn test_files_posted_with_link_previews() {
        let api = Arc::new(FakeSlack::new());
        let mut msg = message(SOURCE, "see attached");
        msg.subtype = Some("file_share".to_string());
        msg.files = vec![file("a.png", "png"), file("b.pdf", "pdf")];
        forwarder(api.clone()).handle(msg).await;

        let posts = api.posts();
        assert_eq!(posts.len(), 3);
        assert_eq!(
            posts[0].text,
            "*Message from #general:*\n*Alice:* see attached"
        );

        let file_posts = &posts[1..];
        for post in file_posts {
            assert_eq!(post.channel, TARGET);
            assert_eq!(post.unfurl_links, Some(true));
            assert_eq!(post.unfurl_media, None);
        }
        assert_eq!(
            file_posts[0].text,
            "*File shared in #general by Alice:*\n📎 *a.png* (png)\nhttps://example.slack.com/files/U1/F1/a.png"
        );
        assert_eq!(
            file_posts[1].text,
            "*File shared in #general by Alice:*\n📎 *b.pdf* (pdf)\nhttps://example.slack.com/files/U1/F1/b.pdf"
        );

        // One user lookup and one channel lookup for the whole event.
        assert_eq!(api.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_text_post_is_logged_and_files_still_relayed() {
        let (logs, _guard) = capture_logs();
        let mut fake = FakeSlack::new();
        fake.fail_posts_containing = Some("Message from".to_string());
        let api = Arc::new(fake);
        let mut msg = message(SOURCE, "hello");
        msg.files = vec![file("a.png", "png")];

        forwarder(api.clone()).handle(msg).await;

        let posts = api.posts();
        assert_eq!(posts.len(), 2);
        assert!(posts[1].text.contains("a.png"));

        let logs = logs.contents();
        assert!(logs.contains("ERROR"));
        assert!(logs.contains("Error forwarding message: ratelimited"));
        assert!(logs.contains("File(s) forwarded successfully: 1/1"));
    }

    #[tokio::test]
    async fn test_failed_file_post_is_logged_and_rest_continue() {
        let (logs, _guard) = capture_logs();
        let mut fake = FakeSlack::new();
        fake.fail_posts_containing = Some("a.png".to_string());
        let api = Arc::new(fake);
        let mut msg = message(SOURCE, "hello");
        msg.files = vec![file("a.png", "png"), file("b.pdf", "pdf")];

        forwarder(api.clone()).handle(msg).await;

        assert_eq!(api.posts().len(), 3);

        let logs = logs.contents();
        assert!(logs.contains("Error forwarding file 'a.png': ratelimited"));
        assert!(logs.contains("File(s) forwarded successfully: 1/2"));
    }

    #[tokio::test]
    async fn test_lookup_failure_posts_nothing() {
        let mut fake = FakeSlack::new();
        fake.fail_lookup = true;
        let api = Arc::new(fake);
        let mut msg = message(SOURCE, "hello");
        msg.files = vec![file("a.png", "png")];

        forwarder(api.clone()).handle(msg).await;

        assert!(api.posts().is_empty());
    }

    #[tokio::test]
    async fn test_missing_author_posts_nothing() {
        let api = Arc::new(FakeSlack::new());
        let mut msg = message(SOURCE, "edited");
        msg.user_id = None;
        msg.subtype = Some("message_changed".to_string());

        forwarder(api.clone()).handle(msg).await;

        assert_eq!(api.lookups.load(Ordering::SeqCst), 0);
        assert!(api.posts().is_empty());
    }

    #[tokio::test]
    async fn test_missing_text_formats_empty() {
        let api = Arc::new(FakeSlack::new());
        let mut msg = message(SOURCE, "");
        msg.text = None;

        forwarder(api.clone()).handle(msg).await;

        assert_eq!(api.posts()[0].text, "*Message from #general:*\n*Alice:* ");
    }
}
