//! Delivery-side concerns: splitting a long answer into platform-sized
//! chunks, and a debounced status updater that must be explicitly
//! cancelled before the final reply goes out.

use crate::constants::{platform_limits, STATUS_DEBOUNCE_MS};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub fn limit_for(platform: &str) -> usize {
    match platform {
        "slack" => platform_limits::SLACK,
        "discord" => platform_limits::DISCORD,
        "telegram" => platform_limits::TELEGRAM,
        "whatsapp" => platform_limits::WHATSAPP,
        "cli" => platform_limits::CLI,
        _ => platform_limits::UNKNOWN,
    }
}

/// Greedily pack `text` into chunks no longer than `limit`, preferring to
/// break at the last newline within the chunk's back half so messages
/// don't split mid-paragraph when a cleaner break is nearby.
pub fn split_and_reply(text: &str, platform: &str) -> Vec<String> {
    let limit = limit_for(platform);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= limit {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        let window_end = start + limit;
        let back_half_start = start + limit / 2;
        let mut split_at = window_end;

        for i in (back_half_start..window_end).rev() {
            if chars[i] == '\n' {
                split_at = i + 1;
                break;
            }
        }

        chunks.push(chars[start..split_at].iter().collect());
        start = split_at;
    }

    chunks
}

/// Trailing-edge debounced status updater. Each `invoke` resets the
/// timer; the update is only sent once no new `invoke` arrives within
/// the debounce window. Must be `cancel`led before the final reply, or a
/// stale status can land after the answer.
pub struct StatusUpdater<F>
where
    F: Fn(String) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
{
    sender: Arc<F>,
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<F> StatusUpdater<F>
where
    F: Fn(String) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
{
    pub fn new(sender: F) -> Self {
        Self {
            sender: Arc::new(sender),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedule `text` to be sent after the debounce window, cancelling
    /// any previously scheduled send.
    pub async fn invoke(&self, text: String) {
        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.take() {
            handle.abort();
        }

        let sender = Arc::clone(&self.sender);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(STATUS_DEBOUNCE_MS)).await;
            sender(text).await;
        });
        *pending = Some(handle);
    }

    /// Fire any pending update immediately instead of waiting out the
    /// debounce window.
    pub async fn flush(&self, text: String) {
        self.cancel().await;
        (self.sender)(text).await;
    }

    /// Cancel any pending send without firing it. Call this right before
    /// the final reply.
    pub async fn cancel(&self) {
        if let Some(handle) = self.pending.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = split_and_reply("hello", "discord");
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn cli_has_no_limit() {
        let long = "x".repeat(10_000);
        let chunks = split_and_reply(&long, "cli");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn long_text_splits_at_newline_in_back_half() {
        let mut text = "a".repeat(1_900);
        text.push('\n');
        text.push_str(&"b".repeat(1_900));
        let chunks = split_and_reply(&text, "discord");
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().map(|c| c.chars().count()).all(|n| n <= limit_for("discord")));
    }

    #[tokio::test]
    async fn cancel_prevents_pending_send() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = Arc::clone(&sent);
        let updater = StatusUpdater::new(move |text: String| {
            let sent = Arc::clone(&sent_clone);
            Box::pin(async move {
                sent.lock().await.push(text);
            }) as futures::future::BoxFuture<'static, ()>
        });

        updater.invoke("working...".to_string()).await;
        updater.cancel().await;
        tokio::time::sleep(std::time::Duration::from_millis(STATUS_DEBOUNCE_MS + 50)).await;

        assert!(sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn flush_sends_immediately() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = Arc::clone(&sent);
        let updater = StatusUpdater::new(move |text: String| {
            let sent = Arc::clone(&sent_clone);
            Box::pin(async move {
                sent.lock().await.push(text);
            }) as futures::future::BoxFuture<'static, ()>
        });

        updater.flush("done".to_string()).await;
        assert_eq!(sent.lock().await.as_slice(), ["done".to_string()]);
    }
}
