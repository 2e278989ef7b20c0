//! Interfaces the core consumes from chat/event transports. No concrete
//! platform implementation lives here: Slack, Discord, Telegram,
//! WhatsApp, and a CLI REPL are all external collaborators that
//! implement these traits, with the sole exception of the GitHub webhook
//! endpoint in [`crate::api`], which the spec pins down precisely enough
//! to implement inside the core.

use async_trait::async_trait;

/// A chat message as seen by the dispatcher, abstracted over platform.
#[async_trait]
pub trait IncomingMessage: Send + Sync {
    fn user_id(&self) -> &str;
    fn platform(&self) -> &str;
    fn text(&self) -> &str;

    async fn reply(&self, text: &str) -> anyhow::Result<()>;
    async fn update_status(&self, text: &str) -> anyhow::Result<()>;
}

/// The source of an out-of-chat event: a repo comment thread, or a
/// generic inbound HTTP request.
#[derive(Debug, Clone)]
pub enum EventSource {
    Comment {
        kind: CommentKind,
        repo: String,
        number: u64,
    },
    Http {
        request_id: String,
        repo: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentKind {
    Issue,
    PullRequest,
}

pub struct IncomingEvent {
    pub event_id: String,
    pub user_id: String,
    pub platform: String,
    pub source: EventSource,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct AdapterStatus {
    pub running: bool,
    pub detail: Option<String>,
}

/// A running chat adapter. `start`/`stop` bound its lifecycle; inbound
/// messages are handed to the dispatcher via whatever channel `start`'s
/// caller wires up (out of scope for this trait).
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    async fn status(&self) -> AdapterStatus;
}

/// A running event adapter (e.g. a GitHub App listening for comments).
#[async_trait]
pub trait EventAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    async fn respond_to_event(&self, event_id: &str, text: &str) -> anyhow::Result<()>;
    async fn status(&self) -> AdapterStatus;
}
