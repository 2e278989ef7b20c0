//! Core data model shared by the queue, trace store, session store,
//! registry, and schedule store. These types mirror the persisted schema
//! in the database layer field for field; `rusqlite` row mapping lives
//! next to each store rather than here.

use serde::{Deserialize, Serialize};

/// A unit of work in the durable task queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub repo: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub task_type: Option<TaskType>,
    pub priority: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CreateProject,
    Discuss,
    Cron,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::CreateProject => "create-project",
            TaskType::Discuss => "discuss",
            TaskType::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create-project" => Some(TaskType::CreateProject),
            "discuss" => Some(TaskType::Discuss),
            "cron" => Some(TaskType::Cron),
            _ => None,
        }
    }
}

/// An append-only structured event tied to a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: i64,
    pub task_id: String,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub kind: TraceKind,
    pub summary: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Status,
    Tool,
    Lifecycle,
    Output,
    Error,
}

impl TraceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceKind::Status => "status",
            TraceKind::Tool => "tool",
            TraceKind::Lifecycle => "lifecycle",
            TraceKind::Output => "output",
            TraceKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "status" => Some(TraceKind::Status),
            "tool" => Some(TraceKind::Tool),
            "lifecycle" => Some(TraceKind::Lifecycle),
            "output" => Some(TraceKind::Output),
            "error" => Some(TraceKind::Error),
            _ => None,
        }
    }
}

/// A single conversational turn attached to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user_id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ChatRole::User),
            "assistant" => Some(ChatRole::Assistant),
            _ => None,
        }
    }
}

/// A user's current conversation mode. Absence means `Strict`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Strict,
    Assistant,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Strict => "strict",
            Mode::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strict" => Some(Mode::Strict),
            "assistant" => Some(Mode::Assistant),
            _ => None,
        }
    }
}

/// Canonical repository metadata held by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub name: String,
    pub url: String,
    pub owner: Option<String>,
    pub default_branch: String,
    pub source: RepoSource,
    pub excluded: bool,
    pub last_synced_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RepoSource {
    Config,
    ExternalSync,
    Manual,
}

impl RepoSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RepoSource::Config => "config",
            RepoSource::ExternalSync => "external-sync",
            RepoSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "config" => Some(RepoSource::Config),
            "external-sync" => Some(RepoSource::ExternalSync),
            "manual" => Some(RepoSource::Manual),
            _ => None,
        }
    }
}

/// A user-created recurring trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub user_id: String,
    pub repo: Option<String>,
    pub prompt: String,
    pub schedule: String,
    pub description: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
