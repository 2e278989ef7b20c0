//! Top-level request handling: turns a classified, resolved message into
//! session writes, schedule/registry mutations, or an enqueued task.
//! `MessageHandler` covers chat; `EventHandler` mirrors it for webhook
//! and comment-thread events, differing only in how it biases repo
//! selection and where completion gets routed back to.

use crate::adapters::{EventSource, IncomingEvent, IncomingMessage};
use crate::config::Config;
use crate::constants::RESOLVER_CONTEXT_TURNS;
use crate::models::{ChatRole, Mode, TaskType};
use crate::queue::TaskQueue;
use crate::registry::RepoRegistry;
use crate::resolver::{RepoResolver, Resolution};
use crate::router::{self, ParsedMessage};
use crate::schedule::{self, ScheduleDrafter, ScheduleStore};
use crate::session::SessionStore;
use crate::worker::TaskCanceller;
use std::sync::Arc;

pub struct HandlerContext {
    pub config: Arc<tokio::sync::RwLock<Config>>,
    pub queue: TaskQueue,
    pub registry: RepoRegistry,
    pub session: SessionStore,
    pub schedules: ScheduleStore,
    pub resolver: RepoResolver,
    pub schedule_drafter: Arc<dyn ScheduleDrafter>,
    pub canceller: Arc<dyn TaskCanceller>,
}

/// What a handler decided to do with a message, useful both for the
/// reply pipeline and for tests asserting on behavior without a live
/// chat adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    InlineReply(String),
    Enqueued { task_id: String },
    Refused(String),
}

pub struct MessageHandler {
    ctx: HandlerContext,
}

impl MessageHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, msg: &dyn IncomingMessage) -> HandlerOutcome {
        let user_id = msg.user_id().to_string();
        self.ctx
            .session
            .append(user_id.clone(), ChatRole::User, msg.text().to_string())
            .await
            .ok();

        let parsed = router::parse(msg.text());
        let outcome = self.route(&user_id, parsed.message, parsed.priority, parsed.raw_text).await;

        if let HandlerOutcome::InlineReply(ref text) = outcome {
            self.ctx
                .session
                .append(user_id, ChatRole::Assistant, text.clone())
                .await
                .ok();
        }
        outcome
    }

    async fn route(
        &self,
        user_id: &str,
        message: ParsedMessage,
        priority: i64,
        raw_text: String,
    ) -> HandlerOutcome {
        match message {
            ParsedMessage::Help => HandlerOutcome::InlineReply(HELP_TEXT.to_string()),
            ParsedMessage::Status => self.status_reply(user_id).await,
            ParsedMessage::History => self.history_reply(user_id).await,
            ParsedMessage::Clear => {
                let _ = self.ctx.session.clear(user_id.to_string()).await;
                HandlerOutcome::InlineReply("History and mode cleared.".to_string())
            }
            ParsedMessage::Tasks => self.status_reply(user_id).await,
            ParsedMessage::Cancel { id_prefix } => self.cancel_by_prefix(user_id, &id_prefix).await,
            ParsedMessage::Trace { task_id } => HandlerOutcome::InlineReply(match task_id {
                Some(id) => format!("Trace for {id} is available via the trace endpoint."),
                None => "Specify a task id to view its trace.".to_string(),
            }),
            ParsedMessage::SetMode { assistant } => {
                let mode = if assistant { Mode::Assistant } else { Mode::Strict };
                let _ = self.ctx.session.set_mode(user_id.to_string(), mode).await;
                HandlerOutcome::InlineReply(format!("Mode set to {}.", mode.as_str()))
            }
            ParsedMessage::StatusInquiry => self.status_reply(user_id).await,
            ParsedMessage::ListSchedules => self.list_schedules_reply(user_id).await,
            ParsedMessage::RemoveSchedule { id } => {
                match self.ctx.schedules.remove(id, user_id.to_string()).await {
                    Ok(()) => HandlerOutcome::InlineReply(format!("Schedule #{id} removed.")),
                    Err(e) => HandlerOutcome::Refused(e.to_string()),
                }
            }
            ParsedMessage::ScheduleCreate { text, repo_hint } => {
                self.create_schedule(user_id, text, repo_hint).await
            }
            ParsedMessage::InitRepo { name, git_url, branch } => {
                self.init_repo(user_id, name, git_url, branch).await
            }
            ParsedMessage::Discuss { topic } => {
                self.enqueue_with_type(user_id, None, topic, TaskType::Discuss, priority).await
            }
            ParsedMessage::CreateProject { name, template } => {
                let prompt = match template {
                    Some(t) => format!("Create a new project named {name} using template {t}."),
                    None => format!("Create a new project named {name}."),
                };
                self.enqueue_with_type(user_id, Some(name), prompt, TaskType::CreateProject, priority)
                    .await
            }
            ParsedMessage::ReviewPr { repo_hint, pr_number } => {
                self.enqueue_task_class(
                    user_id,
                    repo_hint,
                    format!("Review PR #{pr_number}."),
                    priority,
                )
                .await
            }
            ParsedMessage::FixIssue { repo_hint, issue_number } => {
                self.enqueue_task_class(
                    user_id,
                    repo_hint,
                    format!("Fix issue #{issue_number}."),
                    priority,
                )
                .await
            }
            ParsedMessage::Simplify { repo_hint, path } => {
                self.enqueue_task_class(user_id, repo_hint, format!("Simplify {path}."), priority)
                    .await
            }
            ParsedMessage::Validate { repo_hint } => {
                self.enqueue_task_class(user_id, repo_hint, "Validate the repository.".to_string(), priority)
                    .await
            }
            ParsedMessage::FreeForm { repo_hint } => {
                self.enqueue_task_class(user_id, repo_hint, raw_text, priority).await
            }
        }
    }

    async fn enqueue_task_class(
        &self,
        user_id: &str,
        repo_hint: Option<String>,
        prompt: String,
        priority: i64,
    ) -> HandlerOutcome {
        let config = self.ctx.config.read().await;
        let all_repo_names = self.ctx.registry.names().await.unwrap_or_default();
        let user_repos = config.user_repos(user_id, &all_repo_names);
        drop(config);

        if user_repos.is_empty() {
            // Degrade to discuss so the conversation still works for
            // users without any repo grants.
            return self
                .enqueue_with_type(user_id, None, prompt, TaskType::Discuss, priority)
                .await;
        }

        let recent = self
            .ctx
            .session
            .recent(user_id.to_string(), RESOLVER_CONTEXT_TURNS)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.content)
            .collect::<Vec<_>>();
        let last_task_repo = self
            .ctx
            .queue
            .list_by_user(user_id.to_string())
            .await
            .unwrap_or_default()
            .into_iter()
            .find(|t| t.status.is_terminal())
            .map(|t| t.repo);

        let resolution = self
            .ctx
            .resolver
            .resolve(
                repo_hint.as_deref(),
                &user_repos,
                &recent,
                last_task_repo.as_deref(),
                &prompt,
            )
            .await;

        match resolution {
            Resolution::Repo(repo) => self.enqueue_plain(user_id, repo, prompt, priority).await,
            Resolution::None => {
                self.enqueue_with_type(user_id, None, prompt, TaskType::Discuss, priority)
                    .await
            }
            Resolution::Unknown { candidates } => HandlerOutcome::InlineReply(format!(
                "Which repository did you mean? Candidates: {}",
                candidates.join(", ")
            )),
            Resolution::NoRepos => {
                HandlerOutcome::Refused("You don't have access to any repositories yet.".to_string())
            }
        }
    }

    /// Enqueue a task against a concretely resolved repo, with no
    /// `taskType` set (the default pipeline: clone, worktree, runner).
    async fn enqueue_plain(
        &self,
        user_id: &str,
        repo: String,
        prompt: String,
        priority: i64,
    ) -> HandlerOutcome {
        match self
            .ctx
            .queue
            .enqueue(user_id.to_string(), repo, prompt, None, Some(priority))
            .await
        {
            Ok(task_id) => HandlerOutcome::Enqueued { task_id },
            Err(e) => HandlerOutcome::Refused(e.to_string()),
        }
    }

    async fn enqueue_with_type(
        &self,
        user_id: &str,
        repo: Option<String>,
        prompt: String,
        task_type: TaskType,
        priority: i64,
    ) -> HandlerOutcome {
        let repo = repo.unwrap_or_else(|| "__none__".to_string());
        match self
            .ctx
            .queue
            .enqueue(user_id.to_string(), repo, prompt, Some(task_type), Some(priority))
            .await
        {
            Ok(task_id) => HandlerOutcome::Enqueued { task_id },
            Err(e) => HandlerOutcome::Refused(e.to_string()),
        }
    }

    async fn status_reply(&self, user_id: &str) -> HandlerOutcome {
        match self.ctx.queue.list_by_user(user_id.to_string()).await {
            Ok(tasks) => {
                let active = tasks.iter().filter(|t| !t.status.is_terminal()).count();
                HandlerOutcome::InlineReply(format!("{active} active task(s), {} total.", tasks.len()))
            }
            Err(e) => HandlerOutcome::Refused(e.to_string()),
        }
    }

    async fn history_reply(&self, user_id: &str) -> HandlerOutcome {
        match self.ctx.session.history(user_id.to_string()).await {
            Ok(history) => HandlerOutcome::InlineReply(format!("{} message(s) in history.", history.len())),
            Err(e) => HandlerOutcome::Refused(e.to_string()),
        }
    }

    async fn list_schedules_reply(&self, user_id: &str) -> HandlerOutcome {
        match self.ctx.schedules.list_for_user(user_id.to_string()).await {
            Ok(schedules) if schedules.is_empty() => {
                HandlerOutcome::InlineReply("No schedules set.".to_string())
            }
            Ok(schedules) => {
                let lines: Vec<String> = schedules
                    .iter()
                    .map(|s| format!("#{}: {} ({})", s.id, s.schedule, s.description))
                    .collect();
                HandlerOutcome::InlineReply(lines.join("\n"))
            }
            Err(e) => HandlerOutcome::Refused(e.to_string()),
        }
    }

    /// Drive the natural-language-to-cron side conversation: ask the
    /// configured drafter for a strict JSON schedule, validate it, and
    /// persist it. A single turn, no back-and-forth with the user.
    async fn create_schedule(
        &self,
        user_id: &str,
        text: String,
        repo_hint: Option<String>,
    ) -> HandlerOutcome {
        let draft_prompt = schedule::drafting_prompt(&text, repo_hint.as_deref());
        let raw = match self.ctx.schedule_drafter.draft(&draft_prompt, repo_hint.as_deref()).await {
            Ok(raw) => raw,
            Err(e) => return HandlerOutcome::Refused(e.to_string()),
        };

        let (repo, prompt, cron_expr, description) = match schedule::parse_draft(&raw) {
            Ok(parsed) => parsed,
            Err(e) => return HandlerOutcome::Refused(e.to_string()),
        };
        let repo = repo.or(repo_hint);

        match self
            .ctx
            .schedules
            .create(user_id.to_string(), repo, prompt, cron_expr.clone(), description)
            .await
        {
            Ok(id) => HandlerOutcome::InlineReply(format!("Schedule #{id} created: {cron_expr}")),
            Err(e) => HandlerOutcome::Refused(e.to_string()),
        }
    }

    async fn cancel_by_prefix(&self, user_id: &str, prefix: &str) -> HandlerOutcome {
        let tasks = self.ctx.queue.list_by_user(user_id.to_string()).await.unwrap_or_default();
        match tasks.into_iter().find(|t| t.id.starts_with(prefix)) {
            Some(task) => match self.ctx.canceller.cancel(&task.id).await {
                Ok(true) => HandlerOutcome::InlineReply(format!("Cancelled {}.", task.id)),
                Ok(false) => {
                    HandlerOutcome::Refused(format!("Task {} has already finished.", task.id))
                }
                Err(e) => HandlerOutcome::Refused(e.to_string()),
            },
            None => HandlerOutcome::Refused(format!("No task found matching '{prefix}'.")),
        }
    }

    async fn init_repo(
        &self,
        user_id: &str,
        name: String,
        git_url: String,
        branch: Option<String>,
    ) -> HandlerOutcome {
        use crate::config::{RepoEntry, UserEntry};

        let mut config = self.ctx.config.write().await;
        let entry = RepoEntry {
            url: git_url,
            default_branch: branch.unwrap_or_else(|| "main".to_string()),
            runner: None,
            excluded: false,
        };
        if let Err(e) = config.add_repo(name.clone(), entry.clone()) {
            return HandlerOutcome::Refused(e.to_string());
        }

        let mut user = config
            .users
            .get(user_id)
            .cloned()
            .unwrap_or(UserEntry { name: user_id.to_string(), repos: Vec::new() });
        if !user.repos.iter().any(|r| r == &name) {
            user.repos.push(name.clone());
        }
        if let Err(e) = config.add_user(user_id.to_string(), user) {
            return HandlerOutcome::Refused(e.to_string());
        }
        drop(config);

        let repo = crate::models::Repo {
            name: name.clone(),
            url: entry.url,
            owner: None,
            default_branch: entry.default_branch,
            source: crate::models::RepoSource::Manual,
            excluded: false,
            last_synced_at: None,
        };
        if let Err(e) = self.ctx.registry.upsert(repo).await {
            return HandlerOutcome::Refused(e.to_string());
        }

        HandlerOutcome::InlineReply(format!("Repository {name} is set up."))
    }
}

const HELP_TEXT: &str = "Commands: help, status, history, clear, tasks, cancel <id>, trace [<id>], mode assistant|strict, schedule management, or just describe what you need done.";

/// `EventHandler` mirrors `MessageHandler` for events (issue/PR comments,
/// generic webhooks), biasing repo resolution using the event's source
/// metadata instead of a router-extracted hint.
pub struct EventHandler {
    ctx: HandlerContext,
}

impl EventHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, event: &IncomingEvent) -> HandlerOutcome {
        let repo_hint = match &event.source {
            EventSource::Comment { repo, .. } => Some(repo.clone()),
            EventSource::Http { repo, .. } => repo.clone(),
        };

        let parsed = router::parse(&event.text);
        let prompt = match parsed.message {
            ParsedMessage::FreeForm { .. } => event.text.clone(),
            _ => event.text.clone(),
        };

        let config = self.ctx.config.read().await;
        let all_repo_names = self.ctx.registry.names().await.unwrap_or_default();
        let user_repos = config.user_repos(&event.user_id, &all_repo_names);
        drop(config);

        let resolution = self
            .ctx
            .resolver
            .resolve(repo_hint.as_deref(), &user_repos, &[], None, &prompt)
            .await;

        match resolution {
            Resolution::Repo(repo) => match self
                .ctx
                .queue
                .enqueue(event.user_id.clone(), repo, prompt, None, Some(parsed.priority))
                .await
            {
                Ok(task_id) => HandlerOutcome::Enqueued { task_id },
                Err(e) => HandlerOutcome::Refused(e.to_string()),
            },
            Resolution::None => HandlerOutcome::InlineReply("No repository context for this event.".to_string()),
            Resolution::Unknown { candidates } => {
                HandlerOutcome::InlineReply(format!("Ambiguous repository: {}", candidates.join(", ")))
            }
            Resolution::NoRepos => HandlerOutcome::Refused("No repositories available for this event.".to_string()),
        }
    }
}
