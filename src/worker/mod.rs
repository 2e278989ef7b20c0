//! Bounded-concurrency dispatch loop. One `Worker` owns the queue, the
//! repo registry, the workspace manager, the trace store, and the set of
//! available runners; everything else (reply delivery) is reached
//! through a small injected notifier trait so the worker never depends
//! on a concrete chat adapter.

use crate::constants::{
    CRON_MIN_MAX_TURNS, DISCUSS_MAX_TURNS, MAX_CONCURRENT_TASKS, WORKER_POLL_INTERVAL_MS,
};
use crate::error::{DispatchError, Result};
use crate::models::{Task, TaskType, TraceKind};
use crate::queue::TaskQueue;
use crate::registry::RepoRegistry;
use crate::runner::{Runner, RunOptions, RunResult, StatusEvent};
use crate::trace::TraceStore;
use crate::workspace::WorkspaceManager;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Notified when a task finishes, so the reply pipeline can reach the
/// originating chat surface without the worker knowing what that is.
#[async_trait]
pub trait TaskNotifier: Send + Sync {
    async fn notify(&self, task_id: &str, success: bool, output: &str);
    async fn notify_status(&self, task_id: &str, event: StatusEvent);
}

/// Lets handlers request cancellation without depending on the concrete
/// `Worker` (and its queue/live-process internals) directly — mirrors
/// `TaskNotifier`'s injection idiom. Implementations must abort any live
/// subprocess *before* transitioning the task in the queue, per the
/// spec's cancel ordering.
#[async_trait]
pub trait TaskCanceller: Send + Sync {
    async fn cancel(&self, task_id: &str) -> Result<bool>;
}

pub struct Worker {
    queue: TaskQueue,
    registry: RepoRegistry,
    workspace: WorkspaceManager,
    trace: TraceStore,
    runners: HashMap<String, Arc<dyn Runner>>,
    default_runner: String,
    repos_dir: std::path::PathBuf,
    mcp_config: Option<serde_json::Value>,
    configured_max_turns: u32,

    active_count: Arc<AtomicUsize>,
    live_processes: Arc<Mutex<HashMap<String, CancellationToken>>>,
    pending_replies: Arc<Mutex<HashMap<String, Arc<dyn TaskNotifier>>>>,
}

impl Worker {
    pub fn new(
        queue: TaskQueue,
        registry: RepoRegistry,
        workspace: WorkspaceManager,
        trace: TraceStore,
        runners: HashMap<String, Arc<dyn Runner>>,
        default_runner: String,
        repos_dir: std::path::PathBuf,
        mcp_config: Option<serde_json::Value>,
        configured_max_turns: u32,
    ) -> Self {
        Self {
            queue,
            registry,
            workspace,
            trace,
            runners,
            default_runner,
            repos_dir,
            mcp_config,
            configured_max_turns,
            active_count: Arc::new(AtomicUsize::new(0)),
            live_processes: Arc::new(Mutex::new(HashMap::new())),
            pending_replies: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn register_pending_reply(&self, task_id: String, notifier: Arc<dyn TaskNotifier>) {
        self.pending_replies.lock().await.insert(task_id, notifier);
    }

    /// Abort a live subprocess (if any), then mark the task cancelled.
    /// A `pending` task has no subprocess to signal and is just marked
    /// cancelled; an already-terminal task is left untouched (the queue's
    /// `cancel` is conditional), which this reports back as `false`.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        if let Some(token) = self.live_processes.lock().await.get(task_id) {
            token.cancel();
        }
        self.queue.cancel(task_id.to_string()).await
    }

    /// Run forever: dequeue while under the concurrency cap, otherwise
    /// idle-sleep. Each dequeued task runs fire-and-forget on its own
    /// tokio task so unrelated repos never block each other.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.active_count.load(Ordering::SeqCst) >= MAX_CONCURRENT_TASKS {
                tokio::time::sleep(std::time::Duration::from_millis(WORKER_POLL_INTERVAL_MS)).await;
                continue;
            }

            match self.queue.dequeue().await {
                Ok(Some(task)) => {
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.run_task(task).await;
                        this.active_count.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Ok(None) => {
                    tokio::time::sleep(std::time::Duration::from_millis(WORKER_POLL_INTERVAL_MS)).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "dequeue failed");
                    tokio::time::sleep(std::time::Duration::from_millis(WORKER_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }

    async fn run_task(&self, task: Task) {
        let started = std::time::Instant::now();
        let cancel = CancellationToken::new();
        self.live_processes
            .lock()
            .await
            .insert(task.id.clone(), cancel.clone());

        let result = self.execute(&task, cancel).await;

        let (success, output) = match result {
            Ok(r) => (r.success, r.output),
            Err(e) => (false, e.to_string()),
        };

        let finish = if success {
            self.queue.complete(task.id.clone(), output.clone()).await
        } else {
            self.queue.fail(task.id.clone(), output.clone()).await
        };
        if let Err(e) = finish {
            tracing::error!(task_id = %task.id, error = %e, "failed to record terminal task status");
        }

        let _ = self
            .trace
            .append(
                task.id.clone(),
                TraceKind::Lifecycle,
                format!("finished in {:.1}s", started.elapsed().as_secs_f64()),
                None,
            )
            .await;
        if !success {
            let _ = self
                .trace
                .append(task.id.clone(), TraceKind::Error, output.clone(), None)
                .await;
        }

        if let Some(notifier) = self.pending_replies.lock().await.remove(&task.id) {
            notifier.notify(&task.id, success, &output).await;
        }

        self.cleanup_non_skipped_workflow(&task).await;
        self.live_processes.lock().await.remove(&task.id);
    }

    async fn cleanup_non_skipped_workflow(&self, task: &Task) {
        if !self.is_skipped_workflow(task) {
            if let Ok(Some(repo)) = self.registry.get(task.repo.clone()).await {
                self.workspace.remove_worktree(&repo.name, &task.id).await;
            }
        }
    }

    fn is_skipped_workflow(&self, task: &Task) -> bool {
        matches!(task.task_type, Some(TaskType::Discuss))
    }

    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<RunResult> {
        let work_dir = self.prepare_workspace(task).await?;
        let max_turns = self.max_turns_for(task);

        let mcp_config_path = match &self.mcp_config {
            Some(cfg) => Some(self.write_mcp_config(task, cfg).await?),
            None => None,
        };

        let runner_name = self.default_runner.clone();
        let runner = self
            .runners
            .get(&runner_name)
            .ok_or_else(|| DispatchError::RunnerFail(format!("no runner registered: {runner_name}")))?
            .clone();

        let opts = RunOptions {
            max_turns,
            mcp_config_path: mcp_config_path.clone(),
            model: None,
        };

        let task_id = task.id.clone();
        let trace = self.trace.clone();
        let on_status: Box<dyn Fn(StatusEvent) + Send + Sync> = Box::new(move |event| {
            let trace = trace.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                let (kind, summary) = match event {
                    StatusEvent::Text { text } => (TraceKind::Output, text),
                    StatusEvent::Tool { tool, input } => (TraceKind::Tool, format!("{tool}: {input}")),
                };
                let _ = trace.append(task_id, kind, summary, None).await;
            });
        });

        let result = runner.run(&task.prompt, &work_dir, &opts, cancel, on_status).await;

        if let Some(path) = mcp_config_path {
            let _ = tokio::fs::remove_file(path).await;
        }

        result
    }

    async fn prepare_workspace(&self, task: &Task) -> Result<std::path::PathBuf> {
        match task.task_type {
            Some(TaskType::Discuss) => Ok(self.repos_dir.clone()),
            Some(TaskType::CreateProject) => {
                let dir = self.repos_dir.join(&task.repo);
                tokio::fs::create_dir_all(&dir).await.map_err(DispatchError::Io)?;
                let marker = dir.join(".dispatcher-created");
                tokio::fs::write(&marker, b"").await.map_err(DispatchError::Io)?;
                Ok(dir)
            }
            _ => {
                let repo = self
                    .registry
                    .get(task.repo.clone())
                    .await?
                    .ok_or_else(|| DispatchError::UnknownRepo(task.repo.clone()))?;

                self.workspace.clone_if_needed(&repo.name, &repo.url).await?;
                self.workspace.pull(&repo.name, &repo.default_branch).await;
                self.workspace
                    .create_worktree(&repo.name, &task.id, &repo.default_branch)
                    .await
            }
        }
    }

    fn max_turns_for(&self, task: &Task) -> u32 {
        match task.task_type {
            Some(TaskType::Cron) => self.configured_max_turns.max(CRON_MIN_MAX_TURNS),
            Some(TaskType::Discuss) => DISCUSS_MAX_TURNS,
            _ => self.configured_max_turns,
        }
    }

    async fn write_mcp_config(&self, task: &Task, cfg: &serde_json::Value) -> Result<String> {
        let path = std::env::temp_dir().join(format!("dispatcher-mcp-{}.json", task.id));
        let body = serde_json::to_vec(cfg)?;
        tokio::fs::write(&path, body).await.map_err(DispatchError::Io)?;
        Ok(path.to_string_lossy().to_string())
    }
}

#[async_trait]
impl TaskCanceller for Worker {
    async fn cancel(&self, task_id: &str) -> Result<bool> {
        Worker::cancel(self, task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use tempfile::TempDir;

    struct EchoRunner;

    #[async_trait]
    impl Runner for EchoRunner {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn run(
            &self,
            prompt: &str,
            _work_dir: &std::path::Path,
            _opts: &RunOptions,
            _cancel: CancellationToken,
            on_status: Box<dyn Fn(StatusEvent) + Send + Sync>,
        ) -> Result<RunResult> {
            on_status(StatusEvent::Text { text: prompt.to_string() });
            Ok(RunResult {
                success: true,
                output: format!("echoed: {prompt}"),
            })
        }
    }

    struct RecordingNotifier {
        seen: Arc<Mutex<Vec<(String, bool, String)>>>,
    }

    #[async_trait]
    impl TaskNotifier for RecordingNotifier {
        async fn notify(&self, task_id: &str, success: bool, output: &str) {
            self.seen
                .lock()
                .await
                .push((task_id.to_string(), success, output.to_string()));
        }

        async fn notify_status(&self, _task_id: &str, _event: StatusEvent) {}
    }

    fn build_worker(dir: &TempDir) -> Arc<Worker> {
        let db_path = dir.path().join("db.sqlite");
        let queue = TaskQueue::new(db_path.clone()).unwrap();
        let registry = RepoRegistry::new(db_path.clone()).unwrap();
        let trace = TraceStore::new(db_path, true).unwrap();
        let workspace = WorkspaceManager::new(dir.path().join("repos"));

        let mut runners: HashMap<String, Arc<dyn Runner>> = HashMap::new();
        runners.insert("echo".to_string(), Arc::new(EchoRunner));

        Arc::new(Worker::new(
            queue,
            registry,
            workspace,
            trace,
            runners,
            "echo".to_string(),
            dir.path().join("repos"),
            None,
            20,
        ))
    }

    #[tokio::test]
    async fn discuss_task_runs_without_workspace_checkout() {
        let dir = TempDir::new().unwrap();
        let worker = build_worker(&dir);

        let id = worker
            .queue
            .enqueue(
                "u1".into(),
                "no-repo".into(),
                "let's brainstorm".into(),
                Some(TaskType::Discuss),
                None,
            )
            .await
            .unwrap();

        let task = worker.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(task.id, id);
        worker.run_task(task).await;

        let finished = worker.queue.get(id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert!(finished.result.unwrap().contains("brainstorm"));
    }

    #[tokio::test]
    async fn notifier_is_invoked_on_completion() {
        let dir = TempDir::new().unwrap();
        let worker = build_worker(&dir);

        let id = worker
            .queue
            .enqueue(
                "u1".into(),
                "no-repo".into(),
                "hello".into(),
                Some(TaskType::Discuss),
                None,
            )
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        worker
            .register_pending_reply(id.clone(), Arc::new(RecordingNotifier { seen: seen.clone() }))
            .await;

        let task = worker.queue.dequeue().await.unwrap().unwrap();
        worker.run_task(task).await;

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, id);
        assert!(seen[0].1);
    }
}
