//! Durable priority/FIFO task queue with per-repository mutual exclusion
//! enforced entirely at the SQL level: `dequeue` is one transaction that
//! picks the best pending row whose repo has no running sibling and
//! flips it to `running` in the same statement, so concurrent dequeues
//! never race each other onto the same repo.

use crate::db;
use crate::error::{DispatchError, Result};
use crate::models::{Task, TaskStatus, TaskType};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RepoMetrics {
    pub repo: String,
    pub avg_duration_secs: f64,
    pub count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub stats: QueueStats,
    pub throughput_last_hour: i64,
    pub throughput_last_24h: i64,
    pub error_rate: f64,
    pub per_repo: Vec<RepoMetrics>,
}

#[derive(Clone)]
pub struct TaskQueue {
    db_path: PathBuf,
}

impl TaskQueue {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let conn = db::open(&db_path)?;
        Self::migrate(&conn)?;
        Ok(Self { db_path })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                repo TEXT NOT NULL,
                prompt TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )",
            [],
        )?;
        db::add_column_if_missing(conn, "tasks", "task_type", "TEXT")?;
        db::add_column_if_missing(conn, "tasks", "priority", "INTEGER NOT NULL DEFAULT 0")?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_dequeue ON tasks(status, repo, priority, created_at)",
            [],
        )?;

        // Any row left `running` across a restart belongs to a worker that
        // no longer exists. There is no way it will ever complete.
        conn.execute(
            "UPDATE tasks SET status = 'failed', result = 'Interrupted — process restarted', completed_at = ?1
             WHERE status = 'running'",
            params![chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn enqueue(
        &self,
        user_id: String,
        repo: String,
        prompt: String,
        task_type: Option<TaskType>,
        priority: Option<i64>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let priority = priority.unwrap_or(0);
        let now = chrono::Utc::now();
        let path = self.db_path.clone();
        let task_id = id.clone();
        db::with_conn(path, move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, user_id, repo, prompt, status, result, task_type, priority, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', NULL, ?5, ?6, ?7, NULL)",
                params![
                    task_id,
                    user_id,
                    repo,
                    prompt,
                    task_type.map(|t| t.as_str()),
                    priority,
                    now.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        tracing::info!(task_id = %id, "task enqueued");
        Ok(id)
    }

    /// Atomically pick the highest-priority, oldest pending task whose
    /// repo has no running sibling, mark it `running`, and return it.
    pub async fn dequeue(&self) -> Result<Option<Task>> {
        let path = self.db_path.clone();
        let task = db::with_conn(path, move |conn| {
            let tx = conn.unchecked_transaction()?;
            let candidate: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, repo FROM tasks
                     WHERE status = 'pending'
                       AND repo NOT IN (SELECT repo FROM tasks WHERE status = 'running')
                     ORDER BY priority DESC, created_at ASC
                     LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((id, _repo)) = candidate else {
                tx.commit()?;
                return Ok(None);
            };

            tx.execute(
                "UPDATE tasks SET status = 'running' WHERE id = ?1",
                params![id],
            )?;
            let task = Self::row_to_task(&tx, &id)?;
            tx.commit()?;
            Ok(Some(task))
        })
        .await?;

        if let Some(t) = &task {
            tracing::info!(task_id = %t.id, repo = %t.repo, "task dequeued");
        }
        Ok(task)
    }

    pub async fn complete(&self, id: String, result: String) -> Result<()> {
        self.finish(id, TaskStatus::Completed, Some(result)).await
    }

    pub async fn fail(&self, id: String, reason: String) -> Result<()> {
        self.finish(id, TaskStatus::Failed, Some(reason)).await
    }

    /// Conditionally transition a task to `failed` with result `"Cancelled"`,
    /// but only if it's still `pending` or `running` — a task that already
    /// reached a terminal status must not have its result overwritten.
    /// Returns whether a row actually changed.
    pub async fn cancel(&self, id: String) -> Result<bool> {
        let path = self.db_path.clone();
        let now = chrono::Utc::now();
        let task_id = id.clone();
        let changed = db::with_conn(path, move |conn| {
            let updated = conn.execute(
                "UPDATE tasks SET status = 'failed', result = 'Cancelled', completed_at = ?1
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![now.to_rfc3339(), task_id],
            )?;
            Ok(updated > 0)
        })
        .await?;
        if changed {
            tracing::info!(task_id = %id, "task cancelled");
        }
        Ok(changed)
    }

    async fn finish(&self, id: String, status: TaskStatus, result: Option<String>) -> Result<()> {
        let path = self.db_path.clone();
        let now = chrono::Utc::now();
        let task_id = id.clone();
        db::with_conn(path, move |conn| {
            let updated = conn.execute(
                "UPDATE tasks SET status = ?1, result = ?2, completed_at = ?3 WHERE id = ?4",
                params![status.as_str(), result, now.to_rfc3339(), task_id],
            )?;
            if updated == 0 {
                return Err(DispatchError::NotFound(task_id));
            }
            Ok(())
        })
        .await?;
        tracing::info!(task_id = %id, status = status.as_str(), "task finished");
        Ok(())
    }

    pub async fn get(&self, id: String) -> Result<Task> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| Self::row_to_task(conn, &id)).await
    }

    pub async fn list_by_user(&self, user_id: String) -> Result<Vec<Task>> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, repo, prompt, status, result, task_type, priority, created_at, completed_at
                 FROM tasks WHERE user_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map(params![user_id], Self::map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn list_active(&self) -> Result<Vec<Task>> {
        self.list_by_status("running").await
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Task>> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, repo, prompt, status, result, task_type, priority, created_at, completed_at
                 FROM tasks ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], Self::map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn list_by_status(&self, status: &'static str) -> Result<Vec<Task>> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, repo, prompt, status, result, task_type, priority, created_at, completed_at
                 FROM tasks WHERE status = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![status], Self::map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Reset any task stuck in `running` back to `failed`. Called on
    /// startup in addition to the migration step, and safe to call again.
    pub async fn reset_stale(&self) -> Result<usize> {
        let path = self.db_path.clone();
        let now = chrono::Utc::now();
        db::with_conn(path, move |conn| {
            let n = conn.execute(
                "UPDATE tasks SET status = 'failed', result = 'Interrupted — process restarted', completed_at = ?1
                 WHERE status = 'running'",
                params![now.to_rfc3339()],
            )?;
            Ok(n)
        })
        .await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let mut stats = QueueStats::default();
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                match status.as_str() {
                    "pending" => stats.pending = count,
                    "running" => stats.running = count,
                    "completed" => stats.completed = count,
                    "failed" => stats.failed = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
        .await
    }

    pub async fn metrics(&self) -> Result<QueueMetrics> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let stats = {
                let mut stats = QueueStats::default();
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (status, count) = row?;
                    match status.as_str() {
                        "pending" => stats.pending = count,
                        "running" => stats.running = count,
                        "completed" => stats.completed = count,
                        "failed" => stats.failed = count,
                        _ => {}
                    }
                }
                stats
            };

            let now = chrono::Utc::now();
            let hour_ago = (now - chrono::Duration::hours(1)).to_rfc3339();
            let day_ago = (now - chrono::Duration::hours(24)).to_rfc3339();

            let throughput_last_hour: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE status IN ('completed','failed') AND completed_at >= ?1",
                params![hour_ago],
                |row| row.get(0),
            )?;
            let throughput_last_24h: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE status IN ('completed','failed') AND completed_at >= ?1",
                params![day_ago],
                |row| row.get(0),
            )?;

            let error_rate = if stats.completed + stats.failed > 0 {
                stats.failed as f64 / (stats.completed + stats.failed) as f64
            } else {
                0.0
            };

            let mut per_repo = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT repo,
                        AVG(CAST((julianday(completed_at) - julianday(created_at)) * 86400.0 AS REAL)),
                        COUNT(*)
                 FROM tasks
                 WHERE status IN ('completed','failed') AND completed_at IS NOT NULL
                 GROUP BY repo",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RepoMetrics {
                    repo: row.get(0)?,
                    avg_duration_secs: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                    count: row.get(2)?,
                })
            })?;
            for row in rows {
                per_repo.push(row?);
            }

            Ok(QueueMetrics {
                stats,
                throughput_last_hour,
                throughput_last_24h,
                error_rate,
                per_repo,
            })
        })
        .await
    }

    fn row_to_task(conn: &Connection, id: &str) -> Result<Task> {
        conn.query_row(
            "SELECT id, user_id, repo, prompt, status, result, task_type, priority, created_at, completed_at
             FROM tasks WHERE id = ?1",
            params![id],
            Self::map_row,
        )
        .optional()?
        .ok_or_else(|| DispatchError::NotFound(id.to_string()))
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let status_str: String = row.get(4)?;
        let task_type_str: Option<String> = row.get(6)?;
        let created_at_str: String = row.get(8)?;
        let completed_at_str: Option<String> = row.get(9)?;

        Ok(Task {
            id: row.get(0)?,
            user_id: row.get(1)?,
            repo: row.get(2)?,
            prompt: row.get(3)?,
            status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
            result: row.get(5)?,
            task_type: task_type_str.as_deref().and_then(TaskType::parse),
            priority: row.get(7)?,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at_str)
                .map(|d| d.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
            completed_at: completed_at_str.and_then(|s| {
                chrono::DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&chrono::Utc))
                    .ok()
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn new_queue() -> (TaskQueue, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let queue = TaskQueue::new(file.path().to_path_buf()).unwrap();
        (queue, file)
    }

    #[tokio::test]
    async fn priority_ordered_dequeue() {
        let (queue, _file) = new_queue();
        queue
            .enqueue("u".into(), "a".into(), "p".into(), None, Some(0))
            .await
            .unwrap();
        queue
            .enqueue("u".into(), "b".into(), "p".into(), None, Some(2))
            .await
            .unwrap();
        queue
            .enqueue("u".into(), "c".into(), "p".into(), None, Some(1))
            .await
            .unwrap();

        let t1 = queue.dequeue().await.unwrap().unwrap();
        let t2 = queue.dequeue().await.unwrap().unwrap();
        let t3 = queue.dequeue().await.unwrap().unwrap();

        assert_eq!(t1.repo, "b");
        assert_eq!(t2.repo, "c");
        assert_eq!(t3.repo, "a");
    }

    #[tokio::test]
    async fn per_repo_exclusion() {
        let (queue, _file) = new_queue();
        let id1 = queue
            .enqueue("u".into(), "my-app".into(), "p1".into(), None, None)
            .await
            .unwrap();
        queue
            .enqueue("u".into(), "my-app".into(), "p2".into(), None, None)
            .await
            .unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.id, id1);
        assert!(queue.dequeue().await.unwrap().is_none());

        queue.complete(id1, "ok".into()).await.unwrap();
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.repo, "my-app");
    }

    #[tokio::test]
    async fn round_trip_complete() {
        let (queue, _file) = new_queue();
        let id = queue
            .enqueue("u".into(), "my-app".into(), "review".into(), None, None)
            .await
            .unwrap();
        queue.dequeue().await.unwrap();
        queue.complete(id.clone(), "ok".into()).await.unwrap();

        let task = queue.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn restart_resets_running_to_failed() {
        let file = NamedTempFile::new().unwrap();
        let queue = TaskQueue::new(file.path().to_path_buf()).unwrap();
        let id = queue
            .enqueue("u".into(), "my-app".into(), "p".into(), None, None)
            .await
            .unwrap();
        queue.dequeue().await.unwrap();

        // Simulate a restart against the same database file.
        let queue2 = TaskQueue::new(file.path().to_path_buf()).unwrap();
        let task = queue2.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.result.as_deref(), Some("Interrupted — process restarted"));
    }

    #[tokio::test]
    async fn cancel_is_conditional_and_reports_whether_it_changed_anything() {
        let (queue, _file) = new_queue();
        let pending_id = queue
            .enqueue("u".into(), "a".into(), "p".into(), None, None)
            .await
            .unwrap();
        let done_id = queue
            .enqueue("u".into(), "b".into(), "p".into(), None, None)
            .await
            .unwrap();
        queue.dequeue().await.unwrap();
        queue.complete(done_id.clone(), "ok".into()).await.unwrap();

        assert!(queue.cancel(pending_id.clone()).await.unwrap());
        let cancelled = queue.get(pending_id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Failed);
        assert_eq!(cancelled.result.as_deref(), Some("Cancelled"));

        // Already-terminal task: cancel must not overwrite its result.
        assert!(!queue.cancel(done_id.clone()).await.unwrap());
        let untouched = queue.get(done_id).await.unwrap();
        assert_eq!(untouched.status, TaskStatus::Completed);
        assert_eq!(untouched.result.as_deref(), Some("ok"));
    }
}
