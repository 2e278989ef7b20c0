//! User-created recurring triggers. Ownership is checked in the store
//! itself so handlers don't need to re-fetch and compare `user_id` by
//! hand before allowing a removal.

use crate::cron;
use crate::db;
use crate::error::{DispatchError, Result};
use crate::models::Schedule;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Clone)]
pub struct ScheduleStore {
    db_path: PathBuf,
}

impl ScheduleStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let conn = db::open(&db_path)?;
        Self::migrate(&conn)?;
        Ok(Self { db_path })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                repo TEXT,
                prompt TEXT NOT NULL,
                schedule TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn create(
        &self,
        user_id: String,
        repo: Option<String>,
        prompt: String,
        schedule: String,
        description: String,
    ) -> Result<i64> {
        let path = self.db_path.clone();
        let now = chrono::Utc::now();
        db::with_conn(path, move |conn| {
            conn.execute(
                "INSERT INTO schedules (user_id, repo, prompt, schedule, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![user_id, repo, prompt, schedule, description, now.to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn list_for_user(&self, user_id: String) -> Result<Vec<Schedule>> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, repo, prompt, schedule, description, created_at
                 FROM schedules WHERE user_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![user_id], Self::map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// All schedules, config-defined ones included by the caller separately.
    pub async fn list_all(&self) -> Result<Vec<Schedule>> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, repo, prompt, schedule, description, created_at FROM schedules",
            )?;
            let rows = stmt
                .query_map([], Self::map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn remove(&self, id: i64, user_id: String) -> Result<()> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM schedules WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .ok();
            match owner {
                None => Err(DispatchError::NotFound(id.to_string())),
                Some(owner) if owner != user_id => {
                    Err(DispatchError::AuthFail { repo: format!("schedule {id}") })
                }
                Some(_) => {
                    conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
                    Ok(())
                }
            }
        })
        .await
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Schedule> {
        let created_at_str: String = row.get(6)?;
        Ok(Schedule {
            id: row.get(0)?,
            user_id: row.get(1)?,
            repo: row.get(2)?,
            prompt: row.get(3)?,
            schedule: row.get(4)?,
            description: row.get(5)?,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at_str)
                .map(|d| d.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
        })
    }
}

/// A single-turn LLM call that turns a natural-language scheduling
/// request into a strict JSON draft. Mirrors `resolver::LlmResolver`:
/// the trait boundary keeps the store free of any concrete model
/// integration, and callers inject whichever runner backs it.
#[async_trait]
pub trait ScheduleDrafter: Send + Sync {
    async fn draft(&self, message: &str, default_repo: Option<&str>) -> Result<String>;
}

/// Default drafter used when no concrete LLM integration is wired in.
/// Always declines, which routes the side conversation back to an inline
/// clarification reply rather than silently fabricating a schedule.
pub struct NullScheduleDrafter;

#[async_trait]
impl ScheduleDrafter for NullScheduleDrafter {
    async fn draft(&self, _message: &str, _default_repo: Option<&str>) -> Result<String> {
        Ok("DECLINE".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ScheduleDraft {
    schedule: String,
    prompt: String,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    description: String,
}

/// Strip a ``` or ```json fence the model's response may be wrapped in.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches('\n');
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

/// Parse and validate a drafted schedule into `(repo, prompt, schedule,
/// description)`, ready for `ScheduleStore::create`. The drafter is
/// expected to reply with the literal text `DECLINE` when the message
/// doesn't describe a recurring task; anything else must be the strict
/// JSON object described in the drafting prompt, with a cron expression
/// that actually parses.
pub fn parse_draft(raw: &str) -> Result<(Option<String>, String, String, String)> {
    let cleaned = strip_code_fence(raw);
    if cleaned.eq_ignore_ascii_case("decline") {
        return Err(DispatchError::InvalidSchedule(
            "could not work out a recurring schedule from that message".to_string(),
        ));
    }

    let draft: ScheduleDraft = serde_json::from_str(cleaned).map_err(|e| {
        DispatchError::InvalidSchedule(format!("malformed schedule draft: {e}"))
    })?;

    if draft.prompt.trim().is_empty() {
        return Err(DispatchError::InvalidSchedule(
            "drafted schedule has an empty prompt".to_string(),
        ));
    }
    cron::should_run(&draft.schedule, chrono::Utc::now())?;

    Ok((draft.repo, draft.prompt, draft.schedule, draft.description))
}

/// The prompt handed to the drafter alongside the user's message. Asks
/// for strict JSON so `parse_draft` doesn't have to guess at prose.
pub fn drafting_prompt(message: &str, default_repo: Option<&str>) -> String {
    let repo_hint = match default_repo {
        Some(r) => format!("If the user doesn't name a repo, default to \"{r}\"."),
        None => "If the user doesn't name a repo, set \"repo\" to null.".to_string(),
    };
    format!(
        "A user wants to schedule a recurring task. Their message: {message:?}\n\n\
         Reply with ONLY a JSON object of the form:\n\
         {{\"schedule\": \"<5-field cron expression, UTC>\", \"prompt\": \"<task to run>\", \
         \"repo\": \"<repo name or null>\", \"description\": \"<short human summary>\"}}\n\
         {repo_hint}\n\
         If the message does not describe a recurring task, reply with exactly: DECLINE"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn new_store() -> (ScheduleStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = ScheduleStore::new(file.path().to_path_buf()).unwrap();
        (store, file)
    }

    #[tokio::test]
    async fn create_and_list_for_user() {
        let (store, _file) = new_store();
        store
            .create("u1".into(), Some("my-app".into()), "run tests".into(), "0 9 * * *".into(), "daily tests".into())
            .await
            .unwrap();
        let schedules = store.list_for_user("u1".into()).await.unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].schedule, "0 9 * * *");
    }

    #[tokio::test]
    async fn remove_rejects_non_owner() {
        let (store, _file) = new_store();
        let id = store
            .create("u1".into(), None, "p".into(), "* * * * *".into(), String::new())
            .await
            .unwrap();

        let err = store.remove(id, "u2".into()).await.unwrap_err();
        assert!(matches!(err, DispatchError::AuthFail { .. }));

        store.remove(id, "u1".into()).await.unwrap();
        assert!(store.list_for_user("u1".into()).await.unwrap().is_empty());
    }

    #[test]
    fn parse_draft_accepts_plain_json() {
        let raw = r#"{"schedule": "0 9 * * 1-5", "prompt": "run the test suite", "repo": "my-app", "description": "weekday tests"}"#;
        let (repo, prompt, schedule, description) = parse_draft(raw).unwrap();
        assert_eq!(repo.as_deref(), Some("my-app"));
        assert_eq!(prompt, "run the test suite");
        assert_eq!(schedule, "0 9 * * 1-5");
        assert_eq!(description, "weekday tests");
    }

    #[test]
    fn parse_draft_strips_code_fence() {
        let raw = "```json\n{\"schedule\": \"*/15 * * * *\", \"prompt\": \"ping\", \"repo\": null, \"description\": \"\"}\n```";
        let (repo, prompt, schedule, _) = parse_draft(raw).unwrap();
        assert_eq!(repo, None);
        assert_eq!(prompt, "ping");
        assert_eq!(schedule, "*/15 * * * *");
    }

    #[test]
    fn parse_draft_rejects_decline() {
        let err = parse_draft("DECLINE").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSchedule(_)));
    }

    #[test]
    fn parse_draft_rejects_bad_cron_expression() {
        let raw = r#"{"schedule": "not a cron", "prompt": "ping", "repo": null, "description": ""}"#;
        let err = parse_draft(raw).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSchedule(_)));
    }

    #[test]
    fn parse_draft_rejects_malformed_json() {
        let err = parse_draft("not json at all").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn null_drafter_declines() {
        let drafter = NullScheduleDrafter;
        let raw = drafter.draft("remind me every day", None).await.unwrap();
        assert!(parse_draft(&raw).is_err());
    }
}
