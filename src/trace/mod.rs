//! Append-only structured event log, one stream per task. Recording is
//! gated by an opt-in config flag; when disabled, `append` is a no-op so
//! callers don't need to branch on the setting themselves.

use crate::db;
use crate::error::Result;
use crate::models::{TraceEvent, TraceKind};
use rusqlite::{params, Connection};
use std::path::PathBuf;

#[derive(Clone)]
pub struct TraceStore {
    db_path: PathBuf,
    enabled: bool,
}

impl TraceStore {
    pub fn new(db_path: PathBuf, enabled: bool) -> Result<Self> {
        let conn = db::open(&db_path)?;
        Self::migrate(&conn)?;
        Ok(Self { db_path, enabled })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trace_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                kind TEXT NOT NULL,
                summary TEXT NOT NULL,
                detail TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trace_task ON trace_events(task_id, id)",
            [],
        )?;
        Ok(())
    }

    pub async fn append(
        &self,
        task_id: String,
        kind: TraceKind,
        summary: String,
        detail: Option<String>,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let summary: String = summary.chars().take(200).collect();
        let path = self.db_path.clone();
        let now = chrono::Utc::now();
        db::with_conn(path, move |conn| {
            conn.execute(
                "INSERT INTO trace_events (task_id, ts, kind, summary, detail) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task_id, now.to_rfc3339(), kind.as_str(), summary, detail],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn for_task(&self, task_id: String, limit: i64) -> Result<Vec<TraceEvent>> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, ts, kind, summary, detail FROM trace_events
                 WHERE task_id = ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![task_id, limit], |row| {
                    let ts_str: String = row.get(2)?;
                    let kind_str: String = row.get(3)?;
                    Ok(TraceEvent {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        ts: chrono::DateTime::parse_from_rfc3339(&ts_str)
                            .map(|d| d.with_timezone(&chrono::Utc))
                            .unwrap_or_else(|_| chrono::Utc::now()),
                        kind: TraceKind::parse(&kind_str).unwrap_or(TraceKind::Status),
                        summary: row.get(4)?,
                        detail: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn disabled_store_records_nothing() {
        let file = NamedTempFile::new().unwrap();
        let store = TraceStore::new(file.path().to_path_buf(), false).unwrap();
        store
            .append("t1".into(), TraceKind::Status, "started".into(), None)
            .await
            .unwrap();
        let events = store.for_task("t1".into(), 200).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn appends_in_order_and_paginates() {
        let file = NamedTempFile::new().unwrap();
        let store = TraceStore::new(file.path().to_path_buf(), true).unwrap();
        for i in 0..3 {
            store
                .append("t1".into(), TraceKind::Tool, format!("step {i}"), None)
                .await
                .unwrap();
        }
        let events = store.for_task("t1".into(), 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].summary, "step 0");
        assert_eq!(events[1].summary, "step 1");
    }

    #[tokio::test]
    async fn long_summary_is_truncated_to_200_chars() {
        let file = NamedTempFile::new().unwrap();
        let store = TraceStore::new(file.path().to_path_buf(), true).unwrap();
        let long = "x".repeat(500);
        store
            .append("t1".into(), TraceKind::Output, long, None)
            .await
            .unwrap();
        let events = store.for_task("t1".into(), 10).await.unwrap();
        assert_eq!(events[0].summary.len(), 200);
    }
}
