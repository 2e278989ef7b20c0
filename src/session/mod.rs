//! Per-user conversation history and mode. Two tables, one per concern:
//! chat history is append-only and read back in insertion order; user
//! mode is a single upserted row per user, defaulting to `strict` when
//! absent.

use crate::db;
use crate::error::Result;
use crate::models::{ChatMessage, ChatRole, Mode};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

#[derive(Clone)]
pub struct SessionStore {
    db_path: PathBuf,
}

impl SessionStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let conn = db::open(&db_path)?;
        Self::migrate(&conn)?;
        Ok(Self { db_path })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS chat_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chat_history_user ON chat_history(user_id, id)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS user_modes (
                user_id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn append(&self, user_id: String, role: ChatRole, content: String) -> Result<()> {
        let path = self.db_path.clone();
        let now = chrono::Utc::now();
        db::with_conn(path, move |conn| {
            conn.execute(
                "INSERT INTO chat_history (user_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user_id, role.as_str(), content, now.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn history(&self, user_id: String) -> Result<Vec<ChatMessage>> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, role, content, created_at FROM chat_history
                 WHERE user_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    let role_str: String = row.get(1)?;
                    let created_at_str: String = row.get(3)?;
                    Ok(ChatMessage {
                        user_id: row.get(0)?,
                        role: ChatRole::parse(&role_str).unwrap_or(ChatRole::User),
                        content: row.get(2)?,
                        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_str)
                            .map(|d| d.with_timezone(&chrono::Utc))
                            .unwrap_or_else(|_| chrono::Utc::now()),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Last `n` turns, oldest first, for use as resolver/prompt context.
    pub async fn recent(&self, user_id: String, n: usize) -> Result<Vec<ChatMessage>> {
        let mut all = self.history(user_id).await?;
        if all.len() > n {
            all = all.split_off(all.len() - n);
        }
        Ok(all)
    }

    pub async fn mode(&self, user_id: String) -> Result<Mode> {
        let path = self.db_path.clone();
        let mode = db::with_conn(path, move |conn| {
            let row: Option<String> = conn
                .query_row(
                    "SELECT mode FROM user_modes WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(row)
        })
        .await?;
        Ok(mode.and_then(|s| Mode::parse(&s)).unwrap_or_default())
    }

    pub async fn set_mode(&self, user_id: String, mode: Mode) -> Result<()> {
        let path = self.db_path.clone();
        let now = chrono::Utc::now();
        db::with_conn(path, move |conn| {
            conn.execute(
                "INSERT INTO user_modes (user_id, mode, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET mode = excluded.mode, updated_at = excluded.updated_at",
                params![user_id, mode.as_str(), now.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Wipe history and reset mode to its default for a user.
    pub async fn clear(&self, user_id: String) -> Result<()> {
        let path = self.db_path.clone();
        let uid = user_id.clone();
        db::with_conn(path, move |conn| {
            conn.execute("DELETE FROM chat_history WHERE user_id = ?1", params![uid])?;
            conn.execute("DELETE FROM user_modes WHERE user_id = ?1", params![uid])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn new_store() -> (SessionStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = SessionStore::new(file.path().to_path_buf()).unwrap();
        (store, file)
    }

    #[tokio::test]
    async fn mode_defaults_to_strict() {
        let (store, _file) = new_store();
        assert_eq!(store.mode("u1".into()).await.unwrap(), Mode::Strict);
    }

    #[tokio::test]
    async fn set_mode_persists() {
        let (store, _file) = new_store();
        store.set_mode("u1".into(), Mode::Assistant).await.unwrap();
        assert_eq!(store.mode("u1".into()).await.unwrap(), Mode::Assistant);
    }

    #[tokio::test]
    async fn history_is_read_in_insertion_order() {
        let (store, _file) = new_store();
        store
            .append("u1".into(), ChatRole::User, "hi".into())
            .await
            .unwrap();
        store
            .append("u1".into(), ChatRole::Assistant, "hello".into())
            .await
            .unwrap();
        let history = store.history("u1".into()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].content, "hello");
    }

    #[tokio::test]
    async fn clear_resets_history_and_mode() {
        let (store, _file) = new_store();
        store
            .append("u1".into(), ChatRole::User, "hi".into())
            .await
            .unwrap();
        store.set_mode("u1".into(), Mode::Assistant).await.unwrap();

        store.clear("u1".into()).await.unwrap();

        assert!(store.history("u1".into()).await.unwrap().is_empty());
        assert_eq!(store.mode("u1".into()).await.unwrap(), Mode::Strict);
    }
}
