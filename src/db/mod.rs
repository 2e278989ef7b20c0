//! Shared SQLite access. There is no connection pool: every call opens a
//! fresh `rusqlite::Connection` against the configured path inside
//! `spawn_blocking`, the same pattern the reference message store uses.
//! WAL mode lets that coexist with a single long-lived writer in the
//! worker loop without explicit in-process locking for reads.

use crate::error::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// Open a connection to `path`, applying the pragmas every store needs.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// Run `f` against a fresh connection to `db_path` on the blocking pool.
pub async fn with_conn<F, T>(db_path: PathBuf, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = open(&db_path)?;
        f(&conn)
    })
    .await
    .map_err(|e| crate::error::DispatchError::Internal(anyhow::anyhow!(e)))?
}

/// Add `column` of `sql_type` to `table` if it isn't already there.
/// Additive-only: never drops or renames a column.
pub fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    sql_type: &str,
) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let has_column = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .any(|name| name == column);
    drop(stmt);

    if !has_column {
        conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"),
            [],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_column_if_missing_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", [])
            .unwrap();

        add_column_if_missing(&conn, "t", "note", "TEXT").unwrap();
        add_column_if_missing(&conn, "t", "note", "TEXT").unwrap();

        let mut stmt = conn.prepare("PRAGMA table_info(t)").unwrap();
        let cols: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(cols.iter().filter(|c| *c == "note").count(), 1);
    }
}
