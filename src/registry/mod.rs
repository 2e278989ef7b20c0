//! Canonical repository metadata, seeded from config and refreshed by an
//! optional external-sync loop. A `config`-sourced row always wins over
//! an `external-sync` upsert of the same name, so hand-maintained config
//! entries can't be clobbered by a background refresh.

use crate::db;
use crate::error::Result;
use crate::models::{Repo, RepoSource};
use rusqlite::{params, Connection, OptionalExtension};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

type SyncFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Repo>>> + Send>> + Send + Sync>;

#[derive(Clone)]
pub struct RepoRegistry {
    db_path: PathBuf,
    /// External-sync source. Defaults to a no-op that returns nothing,
    /// since most deployments have no external repo directory to poll.
    sync_fn: SyncFn,
}

impl RepoRegistry {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let conn = db::open(&db_path)?;
        Self::migrate(&conn)?;
        Ok(Self {
            db_path,
            sync_fn: Arc::new(|| Box::pin(async { Ok(Vec::new()) })),
        })
    }

    /// Install a callback used by the periodic external-sync loop.
    pub fn with_sync_fn(mut self, f: SyncFn) -> Self {
        self.sync_fn = f;
        self
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS repos (
                name TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                owner TEXT,
                default_branch TEXT NOT NULL DEFAULT 'main',
                source TEXT NOT NULL,
                excluded INTEGER NOT NULL DEFAULT 0,
                last_synced_at TEXT
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn upsert(&self, repo: Repo) -> Result<()> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            if repo.source == RepoSource::ExternalSync {
                let existing_source: Option<String> = conn
                    .query_row(
                        "SELECT source FROM repos WHERE name = ?1",
                        params![repo.name],
                        |row| row.get(0),
                    )
                    .optional()?;
                if existing_source.as_deref() == Some(RepoSource::Config.as_str()) {
                    return Ok(());
                }
            }

            conn.execute(
                "INSERT INTO repos (name, url, owner, default_branch, source, excluded, last_synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                    url = excluded.url,
                    owner = excluded.owner,
                    default_branch = excluded.default_branch,
                    source = excluded.source,
                    excluded = excluded.excluded,
                    last_synced_at = excluded.last_synced_at",
                params![
                    repo.name,
                    repo.url,
                    repo.owner,
                    repo.default_branch,
                    repo.source.as_str(),
                    repo.excluded as i64,
                    repo.last_synced_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, name: String) -> Result<Option<Repo>> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            conn.query_row(
                "SELECT name, url, owner, default_branch, source, excluded, last_synced_at
                 FROM repos WHERE name = ?1",
                params![name],
                Self::map_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<Repo>> {
        let path = self.db_path.clone();
        db::with_conn(path, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, url, owner, default_branch, source, excluded, last_synced_at FROM repos",
            )?;
            let rows = stmt
                .query_map([], Self::map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn names(&self) -> Result<Vec<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.excluded)
            .map(|r| r.name)
            .collect())
    }

    /// Poll the configured external source once and upsert what it returns.
    pub async fn sync_once(&self) -> Result<usize> {
        let repos = (self.sync_fn)().await.map_err(crate::error::DispatchError::Internal)?;
        let count = repos.len();
        for repo in repos {
            self.upsert(repo).await?;
        }
        Ok(count)
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Repo> {
        let source_str: String = row.get(4)?;
        let last_synced_str: Option<String> = row.get(6)?;
        Ok(Repo {
            name: row.get(0)?,
            url: row.get(1)?,
            owner: row.get(2)?,
            default_branch: row.get(3)?,
            source: RepoSource::parse(&source_str).unwrap_or(RepoSource::Manual),
            excluded: row.get::<_, i64>(5)? != 0,
            last_synced_at: last_synced_str.and_then(|s| {
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

    fn new_registry() -> (RepoRegistry, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let registry = RepoRegistry::new(file.path().to_path_buf()).unwrap();
        (registry, file)
    }

    fn repo(name: &str, source: RepoSource) -> Repo {
        Repo {
            name: name.to_string(),
            url: format!("https://example.com/{name}.git"),
            owner: None,
            default_branch: "main".to_string(),
            source,
            excluded: false,
            last_synced_at: None,
        }
    }

    #[tokio::test]
    async fn config_source_wins_over_external_sync() {
        let (registry, _file) = new_registry();
        registry.upsert(repo("my-app", RepoSource::Config)).await.unwrap();

        let mut external = repo("my-app", RepoSource::ExternalSync);
        external.url = "https://stale.example.com/my-app.git".to_string();
        registry.upsert(external).await.unwrap();

        let stored = registry.get("my-app".into()).await.unwrap().unwrap();
        assert_eq!(stored.source, RepoSource::Config);
        assert_eq!(stored.url, "https://example.com/my-app.git");
    }

    #[tokio::test]
    async fn external_sync_can_update_its_own_rows() {
        let (registry, _file) = new_registry();
        registry.upsert(repo("my-app", RepoSource::ExternalSync)).await.unwrap();

        let mut update = repo("my-app", RepoSource::ExternalSync);
        update.url = "https://fresh.example.com/my-app.git".to_string();
        registry.upsert(update).await.unwrap();

        let stored = registry.get("my-app".into()).await.unwrap().unwrap();
        assert_eq!(stored.url, "https://fresh.example.com/my-app.git");
    }

    #[tokio::test]
    async fn names_excludes_excluded_repos() {
        let (registry, _file) = new_registry();
        registry.upsert(repo("visible", RepoSource::Manual)).await.unwrap();
        let mut hidden = repo("hidden", RepoSource::Manual);
        hidden.excluded = true;
        registry.upsert(hidden).await.unwrap();

        let names = registry.names().await.unwrap();
        assert_eq!(names, vec!["visible".to_string()]);
    }
}
