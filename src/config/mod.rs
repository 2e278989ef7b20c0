//! Static configuration plus the persisted user/repo edits layered on top
//! of it. The on-disk shape is the JSON object from the spec: `repos`,
//! `users`, `claude.maxTurns`, `reposDir`, and a handful of optional
//! blocks (`mcpServers`, `cron`, `runner`, `github`). Secrets never live
//! in that file — they come from the environment, loaded via `dotenvy`
//! the same way the reference service loads `CLAUDE_API_KEY`/`DISCORD_TOKEN`.

use crate::constants::{DEFAULT_API_HOST, DEFAULT_API_PORT};
use crate::error::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoEntry {
    pub url: String,
    #[serde(default = "default_branch", rename = "defaultBranch")]
    pub default_branch: String,
    #[serde(default)]
    pub runner: Option<String>,
    #[serde(default)]
    pub excluded: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    #[serde(default)]
    pub repos: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    #[serde(default = "default_max_turns", rename = "maxTurns")]
    pub max_turns: u32,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

fn default_max_turns() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default)]
    pub schedules: Vec<ConfiguredSchedule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredSchedule {
    pub repo: Option<String>,
    pub prompt: String,
    pub schedule: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub bot_login: Option<String>,
}

/// Top-level config file shape plus process-local knobs sourced from
/// the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repos: HashMap<String, RepoEntry>,
    #[serde(default)]
    pub users: HashMap<String, UserEntry>,
    #[serde(default)]
    pub claude: ClaudeConfig,
    #[serde(default = "default_repos_dir", rename = "reposDir")]
    pub repos_dir: PathBuf,
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: Option<serde_json::Value>,
    #[serde(default)]
    pub cron: Option<CronConfig>,
    #[serde(default)]
    pub runner: Option<RunnerConfig>,
    #[serde(default)]
    pub github: Option<GithubConfig>,

    /// Path to the config file itself, so `add_repo`/`add_user` can
    /// merge their change back in without clobbering unknown fields.
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Path to the sqlite database file. Env-only: `DISPATCHER_DB_PATH`.
    #[serde(skip)]
    pub database_path: PathBuf,
    /// Process-wide trace recording opt-in: `DISPATCHER_TRACE_ENABLED`.
    #[serde(skip)]
    pub trace_enabled: bool,
    /// HMAC secret for the GitHub webhook: `DISPATCHER_WEBHOOK_SECRET`.
    #[serde(skip)]
    pub webhook_secret: Option<String>,
    /// Webhook server bind host. Env-only: `API_HOST`.
    #[serde(skip)]
    pub api_host: String,
    /// Webhook server bind port. Env-only: `API_PORT`.
    #[serde(skip)]
    pub api_port: u16,
    /// CORS allowlist for the webhook server. Env-only: `ALLOWED_ORIGINS`
    /// (comma-separated).
    #[serde(skip)]
    pub allowed_origins: Vec<String>,
}

fn default_repos_dir() -> PathBuf {
    PathBuf::from("./repos")
}

impl Config {
    /// Load the config file named by `DISPATCHER_CONFIG` (default
    /// `config.json`), then layer environment-only settings on top.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let config_path = std::env::var("DISPATCHER_CONFIG")
            .unwrap_or_else(|_| "config.json".to_string());
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();

        let mut cfg: Config = if config_path.exists() {
            // Layered with `config::Environment` so any `DISPATCHER__...`
            // double-underscore env var can override a file field during
            // local development, matching the reference service's source
            // precedence (file, then environment).
            let builder = config::Config::builder()
                .add_source(config::File::from(config_path.clone()))
                .add_source(config::Environment::with_prefix("DISPATCHER").separator("__"));
            let raw = builder.build()?;
            raw.try_deserialize()
                .map_err(|e| DispatchError::Config(format!("invalid config file: {e}")))?
        } else {
            tracing::warn!(
                "config file {:?} not found, starting with empty repo/user sets",
                config_path
            );
            Config {
                repos: HashMap::new(),
                users: HashMap::new(),
                claude: ClaudeConfig::default(),
                repos_dir: default_repos_dir(),
                mcp_servers: None,
                cron: None,
                runner: None,
                github: None,
                config_path: config_path.clone(),
                database_path: PathBuf::new(),
                trace_enabled: false,
                webhook_secret: None,
                api_host: DEFAULT_API_HOST.to_string(),
                api_port: DEFAULT_API_PORT,
                allowed_origins: Vec::new(),
            }
        };

        cfg.config_path = config_path;
        cfg.database_path = std::env::var("DISPATCHER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("dispatcher.db"));
        cfg.trace_enabled = std::env::var("DISPATCHER_TRACE_ENABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        cfg.webhook_secret = std::env::var("DISPATCHER_WEBHOOK_SECRET").ok();
        cfg.api_host = std::env::var("API_HOST").unwrap_or_else(|_| DEFAULT_API_HOST.to_string());
        cfg.api_port = std::env::var("API_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_API_PORT);
        cfg.allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(cfg)
    }

    /// Expand a user's repo grants, turning the `"*"` sentinel into the
    /// current registry's full name list. Must be computed at query time,
    /// never cached, so registry changes take effect immediately.
    pub fn user_repos(&self, user_id: &str, all_repo_names: &[String]) -> Vec<String> {
        let Some(user) = self.users.get(user_id) else {
            return Vec::new();
        };
        if user.repos.iter().any(|r| r == "*") {
            all_repo_names.to_vec()
        } else {
            user.repos.clone()
        }
    }

    pub fn is_authorized(&self, user_id: &str, repo: &str, all_repo_names: &[String]) -> bool {
        self.user_repos(user_id, all_repo_names)
            .iter()
            .any(|r| r == repo)
    }

    /// Add or update a repo entry and persist the merged config file,
    /// preserving any fields this struct doesn't model.
    pub fn add_repo(&mut self, name: String, entry: RepoEntry) -> Result<()> {
        self.repos.insert(name, entry);
        self.persist_merged()
    }

    /// Add or update a user entry and persist the merged config file.
    pub fn add_user(&mut self, platform_id: String, entry: UserEntry) -> Result<()> {
        self.users.insert(platform_id, entry);
        self.persist_merged()
    }

    /// Re-read the file as a raw JSON value, overlay `repos`/`users` from
    /// memory, and write it back. This keeps unrecognized top-level keys
    /// (e.g. fields a newer config format added) intact.
    fn persist_merged(&self) -> Result<()> {
        let mut doc: serde_json::Value = if self.config_path.exists() {
            let raw = std::fs::read_to_string(&self.config_path)?;
            serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        let obj = doc
            .as_object_mut()
            .ok_or_else(|| DispatchError::Config("config file is not a JSON object".to_string()))?;
        obj.insert("repos".to_string(), serde_json::to_value(&self.repos)?);
        obj.insert("users".to_string(), serde_json::to_value(&self.users)?);

        let pretty = serde_json::to_string_pretty(&doc)?;
        std::fs::write(&self.config_path, pretty)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        file
    }

    #[test]
    fn loads_repos_and_users() {
        let file = write_config(
            r#"{
                "repos": {"my-app": {"url": "https://example.com/my-app.git"}},
                "users": {"slack:U1": {"name": "Ada", "repos": ["my-app"]}}
            }"#,
        );
        let cfg = Config::load_from(file.path()).unwrap();
        assert_eq!(cfg.repos["my-app"].default_branch, "main");
        assert_eq!(cfg.users["slack:U1"].repos, vec!["my-app"]);
    }

    #[test]
    fn wildcard_grant_expands_at_query_time() {
        let file = write_config(
            r#"{"users": {"slack:U1": {"name": "Ada", "repos": ["*"]}}}"#,
        );
        let cfg = Config::load_from(file.path()).unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        assert_eq!(cfg.user_repos("slack:U1", &names), names);

        let more_names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(cfg.user_repos("slack:U1", &more_names), more_names);
    }

    #[test]
    fn missing_config_file_starts_empty() {
        let cfg = Config::load_from("/nonexistent/path/config.json").unwrap();
        assert!(cfg.repos.is_empty());
        assert!(cfg.users.is_empty());
    }

    #[test]
    fn add_repo_preserves_unknown_fields() {
        let file = write_config(r#"{"extensionField": {"nested": true}}"#);
        let mut cfg = Config::load_from(file.path()).unwrap();
        cfg.add_repo(
            "new-repo".to_string(),
            RepoEntry {
                url: "https://example.com/new-repo.git".to_string(),
                default_branch: "main".to_string(),
                runner: None,
                excluded: false,
            },
        )
        .unwrap();

        let raw = std::fs::read_to_string(file.path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["extensionField"]["nested"], serde_json::json!(true));
        assert_eq!(doc["repos"]["new-repo"]["url"], "https://example.com/new-repo.git");
    }
}
