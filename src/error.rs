use thiserror::Error;

/// Convenience alias for results produced anywhere in the dispatcher.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Crate-wide error type for the dispatcher core.
///
/// Variants map onto the error taxonomy the system is built around:
/// classification failures are not modeled here (they fall through to
/// `free-form` routing, which is not an error), but resolution, auth,
/// workspace, runner, and delivery failures all have a dedicated shape
/// so callers can decide how to surface them without string matching.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not resolve a repository: {0}")]
    ResolveFail(String),

    #[error("not authorized for repo {repo}")]
    AuthFail { repo: String },

    #[error("unknown repo: {0}")]
    UnknownRepo(String),

    #[error("workspace error: {0}")]
    WorkspaceFail(String),

    #[error("runner error: {0}")]
    RunnerFail(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid cron expression: {0}")]
    InvalidSchedule(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for DispatchError {
    fn from(e: config::ConfigError) -> Self {
        DispatchError::Config(e.to_string())
    }
}
