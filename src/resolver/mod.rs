//! Maps a request to a concrete repository using hints, grants, and — when
//! the grant set is ambiguous — a pluggable LLM resolver. The resolver
//! itself is a trait object so the core never depends on a concrete
//! model provider; callers wire in whatever actually talks to the model.

use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Repo(String),
    /// The request does not target any specific repo; caller should
    /// re-route to `discuss`.
    None,
    /// Ambiguous or unrecognized response; caller should present the
    /// candidate list to the user.
    Unknown { candidates: Vec<String> },
    NoRepos,
}

/// Context passed to the LLM resolver when grants are ambiguous.
pub struct ResolverContext<'a> {
    pub recent_turns: &'a [String],
    pub last_task_repo: Option<&'a str>,
    pub candidates: &'a [String],
    pub message: &'a str,
}

/// What an LLM resolver call can answer with, per spec: an exact name,
/// the literal sentinel "NONE", or "UNKNOWN".
#[async_trait]
pub trait LlmResolver: Send + Sync {
    async fn resolve(&self, ctx: ResolverContext<'_>) -> anyhow::Result<String>;
}

/// Resolver with no model wired in: always answers `UNKNOWN`. Used in
/// tests and any deployment that hasn't configured an LLM resolver.
pub struct NullLlmResolver;

#[async_trait]
impl LlmResolver for NullLlmResolver {
    async fn resolve(&self, _ctx: ResolverContext<'_>) -> anyhow::Result<String> {
        Ok("UNKNOWN".to_string())
    }
}

pub struct RepoResolver {
    llm: Arc<dyn LlmResolver>,
}

impl RepoResolver {
    pub fn new(llm: Arc<dyn LlmResolver>) -> Self {
        Self { llm }
    }

    pub fn with_null_llm() -> Self {
        Self::new(Arc::new(NullLlmResolver))
    }

    /// `hint` is whatever the router extracted; `user_repos` is the
    /// already-expanded grant set (wildcard resolved by the caller).
    pub async fn resolve(
        &self,
        hint: Option<&str>,
        user_repos: &[String],
        recent_turns: &[String],
        last_task_repo: Option<&str>,
        message: &str,
    ) -> Resolution {
        if let Some(hint) = hint {
            if user_repos.iter().any(|r| r == hint) {
                return Resolution::Repo(hint.to_string());
            }
        }

        if user_repos.is_empty() {
            return Resolution::NoRepos;
        }
        if user_repos.len() == 1 {
            return Resolution::Repo(user_repos[0].clone());
        }

        let ctx = ResolverContext {
            recent_turns,
            last_task_repo,
            candidates: user_repos,
            message,
        };

        match self.llm.resolve(ctx).await {
            Ok(answer) => {
                let trimmed = answer.trim();
                if trimmed.eq_ignore_ascii_case("NONE") {
                    Resolution::None
                } else if user_repos.iter().any(|r| r == trimmed) {
                    Resolution::Repo(trimmed.to_string())
                } else {
                    Resolution::Unknown {
                        candidates: user_repos.to_vec(),
                    }
                }
            }
            Err(_) => Resolution::Unknown {
                candidates: user_repos.to_vec(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(String);

    #[async_trait]
    impl LlmResolver for FixedResolver {
        async fn resolve(&self, _ctx: ResolverContext<'_>) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn hint_short_circuits() {
        let resolver = RepoResolver::with_null_llm();
        let repos = vec!["a".to_string(), "b".to_string()];
        let resolution = resolver
            .resolve(Some("b"), &repos, &[], None, "msg")
            .await;
        assert_eq!(resolution, Resolution::Repo("b".to_string()));
    }

    #[tokio::test]
    async fn single_repo_shortcut() {
        let resolver = RepoResolver::with_null_llm();
        let repos = vec!["only-one".to_string()];
        let resolution = resolver.resolve(None, &repos, &[], None, "msg").await;
        assert_eq!(resolution, Resolution::Repo("only-one".to_string()));
    }

    #[tokio::test]
    async fn zero_repos_errors() {
        let resolver = RepoResolver::with_null_llm();
        let resolution = resolver.resolve(None, &[], &[], None, "msg").await;
        assert_eq!(resolution, Resolution::NoRepos);
    }

    #[tokio::test]
    async fn llm_none_reroutes_to_discuss() {
        let resolver = RepoResolver::new(Arc::new(FixedResolver("NONE".to_string())));
        let repos = vec!["a".to_string(), "b".to_string()];
        let resolution = resolver.resolve(None, &repos, &[], None, "msg").await;
        assert_eq!(resolution, Resolution::None);
    }

    #[tokio::test]
    async fn llm_unknown_returns_candidates() {
        let resolver = RepoResolver::new(Arc::new(FixedResolver("garbage".to_string())));
        let repos = vec!["a".to_string(), "b".to_string()];
        let resolution = resolver.resolve(None, &repos, &[], None, "msg").await;
        assert_eq!(
            resolution,
            Resolution::Unknown {
                candidates: repos
            }
        );
    }

    #[tokio::test]
    async fn llm_exact_name_resolves() {
        let resolver = RepoResolver::new(Arc::new(FixedResolver("b".to_string())));
        let repos = vec!["a".to_string(), "b".to_string()];
        let resolution = resolver.resolve(None, &repos, &[], None, "msg").await;
        assert_eq!(resolution, Resolution::Repo("b".to_string()));
    }
}
