//! Git plumbing for cloning repos and creating/removing per-task
//! worktrees. Every git invocation goes through `tokio::process::Command`
//! with an explicit argument array — no shell string interpolation, and
//! no `git2` binding, matching the subprocess-first style the rest of the
//! codebase uses for external tools.

use crate::error::{DispatchError, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[derive(Clone)]
pub struct WorkspaceManager {
    repos_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(repos_root: PathBuf) -> Self {
        Self { repos_root }
    }

    fn repo_path(&self, name: &str) -> PathBuf {
        self.repos_root.join(name)
    }

    fn worktrees_root(&self) -> PathBuf {
        self.repos_root.join(".worktrees")
    }

    async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<std::process::Output> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.output()
            .await
            .map_err(|e| DispatchError::WorkspaceFail(format!("git {args:?} failed to spawn: {e}")))
    }

    /// Clone `url` into `<reposRoot>/<name>` unless it already looks like
    /// a git checkout.
    pub async fn clone_if_needed(&self, name: &str, url: &str) -> Result<()> {
        let path = self.repo_path(name);
        if path.join(".git").join("HEAD").exists() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.repos_root)
            .await
            .map_err(DispatchError::Io)?;

        let output = Self::run_git(
            &["clone", url, path.to_str().unwrap_or_default()],
            None,
        )
        .await?;
        if !output.status.success() {
            return Err(DispatchError::WorkspaceFail(format!(
                "git clone {url} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        tracing::info!(repo = name, "cloned repository");
        Ok(())
    }

    /// Pull the latest `branch`. Failures are logged, never fatal: a
    /// stale checkout is still usable for the next worktree.
    pub async fn pull(&self, name: &str, branch: &str) {
        let path = self.repo_path(name);
        match Self::run_git(&["pull", "origin", branch], Some(&path)).await {
            Ok(output) if output.status.success() => {
                tracing::debug!(repo = name, "pulled latest {branch}");
            }
            Ok(output) => {
                tracing::warn!(
                    repo = name,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "git pull failed, continuing with existing checkout"
                );
            }
            Err(e) => {
                tracing::warn!(repo = name, error = %e, "git pull failed to run");
            }
        }
    }

    /// Create an isolated worktree for `task_id` off `base_branch`,
    /// returning its absolute path. Must be paired with `remove_worktree`.
    pub async fn create_worktree(
        &self,
        name: &str,
        task_id: &str,
        base_branch: &str,
    ) -> Result<PathBuf> {
        let worktree_path = self.worktrees_root().join(format!("{name}-{task_id}"));
        tokio::fs::create_dir_all(&self.worktrees_root())
            .await
            .map_err(DispatchError::Io)?;

        let branch_name = format!("agent/{task_id}");
        let repo_path = self.repo_path(name);
        let worktree_str = worktree_path.to_str().unwrap_or_default();

        let output = Self::run_git(
            &["worktree", "add", "-b", &branch_name, worktree_str, base_branch],
            Some(&repo_path),
        )
        .await?;
        if !output.status.success() {
            return Err(DispatchError::WorkspaceFail(format!(
                "git worktree add for {name}/{task_id} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(worktree_path)
    }

    /// Remove a worktree created by `create_worktree`. Errors are
    /// tolerated: a worktree that failed to clean up shouldn't fail the
    /// task that already completed.
    pub async fn remove_worktree(&self, name: &str, task_id: &str) {
        let worktree_path = self.worktrees_root().join(format!("{name}-{task_id}"));
        let repo_path = self.repo_path(name);
        let worktree_str = worktree_path.to_str().unwrap_or_default();

        match Self::run_git(
            &["worktree", "remove", worktree_str, "--force"],
            Some(&repo_path),
        )
        .await
        {
            Ok(output) if output.status.success() => {
                tracing::debug!(repo = name, task_id, "removed worktree");
            }
            Ok(output) => {
                tracing::warn!(
                    repo = name,
                    task_id,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "worktree remove reported an error"
                );
            }
            Err(e) => {
                tracing::warn!(repo = name, task_id, error = %e, "worktree remove failed to run");
            }
        }
    }
}

/// Scoped-release guard pairing a `create_worktree` with a guaranteed
/// `remove_worktree` even if the caller returns early or panics.
pub struct WorktreeGuard<'a> {
    manager: &'a WorkspaceManager,
    repo: String,
    task_id: String,
    pub path: PathBuf,
}

impl<'a> WorktreeGuard<'a> {
    pub async fn acquire(
        manager: &'a WorkspaceManager,
        repo: &str,
        task_id: &str,
        base_branch: &str,
    ) -> Result<WorktreeGuard<'a>> {
        let path = manager.create_worktree(repo, task_id, base_branch).await?;
        Ok(WorktreeGuard {
            manager,
            repo: repo.to_string(),
            task_id: task_id.to_string(),
            path,
        })
    }
}

impl Drop for WorktreeGuard<'_> {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let repo = self.repo.clone();
        let task_id = self.task_id.clone();
        tokio::spawn(async move {
            manager.remove_worktree(&repo, &task_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_bare_repo(dir: &Path) {
        Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        tokio::fs::write(dir.join("README.md"), "hi").await.unwrap();
        Command::new("git")
            .args(["-c", "user.email=a@b.c", "-c", "user.name=a", "add", "."])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        Command::new("git")
            .args(["-c", "user.email=a@b.c", "-c", "user.name=a", "commit", "-q", "-m", "init"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn clone_if_needed_is_idempotent() {
        let origin = TempDir::new().unwrap();
        init_bare_repo(origin.path()).await;

        let repos_root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(repos_root.path().to_path_buf());
        let url = origin.path().to_str().unwrap();

        manager.clone_if_needed("my-app", url).await.unwrap();
        assert!(repos_root.path().join("my-app/.git/HEAD").exists());

        // Second call is a no-op, not an error.
        manager.clone_if_needed("my-app", url).await.unwrap();
    }

    #[tokio::test]
    async fn worktree_create_and_remove_round_trip() {
        let origin = TempDir::new().unwrap();
        init_bare_repo(origin.path()).await;

        let repos_root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(repos_root.path().to_path_buf());
        let url = origin.path().to_str().unwrap();
        manager.clone_if_needed("my-app", url).await.unwrap();

        let branch = Command::new("git")
            .args(["-C", repos_root.path().join("my-app").to_str().unwrap(), "branch", "--show-current"])
            .output()
            .await
            .unwrap();
        let base_branch = String::from_utf8_lossy(&branch.stdout).trim().to_string();

        let worktree_path = manager
            .create_worktree("my-app", "task-1", &base_branch)
            .await
            .unwrap();
        assert!(worktree_path.exists());

        manager.remove_worktree("my-app", "task-1").await;
        assert!(!worktree_path.exists());
    }
}
