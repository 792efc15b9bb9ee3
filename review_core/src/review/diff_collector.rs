//! Runs the host VCS and turns its output into raw unified-diff text.
//!
//! One `DiffCollector` per process: the "inside a git repository" probe is
//! memoized on first use (spec §4.1), mirroring the original module-level
//! `_GIT_REPO_VERIFIED` flag but as owned state instead of a global.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::Command;
use tracing::{debug, warn};

use super::context_level::DiffMode;
use super::error::DiffError;

pub struct DiffCollector {
    root_directory: Option<String>,
    repo_verified: AtomicBool,
}

impl DiffCollector {
    pub fn new(root_directory: Option<String>) -> Self {
        Self {
            root_directory,
            repo_verified: AtomicBool::new(false),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        if let Some(root) = &self.root_directory {
            cmd.current_dir(root);
        }
        cmd
    }

    pub async fn ensure_git_repository(&self) -> Result<(), DiffError> {
        if self.repo_verified.load(Ordering::Acquire) {
            return Ok(());
        }

        let output = self
            .command()
            .args(["rev-parse", "--is-inside-work-tree"])
            .output()
            .await
            .map_err(|e| DiffError::NotARepository(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                "current directory is not a git repository".to_string()
            } else {
                stderr
            };
            return Err(DiffError::NotARepository(reason));
        }

        self.repo_verified.store(true, Ordering::Release);
        Ok(())
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, DiffError> {
        self.ensure_git_repository().await?;
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| DiffError::Vcs {
                command: format!("git {}", args.join(" ")),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DiffError::Vcs {
                command: format!("git {}", args.join(" ")),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Runs a git command whose return code (0 or 1) conveys a boolean
    /// result rather than failure (`git diff --quiet`-style invocations).
    async fn run_git_quiet(&self, args: &[&str]) -> Result<bool, DiffError> {
        self.ensure_git_repository().await?;
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| DiffError::Vcs {
                command: format!("git {}", args.join(" ")),
                stderr: e.to_string(),
            })?;

        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Err(DiffError::Vcs {
                    command: format!("git {}", args.join(" ")),
                    stderr,
                })
            }
        }
    }

    pub async fn has_working_changes(&self) -> Result<bool, DiffError> {
        self.run_git_quiet(&["diff", "--quiet"]).await
    }

    pub async fn has_staged_changes(&self) -> Result<bool, DiffError> {
        self.run_git_quiet(&["diff", "--cached", "--quiet"]).await
    }

    pub async fn detect_base_branch(&self) -> Result<String, DiffError> {
        let output = self.run_git(&["branch", "--list"]).await?;
        let branches: Vec<String> = output
            .lines()
            .map(|l| l.replace('*', "").trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        if branches.iter().any(|b| b == "main") {
            return Ok("main".to_string());
        }
        if branches.iter().any(|b| b == "master") {
            return Ok("master".to_string());
        }
        Err(DiffError::NoBaseBranch)
    }

    async fn branch_has_pr_changes(&self, base_branch: &str) -> bool {
        if self.run_git(&["fetch", "origin", base_branch]).await.is_err() {
            return false;
        }

        let spec = format!("origin/{base_branch}...HEAD");
        let output = match self
            .run_git(&["rev-list", "--left-right", "--count", &spec])
            .await
        {
            Ok(out) => out,
            Err(_) => return false,
        };

        let parts: Vec<&str> = output.trim().split_whitespace().collect();
        parts
            .get(1)
            .and_then(|s| s.parse::<i64>().ok())
            .map(|ahead| ahead > 0)
            .unwrap_or(false)
    }

    async fn auto_detect_mode(&self) -> Result<DiffMode, DiffError> {
        if self.has_staged_changes().await? {
            return Ok(DiffMode::Staged);
        }
        if self.has_working_changes().await? {
            return Ok(DiffMode::Working);
        }

        let base_branch = self.detect_base_branch().await?;
        if self.branch_has_pr_changes(&base_branch).await {
            return Ok(DiffMode::Pr);
        }

        Err(DiffError::NoDiffDetected("auto".to_string()))
    }

    /// Collects diff text for the requested mode.
    ///
    /// An empty diff after a successful git invocation is not an error: the
    /// caller gets `(empty_string, mode, base)` and an empty plan downstream
    /// (spec §4.1).
    pub async fn get_diff_text(
        &self,
        mode: DiffMode,
        base_branch: Option<&str>,
        commit_from: Option<&str>,
        commit_to: Option<&str>,
    ) -> Result<(String, DiffMode, Option<String>), DiffError> {
        match mode {
            DiffMode::Auto => {
                let resolved = self.auto_detect_mode().await?;
                Box::pin(self.get_diff_text(resolved, base_branch, commit_from, commit_to)).await
            }
            DiffMode::Working => {
                let text = self.run_git(&["diff"]).await?;
                Ok((text, DiffMode::Working, None))
            }
            DiffMode::Staged => {
                let text = self.run_git(&["diff", "--cached"]).await?;
                Ok((text, DiffMode::Staged, None))
            }
            DiffMode::Pr => {
                let actual_base = match base_branch {
                    Some(b) => b.to_string(),
                    None => self.detect_base_branch().await?,
                };
                self.run_git(&["fetch", "origin", &actual_base]).await?;
                let spec = format!("origin/{actual_base}...HEAD");
                let text = self.run_git(&["diff", &spec]).await?;
                Ok((text, DiffMode::Pr, Some(actual_base)))
            }
            DiffMode::Commit => {
                let from = commit_from.ok_or(DiffError::MissingCommitFrom)?;
                let text = match commit_to {
                    Some(to) => {
                        let spec = format!("{from}..{to}");
                        self.run_git(&["diff", &spec]).await?
                    }
                    None => self.run_git(&["diff", from]).await?,
                };
                Ok((text, DiffMode::Commit, None))
            }
        }
    }
}

impl Default for DiffCollector {
    fn default() -> Self {
        Self::new(None)
    }
}

pub fn warn_non_fatal_diff_error(stage: &str, err: &DiffError) {
    warn!(stage, error = %err, "diff collection degraded");
    debug!(?err, "full diff error detail");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_mode_without_from_is_input_error() {
        // MissingCommitFrom is reachable directly from get_diff_text's match
        // arm; exercised here without a real repository.
        let err = DiffError::MissingCommitFrom;
        assert_eq!(err.to_string(), "commit mode requires commit_from");
    }

    #[tokio::test]
    async fn ensure_git_repository_memoizes_after_first_success() {
        // Not inside any particular repo assumption here: we only check the
        // memoization path doesn't re-run once the flag is set manually.
        let collector = DiffCollector::new(None);
        collector.repo_verified.store(true, Ordering::Release);
        assert!(collector.ensure_git_repository().await.is_ok());
    }
}
