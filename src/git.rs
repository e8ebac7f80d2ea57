//! Thin async wrapper around the `git` CLI.

use std::path::{Path, PathBuf};
use std::process::Output;

use chrono::{DateTime, TimeZone, Utc};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::WorkspaceError;

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub prunable: bool,
}

pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output, WorkspaceError> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr.trim(), "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output, WorkspaceError> {
        let output = self.run(args).await?;

        if !output.status.success() {
            return Err(WorkspaceError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output)
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool, WorkspaceError> {
        let output = self
            .run(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .await?;
        Ok(output.status.success())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<bool, WorkspaceError> {
        let output = self.run(&["branch", "-D", branch]).await?;
        Ok(output.status.success())
    }

    /// Check out `branch` into `path`, creating the branch from `base` if needed.
    pub async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<(), WorkspaceError> {
        let path_str = path_str(path)?;
        if self.branch_exists(branch).await? {
            self.run_checked(&["worktree", "add", path_str, branch]).await?;
        } else {
            self.run_checked(&["worktree", "add", "-b", branch, path_str, base])
                .await?;
        }
        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<(), WorkspaceError> {
        self.run_checked(&["worktree", "remove", "--force", path_str(path)?])
            .await?;
        Ok(())
    }

    /// Drop administrative entries for worktrees whose directories are gone.
    pub async fn worktree_prune(&self) -> Result<(), WorkspaceError> {
        self.run_checked(&["worktree", "prune"]).await?;
        Ok(())
    }

    pub async fn worktree_list(&self) -> Result<Vec<WorktreeEntry>, WorkspaceError> {
        let output = self
            .run_checked(&["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Commit time of HEAD, if the repository has any commits.
    pub async fn last_commit_time(&self) -> Result<Option<DateTime<Utc>>, WorkspaceError> {
        let output = self.run(&["log", "-1", "--format=%ct"]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let secs = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<i64>()
            .ok();
        Ok(secs.and_then(|s| Utc.timestamp_opt(s, 0).single()))
    }

    /// Revert the most recent commit without opening an editor.
    pub async fn revert_head(&self) -> Result<(), WorkspaceError> {
        self.run_checked(&["revert", "--no-edit", "HEAD"]).await?;
        Ok(())
    }
}

fn path_str(path: &Path) -> Result<&str, WorkspaceError> {
    path.to_str().ok_or_else(|| {
        WorkspaceError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("non UTF-8 path: {}", path.display()),
        ))
    })
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
                prunable: false,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(branch) = line.strip_prefix("branch ") {
                entry.branch = Some(branch.trim_start_matches("refs/heads/").to_string());
            } else if line.starts_with("prunable") {
                entry.prunable = true;
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}
