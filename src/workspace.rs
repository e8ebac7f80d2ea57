//! Workspace isolation — one git worktree and branch per work item.
//!
//! Layout:
//! - `<worktrees_dir>/<slug>/` — the checkout
//! - branch `work/<slug>` — created from the repository HEAD on first use

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::WorkspaceError;
use crate::git::GitRunner;

const BRANCH_PREFIX: &str = "work/";

static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").expect("static slug pattern")
});

/// An existing work-item workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceInfo {
    pub slug: String,
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// What `prune` cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Directories under the worktrees dir git no longer knew about.
    pub removed_dirs: Vec<PathBuf>,
}

pub struct WorkspaceManager {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(repo_path: impl Into<PathBuf>, worktrees_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            worktrees_dir: worktrees_dir.into(),
        }
    }

    fn git(&self) -> GitRunner {
        GitRunner::new(&self.repo_path)
    }

    pub fn branch_name(slug: &str) -> String {
        format!("{BRANCH_PREFIX}{slug}")
    }

    pub fn path_for(&self, slug: &str) -> Result<PathBuf, WorkspaceError> {
        validate_slug(slug)?;
        Ok(self.worktrees_dir.join(slug))
    }

    /// Create (or reuse) the workspace for `slug` and return its path.
    pub async fn create(&self, slug: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.path_for(slug)?;

        if path.exists() {
            if self.is_registered(&path).await? {
                debug!(slug, path = %path.display(), "Workspace already exists");
                return Ok(path);
            }
            // Leftover directory from an abrupt shutdown
            warn!(slug, path = %path.display(), "Replacing unregistered workspace directory");
            fs::remove_dir_all(&path).await?;
        }

        fs::create_dir_all(&self.worktrees_dir).await?;
        let branch = Self::branch_name(slug);
        self.git().worktree_add(&path, &branch, "HEAD").await?;

        info!(slug, branch = %branch, path = %path.display(), "Created workspace");
        Ok(path)
    }

    /// Remove the workspace for `slug`, optionally deleting its branch.
    pub async fn remove(&self, slug: &str, delete_branch: bool) -> Result<(), WorkspaceError> {
        let path = self.path_for(slug)?;
        let registered = self.is_registered(&path).await?;

        if !registered && !path.exists() {
            return Err(WorkspaceError::NotFound(slug.to_string()));
        }

        if registered {
            if let Err(e) = self.git().worktree_remove(&path).await {
                debug!(slug, error = %e, "git worktree remove failed, removing directory");
                if path.exists() {
                    fs::remove_dir_all(&path).await?;
                }
                self.git().worktree_prune().await?;
            }
        } else {
            fs::remove_dir_all(&path).await?;
        }

        if delete_branch && self.git().delete_branch(&Self::branch_name(slug)).await? {
            info!(slug, "Deleted workspace branch");
        }

        info!(slug, path = %path.display(), "Removed workspace");
        Ok(())
    }

    /// Workspaces git knows about under the worktrees directory.
    pub async fn list(&self) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        let root = canonical_or_self(&self.worktrees_dir);
        let mut workspaces: Vec<WorkspaceInfo> = self
            .git()
            .worktree_list()
            .await?
            .into_iter()
            .filter(|entry| !entry.prunable)
            .filter_map(|entry| {
                let path = canonical_or_self(&entry.path);
                let slug = path.strip_prefix(&root).ok()?.to_str()?.to_string();
                if slug.is_empty() || slug.contains('/') {
                    return None;
                }
                Some(WorkspaceInfo {
                    slug,
                    path: entry.path,
                    branch: entry.branch,
                })
            })
            .collect();
        workspaces.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(workspaces)
    }

    /// Clean up after abrupt terminations: drop stale worktree references
    /// and delete directories git no longer tracks.
    pub async fn prune(&self) -> Result<PruneReport, WorkspaceError> {
        self.git().worktree_prune().await?;

        let mut report = PruneReport::default();
        if !self.worktrees_dir.exists() {
            return Ok(report);
        }

        let live: Vec<PathBuf> = self.list().await?.into_iter().map(|w| w.path).collect();
        let live: Vec<PathBuf> = live.iter().map(|p| canonical_or_self(p)).collect();

        let mut dir = fs::read_dir(&self.worktrees_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            if live.contains(&canonical_or_self(&path)) {
                continue;
            }
            warn!(path = %path.display(), "Removing stale workspace directory");
            if let Err(e) = fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove stale workspace");
                continue;
            }
            report.removed_dirs.push(path);
        }

        Ok(report)
    }

    async fn is_registered(&self, path: &Path) -> Result<bool, WorkspaceError> {
        let target = canonical_or_self(path);
        Ok(self
            .git()
            .worktree_list()
            .await?
            .iter()
            .any(|entry| !entry.prunable && canonical_or_self(&entry.path) == target))
    }
}

/// Work item slugs become directory and branch names.
pub fn validate_slug(slug: &str) -> Result<(), WorkspaceError> {
    if SLUG_RE.is_match(slug) && !slug.contains("..") {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidSlug(slug.to_string()))
    }
}

fn canonical_or_self(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
