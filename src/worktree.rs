// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree isolation for parallel tasks.
//!
//! Each running task owns one worktree at
//! `{project}/.auto-claude/worktrees/tasks/{specId}` on a branch named
//! `auto/{specId}`, so parallel tasks never share a working copy.
//!
//! A worktree is valid only when all three hold:
//!
//! 1. its `.git` is a regular *file* (not a directory),
//! 2. that file resolves into `{mainRepo}/.git/worktrees/`,
//! 3. `git worktree list` contains the path.
//!
//! Any failure forces recreation; an invalid worktree is never reused.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::PRIVATE_DIR;

/// Error type for worktree operations.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Invalid worktree at {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("Worktree creation failed: {0}")]
    CreationFailed(String),

    #[error("Worktree removal failed after retries: {0}")]
    RemovalFailed(String),
}

/// Outcome of a merge-back attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merge commit created.
    Merged,
    /// Nothing to merge; branch already contained in the base.
    UpToDate,
    /// Conflicting paths left in the index.
    Conflicts(Vec<String>),
}

/// A held worktree, recorded in the plan's `worktreePath`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeHandle {
    pub spec_id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Parsed entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub is_bare: bool,
    pub is_detached: bool,
}

/// Manages per-task worktrees for one project repository.
pub struct WorktreeManager {
    repo_root: PathBuf,
    base_branch: String,
}

impl WorktreeManager {
    pub fn new(repo_root: impl AsRef<Path>, base_branch: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            base_branch: base_branch.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Directory a task's worktree lives at.
    pub fn path_for(&self, spec_id: &str) -> PathBuf {
        self.repo_root
            .join(PRIVATE_DIR)
            .join("worktrees")
            .join("tasks")
            .join(spec_id)
    }

    /// Branch a task's worktree is checked out on.
    pub fn branch_for(&self, spec_id: &str) -> String {
        format!("auto/{spec_id}")
    }

    /// Run a git command and return trimmed stdout.
    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(WorktreeError::Git(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// List registered worktrees of the main repository.
    pub async fn list(&self) -> Result<Vec<WorktreeEntry>, WorktreeError> {
        let output = self
            .git(&self.repo_root, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&output))
    }

    /// Acquire a valid worktree for a task, reusing an existing one only if
    /// it passes the validity check with the expected branch.
    pub async fn acquire(&self, spec_id: &str) -> Result<WorktreeHandle, WorktreeError> {
        let path = self.path_for(spec_id);
        let branch = self.branch_for(spec_id);

        if path.exists() {
            match self.verify(spec_id).await {
                Ok(()) => {
                    let current = self
                        .git(&path, &["branch", "--show-current"])
                        .await
                        .unwrap_or_default();
                    if current == branch {
                        debug!(spec_id, path = %path.display(), "reusing valid worktree");
                        return Ok(WorktreeHandle {
                            spec_id: spec_id.to_string(),
                            path,
                            branch,
                        });
                    }
                    info!(spec_id, expected = %branch, actual = %current,
                        "worktree on wrong branch, recreating");
                }
                Err(e) => {
                    info!(spec_id, error = %e, "invalid worktree, recreating");
                }
            }
            self.force_remove(spec_id).await;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // A leftover branch from an earlier run blocks `git worktree add`;
        // a detached checkout followed by `checkout -B` sidesteps it.
        let path_str = path.to_string_lossy().to_string();
        self.git(
            &self.repo_root,
            &["worktree", "add", "--detach", &path_str, &self.base_branch],
        )
        .await
        .map_err(|e| WorktreeError::CreationFailed(e.to_string()))?;

        self.git(&path, &["checkout", "-B", &branch])
            .await
            .map_err(|e| WorktreeError::CreationFailed(e.to_string()))?;

        self.verify(spec_id).await?;
        info!(spec_id, path = %path.display(), branch = %branch, "worktree created");

        Ok(WorktreeHandle {
            spec_id: spec_id.to_string(),
            path,
            branch,
        })
    }

    /// The three-part validity check. All must hold.
    pub async fn verify(&self, spec_id: &str) -> Result<(), WorktreeError> {
        let path = self.path_for(spec_id);

        check_git_link_file(&self.repo_root, &path)?;

        let listed = self
            .list()
            .await?
            .iter()
            .any(|entry| paths_equivalent(&entry.path, &path));
        if !listed {
            return Err(WorktreeError::Invalid {
                path,
                reason: "not present in `git worktree list`".to_string(),
            });
        }
        Ok(())
    }

    /// Merge a task branch back into the base branch.
    ///
    /// Runs in the main repository, never inside the worktree. Callers hold
    /// the project-wide merge mutex; this type does not serialize on its own.
    pub async fn merge_back(&self, spec_id: &str) -> Result<MergeOutcome, WorktreeError> {
        let branch = self.branch_for(spec_id);

        self.git(&self.repo_root, &["checkout", &self.base_branch])
            .await?;

        match self
            .git(&self.repo_root, &["merge", "--no-ff", &branch])
            .await
        {
            Ok(out) if out.contains("Already up to date") => Ok(MergeOutcome::UpToDate),
            Ok(_) => Ok(MergeOutcome::Merged),
            Err(_) => {
                let conflicts = self
                    .git(
                        &self.repo_root,
                        &["diff", "--name-only", "--diff-filter=U"],
                    )
                    .await
                    .unwrap_or_default();
                let files: Vec<String> = conflicts
                    .lines()
                    .map(str::to_string)
                    .filter(|l| !l.is_empty())
                    .collect();
                if files.is_empty() {
                    Err(WorktreeError::Git(format!(
                        "merge of {branch} failed without conflict markers"
                    )))
                } else {
                    Ok(MergeOutcome::Conflicts(files))
                }
            }
        }
    }

    /// Abort an in-progress merge in the main repository.
    pub async fn abort_merge(&self) -> Result<(), WorktreeError> {
        self.git(&self.repo_root, &["merge", "--abort"]).await?;
        Ok(())
    }

    /// Destroy a task's worktree and best-effort delete its branch.
    ///
    /// A removal failing with "busy" is retried with exponential backoff up
    /// to ~30 seconds; persistent failure is logged but does not fail the
    /// task (callers treat this as best-effort cleanup).
    pub async fn destroy(&self, spec_id: &str) -> Result<(), WorktreeError> {
        let path = self.path_for(spec_id);
        let branch = self.branch_for(spec_id);
        let path_str = path.to_string_lossy().to_string();

        let mut delay = Duration::from_secs(2);
        let mut waited = Duration::ZERO;
        let mut last_err = String::new();
        let mut removed = false;

        loop {
            match self
                .git(&self.repo_root, &["worktree", "remove", "--force", &path_str])
                .await
            {
                Ok(_) => {
                    removed = true;
                    break;
                }
                Err(WorktreeError::Git(msg)) if !path.exists() => {
                    debug!(spec_id, msg, "worktree already gone");
                    removed = true;
                    break;
                }
                Err(e) => {
                    last_err = e.to_string();
                    let busy = last_err.contains("locked")
                        || last_err.contains("busy")
                        || last_err.contains("in use");
                    if !busy || waited >= Duration::from_secs(30) {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                    waited += delay;
                    delay = (delay * 2).min(Duration::from_secs(8));
                }
            }
        }

        if !removed {
            // Manual fallback, then prune stale registry entries.
            if path.exists() {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!(spec_id, error = %e, "manual worktree removal failed");
                    let _ = self.git(&self.repo_root, &["worktree", "prune"]).await;
                    return Err(WorktreeError::RemovalFailed(last_err));
                }
            }
            let _ = self.git(&self.repo_root, &["worktree", "prune"]).await;
        }

        let _ = self.git(&self.repo_root, &["branch", "-D", &branch]).await;
        info!(spec_id, "worktree destroyed");
        Ok(())
    }

    /// Remove without error reporting, for the recreate path.
    async fn force_remove(&self, spec_id: &str) {
        let path = self.path_for(spec_id);
        let path_str = path.to_string_lossy().to_string();
        let _ = self
            .git(&self.repo_root, &["worktree", "remove", "--force", &path_str])
            .await;
        if path.exists() {
            let _ = std::fs::remove_dir_all(&path);
        }
        let _ = self.git(&self.repo_root, &["worktree", "prune"]).await;
    }
}

/// Checks 1 and 2: `.git` must be a regular file whose `gitdir:` pointer
/// resolves into the main repository's `.git/worktrees/` registry.
fn check_git_link_file(repo_root: &Path, worktree_path: &Path) -> Result<(), WorktreeError> {
    let git_link = worktree_path.join(".git");

    let meta = std::fs::metadata(&git_link).map_err(|_| WorktreeError::Invalid {
        path: worktree_path.to_path_buf(),
        reason: ".git missing".to_string(),
    })?;
    if meta.is_dir() {
        return Err(WorktreeError::Invalid {
            path: worktree_path.to_path_buf(),
            reason: ".git is a directory, not a worktree link file".to_string(),
        });
    }

    let content = std::fs::read_to_string(&git_link)?;
    let gitdir = content
        .lines()
        .find_map(|line| line.strip_prefix("gitdir:"))
        .map(str::trim)
        .ok_or_else(|| WorktreeError::Invalid {
            path: worktree_path.to_path_buf(),
            reason: ".git file carries no gitdir pointer".to_string(),
        })?;

    let registry = repo_root.join(".git").join("worktrees");
    let gitdir_path = PathBuf::from(gitdir);
    let inside = canonical_or_self(&gitdir_path).starts_with(canonical_or_self(&registry));
    if !inside {
        return Err(WorktreeError::Invalid {
            path: worktree_path.to_path_buf(),
            reason: format!("gitdir `{gitdir}` does not resolve into the main repository"),
        });
    }
    Ok(())
}

fn canonical_or_self(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn paths_equivalent(a: &Path, b: &Path) -> bool {
    canonical_or_self(a) == canonical_or_self(b)
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current = WorktreeEntry::default();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if !current.path.as_os_str().is_empty() {
                entries.push(std::mem::take(&mut current));
            }
            current.path = PathBuf::from(path);
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current.branch = Some(branch.to_string());
        } else if line == "bare" {
            current.is_bare = true;
        } else if line == "detached" {
            current.is_detached = true;
        }
    }
    if !current.path.as_os_str().is_empty() {
        entries.push(current);
    }
    entries
}
