//! One isolated git worktree per run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::guardrails::ChangedFile;
use crate::error::OrxError;
use crate::io::git::Git;
use crate::io::paths::{ORX_DIR, OrxPaths};

/// Paths never reported as agent changes.
const DIFF_EXCLUDES: &[&str] = &[ORX_DIR];

/// An isolated working copy and the revision it was branched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub path: PathBuf,
    pub baseline_sha: String,
}

impl Workspace {
    pub fn git(&self) -> Git {
        Git::new(&self.path)
    }

    pub fn exists(&self) -> bool {
        self.path.join(".git").exists()
    }

    /// Patch against the baseline. The single source of truth for "what changed".
    pub fn diff(&self) -> Result<String> {
        self.git().diff_against(&self.baseline_sha, DIFF_EXCLUDES)
    }

    pub fn changed_files(&self) -> Result<Vec<ChangedFile>> {
        self.git().changed_files(&self.baseline_sha, DIFF_EXCLUDES)
    }

    /// Commit everything outside `.orx/`. Returns false when there was nothing to commit.
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.git().commit_all(message, DIFF_EXCLUDES)
    }
}

/// Creates, validates and destroys run worktrees for one repository.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    repo: Git,
    worktrees_dir: PathBuf,
    orx_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(paths: &OrxPaths) -> Self {
        Self {
            repo: Git::new(&paths.root),
            worktrees_dir: paths.worktrees_dir.clone(),
            orx_dir: paths.orx_dir.clone(),
        }
    }

    pub fn repo(&self) -> &Git {
        &self.repo
    }

    pub fn worktree_path(&self, run_id: &str) -> PathBuf {
        self.worktrees_dir.join(run_id)
    }

    /// Resolve `base_branch` or fail with [`OrxError::BaseBranchNotFound`].
    pub fn resolve_base(&self, base_branch: &str) -> Result<String> {
        match self.repo.resolve_commit(base_branch)? {
            Some(sha) => Ok(sha),
            None => Err(OrxError::BaseBranchNotFound {
                branch: base_branch.to_string(),
            }
            .into()),
        }
    }

    /// Create a detached worktree for `run_id` at the tip of `base_branch`.
    #[instrument(skip_all, fields(run_id, base_branch))]
    pub fn create(&self, run_id: &str, base_branch: &str) -> Result<Workspace> {
        let baseline_sha = self.resolve_base(base_branch)?;
        self.ensure_orx_ignored()?;
        let path = self.worktree_path(run_id);
        if path.exists() {
            warn!(path = %path.display(), "stale worktree directory, removing");
            self.remove_dir(&path)?;
        }
        fs::create_dir_all(&self.worktrees_dir)
            .with_context(|| format!("create {}", self.worktrees_dir.display()))?;
        self.repo.worktree_add_detached(&path, &baseline_sha)?;
        info!(path = %path.display(), baseline_sha = %baseline_sha, "workspace created");
        Ok(Workspace { path, baseline_sha })
    }

    /// Recreate a missing worktree at a recorded baseline (resume after cleanup or crash).
    #[instrument(skip_all, fields(run_id))]
    pub fn restore(&self, run_id: &str, baseline_sha: &str) -> Result<Workspace> {
        let workspace = Workspace {
            path: self.worktree_path(run_id),
            baseline_sha: baseline_sha.to_string(),
        };
        if workspace.exists() {
            debug!("workspace present");
            return Ok(workspace);
        }
        if workspace.path.exists() {
            self.remove_dir(&workspace.path)?;
        }
        self.repo.worktree_prune()?;
        fs::create_dir_all(&self.worktrees_dir)
            .with_context(|| format!("create {}", self.worktrees_dir.display()))?;
        self.repo.worktree_add_detached(&workspace.path, baseline_sha)?;
        info!(path = %workspace.path.display(), "workspace recreated at baseline");
        Ok(workspace)
    }

    /// Warn (never fail) when the baseline has drifted from the configured branch.
    ///
    /// Returns the warnings emitted so callers can record them.
    pub fn validate_baseline(
        &self,
        workspace: &Workspace,
        base_branch: &str,
        remote: &str,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        match self.repo.resolve_commit(base_branch) {
            Ok(Some(tip)) if tip != workspace.baseline_sha => warnings.push(format!(
                "baseline {} is not the tip of {base_branch} ({tip})",
                short(&workspace.baseline_sha)
            )),
            Ok(None) => warnings.push(format!("base branch {base_branch} no longer resolves")),
            Err(err) => warnings.push(format!("could not resolve {base_branch}: {err:#}")),
            _ => {}
        }
        let remote_ref = format!("refs/remotes/{remote}/{base_branch}");
        if let Ok(Some(remote_tip)) = self.repo.resolve_commit(&remote_ref)
            && remote_tip != workspace.baseline_sha
        {
            warnings.push(format!(
                "baseline {} differs from {remote}/{base_branch} ({}); local branch may be stale",
                short(&workspace.baseline_sha),
                short(&remote_tip)
            ));
        }
        for warning in &warnings {
            warn!(%warning, "base branch validation");
        }
        warnings
    }

    /// Remove the worktree directory and its git metadata. Missing worktrees are fine.
    #[instrument(skip_all, fields(path = %workspace_path.display()))]
    pub fn destroy(&self, workspace_path: &Path) -> Result<()> {
        if workspace_path.exists()
            && let Err(err) = self.repo.worktree_remove(workspace_path)
        {
            warn!(err = %err, "git worktree remove failed, deleting directory");
            self.remove_dir(workspace_path)?;
        }
        self.repo.worktree_prune()?;
        debug!("workspace destroyed");
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))
    }

    /// Keep `.orx/` out of the host repository's status.
    pub fn ensure_orx_ignored(&self) -> Result<()> {
        let gitignore = self.orx_dir.join(".gitignore");
        if gitignore.exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.orx_dir)
            .with_context(|| format!("create {}", self.orx_dir.display()))?;
        fs::write(&gitignore, "*\n").with_context(|| format!("write {}", gitignore.display()))
    }
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}
