//! Git adapter for workspace isolation and diff capture.
//!
//! Every "what changed" question is answered by git itself against a recorded
//! baseline revision, so we keep a small, explicit wrapper around `git`
//! subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::guardrails::ChangedFile;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if `workdir` is inside a git working tree.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Absolute path of the repository's top-level directory.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Resolve `rev` to a full commit SHA, or `None` if it does not resolve.
    pub fn resolve_commit(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !out.status.success() {
            debug!(rev, "revision does not resolve");
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Return the current HEAD SHA.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Status entries outside the given path prefixes.
    pub fn dirty_paths_except(&self, ignored_prefixes: &[&str]) -> Result<Vec<StatusEntry>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| {
                !ignored_prefixes
                    .iter()
                    .any(|prefix| entry.path.starts_with(prefix))
            })
            .collect())
    }

    /// Create a detached worktree at `path` checked out at `commit`.
    #[instrument(skip_all, fields(path = %path.display(), commit))]
    pub fn worktree_add_detached(&self, path: &Path, commit: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "--detach", &path_str, commit])?;
        Ok(())
    }

    /// Remove a worktree and its administrative metadata.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path_str])?;
        Ok(())
    }

    /// Drop metadata for worktrees whose directories no longer exist.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "--quiet", "-m", message])?;
        Ok(true)
    }

    /// Stage everything except `excludes` and commit. Returns false when nothing changed.
    pub fn commit_all(&self, message: &str, excludes: &[&str]) -> Result<bool> {
        let mut args = vec!["add", "-A", "--", "."];
        let pathspecs = exclude_pathspecs(excludes);
        args.extend(pathspecs.iter().map(String::as_str));
        self.run_checked(&args)?;
        self.commit_staged(message)
    }

    /// Full patch of the working tree (tracked, untracked and committed changes)
    /// relative to `baseline`.
    ///
    /// Untracked files are included by staging, then the index is restored.
    #[instrument(skip_all, fields(baseline))]
    pub fn diff_against(&self, baseline: &str, excludes: &[&str]) -> Result<String> {
        let pathspecs = exclude_pathspecs(excludes);
        self.with_staged(|git| {
            let mut args = vec![
                "diff",
                "--cached",
                "--patch",
                "--no-color",
                "--no-ext-diff",
                "--binary",
                baseline,
                "--",
                ".",
            ];
            args.extend(pathspecs.iter().map(String::as_str));
            git.run_capture(&args)
        })
    }

    /// Files changed relative to `baseline`, with whether each is new.
    pub fn changed_files(&self, baseline: &str, excludes: &[&str]) -> Result<Vec<ChangedFile>> {
        let pathspecs = exclude_pathspecs(excludes);
        let raw = self.with_staged(|git| {
            let mut args = vec![
                "diff",
                "--cached",
                "--name-status",
                "--no-renames",
                baseline,
                "--",
                ".",
            ];
            args.extend(pathspecs.iter().map(String::as_str));
            git.run_capture(&args)
        })?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_name_status_line)
            .collect()
    }

    /// Push `HEAD` to `remote` as `branch`.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_head(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run_checked(&["push", remote, &refspec])?;
        Ok(())
    }

    fn with_staged<T>(&self, f: impl FnOnce(&Git) -> Result<T>) -> Result<T> {
        self.add_all()?;
        let result = f(self);
        if let Err(err) = self.run_checked(&["reset", "--quiet"]) {
            warn!(err = %err, "failed to restore index after diff");
        }
        result
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn exclude_pathspecs(excludes: &[&str]) -> Vec<String> {
    excludes
        .iter()
        .map(|path| format!(":(exclude){path}"))
        .collect()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_name_status_line(line: &str) -> Result<ChangedFile> {
    let (code, path) = line
        .split_once('\t')
        .ok_or_else(|| anyhow!("unexpected name-status line: '{line}'"))?;
    Ok(ChangedFile {
        path: path.trim().to_string(),
        added: code.starts_with('A'),
    })
}
