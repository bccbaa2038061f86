//! Canonical on-disk layout under `.orx/`.
//!
//! ```text
//! <root>/.orx/
//!   runs/<run_id>/{state.json, meta.json, context/, prompts/, artifacts/, logs/}
//!   worktrees/<run_id>/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::stage::Stage;

pub const ORX_DIR: &str = ".orx";

/// Paths shared by every run of one repository.
#[derive(Debug, Clone)]
pub struct OrxPaths {
    pub root: PathBuf,
    pub orx_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub worktrees_dir: PathBuf,
}

impl OrxPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let orx_dir = root.join(ORX_DIR);
        Self {
            root: root.clone(),
            runs_dir: orx_dir.join("runs"),
            worktrees_dir: orx_dir.join("worktrees"),
            orx_dir,
        }
    }

    pub fn run(&self, run_id: &str) -> RunPaths {
        RunPaths::new(self, run_id)
    }

    /// Run ids with a directory under `runs/`, sorted ascending (oldest first).
    pub fn list_run_ids(&self) -> Result<Vec<String>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)
            .with_context(|| format!("read {}", self.runs_dir.display()))?
        {
            let entry = entry.with_context(|| format!("read {}", self.runs_dir.display()))?;
            if entry.path().is_dir() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// All paths scoped to one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub worktree: PathBuf,
    pub state_path: PathBuf,
    pub meta_path: PathBuf,
    pub context_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl RunPaths {
    pub fn new(base: &OrxPaths, run_id: &str) -> Self {
        let run_dir = base.runs_dir.join(run_id);
        Self {
            run_id: run_id.to_string(),
            worktree: base.worktrees_dir.join(run_id),
            state_path: run_dir.join("state.json"),
            meta_path: run_dir.join("meta.json"),
            context_dir: run_dir.join("context"),
            prompts_dir: run_dir.join("prompts"),
            artifacts_dir: run_dir.join("artifacts"),
            logs_dir: run_dir.join("logs"),
            run_dir,
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            &self.run_dir,
            &self.context_dir,
            &self.prompts_dir,
            &self.artifacts_dir,
            &self.logs_dir,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    /// stdout/stderr log pair for one executor invocation.
    pub fn agent_logs(
        &self,
        stage: Stage,
        item_id: Option<&str>,
        iteration: Option<u32>,
    ) -> LogPaths {
        let stem = invocation_stem("agent", stage, item_id, iteration);
        LogPaths {
            stdout: self.logs_dir.join(format!("{stem}.stdout.log")),
            stderr: self.logs_dir.join(format!("{stem}.stderr.log")),
        }
    }

    pub fn prompt_path(
        &self,
        stage: Stage,
        item_id: Option<&str>,
        iteration: Option<u32>,
    ) -> PathBuf {
        let stem = invocation_stem("prompt", stage, item_id, iteration);
        self.prompts_dir.join(format!("{stem}.md"))
    }

    pub fn gate_log(&self, gate: &str, item_id: Option<&str>, iteration: Option<u32>) -> PathBuf {
        let mut name = format!("gate_{}", sanitize(gate));
        if let Some(item) = item_id {
            name.push_str(&format!("_{item}"));
        }
        if let Some(iter) = iteration {
            name.push_str(&format!("_iter_{iter}"));
        }
        self.logs_dir.join(format!("{name}.log"))
    }
}

/// Log file pair for a single process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogPaths {
    /// Sibling pair with `suffix` inserted before the extension (`.fallback`).
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            stdout: insert_suffix(&self.stdout, suffix),
            stderr: insert_suffix(&self.stderr, suffix),
        }
    }
}

fn insert_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let renamed = match name.split_once('.') {
        Some((stem, rest)) => format!("{stem}.{suffix}.{rest}"),
        None => format!("{name}.{suffix}"),
    };
    path.with_file_name(renamed)
}

fn invocation_stem(
    prefix: &str,
    stage: Stage,
    item_id: Option<&str>,
    iteration: Option<u32>,
) -> String {
    let mut stem = format!("{prefix}_{}", stage.as_str());
    if let Some(item) = item_id {
        stem.push_str(&format!("_item_{item}"));
    }
    if let Some(iter) = iteration {
        stem.push_str(&format!("_iter_{iter}"));
    }
    stem
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
