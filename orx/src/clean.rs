//! `orx clean`: remove run directories and their worktrees.

use std::collections::BTreeSet;
use std::fs;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::info;

use crate::error::OrxError;
use crate::io::paths::OrxPaths;
use crate::io::run_state::check_run_id;
use crate::io::workspace::WorkspaceManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanTarget {
    Run(String),
    All,
}

impl FromStr for CleanTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => anyhow::bail!("clean target must be a run id or `all`"),
            "all" => Ok(Self::All),
            id => Ok(Self::Run(id.to_string())),
        }
    }
}

/// Delete the selected runs. Returns the ids removed.
pub fn clean(paths: &OrxPaths, target: &CleanTarget) -> Result<Vec<String>> {
    let ids = match target {
        CleanTarget::All => {
            let mut ids: BTreeSet<String> = paths.list_run_ids()?.into_iter().collect();
            ids.extend(worktree_ids(paths)?);
            ids.into_iter().collect()
        }
        CleanTarget::Run(id) => {
            check_run_id(id)?;
            let run = paths.run(id);
            if !run.run_dir.exists() && !run.worktree.exists() {
                return Err(OrxError::RunNotFound {
                    run_id: id.clone(),
                }
                .into());
            }
            vec![id.clone()]
        }
    };

    let workspaces = WorkspaceManager::new(paths);
    for id in &ids {
        let run = paths.run(id);
        workspaces.destroy(&run.worktree)?;
        if run.run_dir.exists() {
            fs::remove_dir_all(&run.run_dir)
                .with_context(|| format!("remove {}", run.run_dir.display()))?;
        }
        info!(run_id = %id, "run removed");
    }
    Ok(ids)
}

fn worktree_ids(paths: &OrxPaths) -> Result<Vec<String>> {
    if !paths.worktrees_dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(&paths.worktrees_dir)
        .with_context(|| format!("read {}", paths.worktrees_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read {}", paths.worktrees_dir.display()))?;
        if entry.path().is_dir() {
            ids.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(ids)
}
