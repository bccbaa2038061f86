//! Read-only view of a finished run for the knowledge stage.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::backlog::parse_backlog;
use crate::core::evidence::{LOG_TAIL_LINES, tail_lines};
use crate::io::artifacts::{ArtifactKey, ArtifactStore};
use crate::io::meta::ItemOutcome;
use crate::io::paths::RunPaths;
use crate::io::workspace::Workspace;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvidencePack {
    pub spec: String,
    pub backlog_yaml: String,
    pub changed_files: Vec<String>,
    pub patch_diff: String,
    pub review: Option<String>,
    /// Gate log file stem → last lines of the log.
    pub gate_logs: BTreeMap<String, String>,
    pub item_outcomes: Vec<ItemOutcome>,
}

impl EvidencePack {
    /// Gather artifacts, the workspace diff and gate logs. Never mutates anything.
    pub fn collect(
        artifacts: &ArtifactStore,
        paths: &RunPaths,
        workspace: &Workspace,
    ) -> Result<Self> {
        let backlog_yaml = artifacts.read(ArtifactKey::Backlog)?.unwrap_or_default();
        let item_outcomes = if backlog_yaml.trim().is_empty() {
            Vec::new()
        } else {
            parse_backlog(&backlog_yaml)?
                .items
                .into_iter()
                .map(|item| ItemOutcome {
                    id: item.id,
                    title: item.title,
                    status: item.status,
                    attempts: item.attempts,
                })
                .collect()
        };
        let patch_diff = match artifacts.read(ArtifactKey::PatchDiff)? {
            Some(diff) => diff,
            None => workspace.diff()?,
        };
        let changed_files = workspace
            .changed_files()?
            .into_iter()
            .map(|file| file.path)
            .collect();

        Ok(Self {
            spec: artifacts.read(ArtifactKey::Spec)?.unwrap_or_default(),
            backlog_yaml,
            changed_files,
            patch_diff,
            review: artifacts.read(ArtifactKey::Review)?,
            gate_logs: read_gate_logs(paths)?,
            item_outcomes,
        })
    }
}

fn read_gate_logs(paths: &RunPaths) -> Result<BTreeMap<String, String>> {
    let mut logs = BTreeMap::new();
    if !paths.logs_dir.exists() {
        return Ok(logs);
    }
    for entry in fs::read_dir(&paths.logs_dir)
        .with_context(|| format!("read {}", paths.logs_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("read {}", paths.logs_dir.display()))?
            .path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !stem.starts_with("gate_") {
            continue;
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        logs.insert(stem.to_string(), tail_lines(&contents, LOG_TAIL_LINES));
    }
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backlog::{Backlog, WorkItem, WorkItemStatus};
    use crate::io::paths::OrxPaths;
    use crate::io::workspace::WorkspaceManager;
    use crate::test_support::TestRepo;

    #[test]
    fn collects_artifacts_diff_and_gate_logs() {
        let repo = TestRepo::new().expect("repo");
        let orx = OrxPaths::new(repo.path());
        let paths = orx.run("r1");
        paths.create_dirs().expect("dirs");
        let ws = WorkspaceManager::new(&orx).create("r1", "main").expect("ws");
        fs::write(ws.path.join("new.py"), "print(1)\n").expect("write");

        let artifacts = ArtifactStore::new(&paths);
        artifacts.write(ArtifactKey::Spec, "the spec").expect("spec");
        let mut item = WorkItem::new("W001", "One", "Do one");
        item.status = WorkItemStatus::Done;
        item.attempts = 1;
        let backlog = Backlog {
            run_id: Some("r1".to_string()),
            items: vec![item],
        };
        artifacts
            .write(ArtifactKey::Backlog, &backlog.to_yaml().expect("yaml"))
            .expect("backlog");
        fs::write(paths.gate_log("pytest", Some("W001"), Some(1)), "1 passed\n").expect("log");
        fs::write(paths.logs_dir.join("agent_plan.stdout.log"), "plan").expect("log");

        let pack = EvidencePack::collect(&artifacts, &paths, &ws).expect("collect");
        assert_eq!(pack.spec, "the spec");
        assert_eq!(pack.changed_files, vec!["new.py"]);
        assert!(pack.patch_diff.contains("+print(1)"));
        assert_eq!(pack.review, None);
        assert_eq!(pack.item_outcomes.len(), 1);
        assert_eq!(pack.item_outcomes[0].status, WorkItemStatus::Done);
        assert_eq!(
            pack.gate_logs.keys().collect::<Vec<_>>(),
            vec!["gate_pytest_W001_iter_1"]
        );
    }
}
