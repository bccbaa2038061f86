//! Human-facing run summary (`meta.json`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::backlog::{Backlog, WorkItemStatus};
use crate::core::stage::{Stage, StageStatus};
use crate::io::run_state::{RunState, now_rfc3339, write_atomic};

pub const TOOL_NAME: &str = "orx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
}

impl ReviewVerdict {
    /// `CHANGES_REQUESTED` anywhere in the review requests changes.
    pub fn from_review(text: &str) -> Self {
        if text.contains("CHANGES_REQUESTED") {
            Self::ChangesRequested
        } else {
            Self::Approved
        }
    }
}

/// One executor invocation, primary or fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorAttempt {
    pub stage: Stage,
    pub item_id: Option<String>,
    pub iteration: Option<u32>,
    pub executor: String,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub fallback: bool,
    pub returncode: Option<i32>,
    pub success: bool,
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub id: String,
    pub title: String,
    pub status: WorkItemStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMeta {
    pub tool: String,
    pub version: String,
    pub run_id: String,
    pub task_summary: String,
    pub base_branch: String,
    pub engine: String,
    pub created_at: String,
    pub updated_at: String,
    pub stage_statuses: BTreeMap<Stage, StageStatus>,
    pub review_verdict: Option<ReviewVerdict>,
    pub items: Vec<ItemOutcome>,
    pub executor_attempts: Vec<ExecutorAttempt>,
    pub warnings: Vec<String>,
}

impl RunMeta {
    pub fn new(run_id: &str, task: &str, base_branch: &str, engine: &str) -> Self {
        let now = now_rfc3339();
        Self {
            tool: TOOL_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            run_id: run_id.to_string(),
            task_summary: summarize(task),
            base_branch: base_branch.to_string(),
            engine: engine.to_string(),
            created_at: now.clone(),
            updated_at: now,
            stage_statuses: BTreeMap::new(),
            review_verdict: None,
            items: Vec::new(),
            executor_attempts: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Copy stage statuses from the checkpoint.
    pub fn sync_state(&mut self, state: &RunState) {
        self.stage_statuses = state
            .stage_statuses
            .iter()
            .map(|(stage, record)| (*stage, record.status))
            .collect();
        self.updated_at = now_rfc3339();
    }

    pub fn sync_backlog(&mut self, backlog: &Backlog) {
        self.items = backlog
            .items
            .iter()
            .map(|item| ItemOutcome {
                id: item.id.clone(),
                title: item.title.clone(),
                status: item.status,
                attempts: item.attempts,
            })
            .collect();
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let meta =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(meta))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(self).context("serialize meta")?;
        buf.push('\n');
        write_atomic(path, &buf)
    }
}

/// First non-empty line of the task, capped at 120 characters.
fn summarize(task: &str) -> String {
    let line = task
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let mut summary: String = line.chars().take(120).collect();
    if line.chars().count() > 120 {
        summary.push_str("...");
    }
    summary
}
