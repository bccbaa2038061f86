//! Run checkpoints (`.orx/runs/<run_id>/state.json`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::evidence::EvidenceBundle;
use crate::core::stage::{Stage, StageStatus};
use crate::error::OrxError;
use crate::io::paths::OrxPaths;

static RUN_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}_\d{6}_[0-9a-f]{8}$").expect("run id regex is valid"));

/// Outcome bookkeeping for one stage. Entries are never removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRecord {
    pub status: StageStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

impl StageRecord {
    fn running(now: String) -> Self {
        Self {
            status: StageStatus::Running,
            started_at: Some(now),
            completed_at: None,
            error: None,
        }
    }
}

/// Persisted position of a run. Resume reconstructs the runner from this alone
/// plus the artifacts already on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub run_id: String,
    pub current_stage: Stage,
    pub current_item_id: Option<String>,
    /// Attempts made on `current_item_id` so far.
    pub current_iteration: Option<u32>,
    pub baseline_sha: Option<String>,
    pub stage_statuses: BTreeMap<Stage, StageRecord>,
    pub last_failure_evidence: Option<EvidenceBundle>,
    /// sha256 of the previous attempt's diff, for the no-progress check.
    pub last_diff_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = now_rfc3339();
        Self {
            run_id: run_id.into(),
            current_stage: Stage::Init,
            current_item_id: None,
            current_iteration: None,
            baseline_sha: None,
            stage_statuses: BTreeMap::new(),
            last_failure_evidence: None,
            last_diff_hash: None,
            failure_reason: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// `done` and `failed` runs cannot be resumed.
    pub fn is_resumable(&self) -> bool {
        !self.current_stage.is_terminal()
    }

    pub fn status_of(&self, stage: Stage) -> StageStatus {
        self.stage_statuses
            .get(&stage)
            .map_or(StageStatus::Pending, |record| record.status)
    }

    /// Move to `stage`, completing the stage that was running.
    pub fn transition_to(&mut self, stage: Stage) {
        let previous = self.current_stage;
        if previous != stage && self.status_of(previous) == StageStatus::Running {
            self.mark_stage_completed(previous);
        }
        if previous == Stage::ImplementItem && stage != Stage::ImplementItem {
            self.current_item_id = None;
            self.current_iteration = None;
        }
        self.current_stage = stage;
        if !stage.is_terminal() && stage != Stage::Init {
            self.stage_statuses
                .insert(stage, StageRecord::running(now_rfc3339()));
        }
        self.touch();
    }

    pub fn mark_stage_completed(&mut self, stage: Stage) {
        let now = now_rfc3339();
        let record = self
            .stage_statuses
            .entry(stage)
            .or_insert_with(|| StageRecord::running(now.clone()));
        record.status = StageStatus::Success;
        record.completed_at = Some(now);
        record.error = None;
        self.touch();
    }

    pub fn mark_stage_failed(&mut self, stage: Stage, error: impl Into<String>) {
        let now = now_rfc3339();
        let record = self
            .stage_statuses
            .entry(stage)
            .or_insert_with(|| StageRecord::running(now.clone()));
        record.status = StageStatus::Failed;
        record.completed_at = Some(now);
        record.error = Some(error.into());
        self.touch();
    }

    /// Mark the current stage failed and enter the absorbing `failed` stage.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        let stage = self.current_stage;
        if !stage.is_terminal() {
            self.mark_stage_failed(stage, reason.clone());
        }
        self.current_stage = Stage::Failed;
        self.failure_reason = Some(reason);
        self.touch();
    }

    /// Point at a new backlog item; the iteration count restarts from `attempts`.
    pub fn set_current_item(&mut self, item_id: &str, attempts: u32) {
        if self.current_item_id.as_deref() != Some(item_id) {
            self.last_diff_hash = None;
        }
        self.current_item_id = Some(item_id.to_string());
        self.current_iteration = Some(attempts);
        self.touch();
    }

    pub fn increment_iteration(&mut self) -> u32 {
        let next = self.current_iteration.unwrap_or(0) + 1;
        self.current_iteration = Some(next);
        self.touch();
        next
    }

    /// The baseline is recorded once; a different value later is a logic error.
    pub fn set_baseline_sha(&mut self, sha: &str) -> Result<()> {
        match &self.baseline_sha {
            Some(existing) if existing != sha => bail!(
                "baseline_sha already set to {existing}, refusing to change it to {sha}"
            ),
            Some(_) => Ok(()),
            None => {
                self.baseline_sha = Some(sha.to_string());
                self.touch();
                Ok(())
            }
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_rfc3339();
    }
}

/// Serialized checkpoint reads and writes for every run of one repository.
#[derive(Debug)]
pub struct StateManager {
    runs_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StateManager {
    pub fn new(paths: &OrxPaths) -> Self {
        Self {
            runs_dir: paths.runs_dir.clone(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn state_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id).join("state.json")
    }

    /// Atomically checkpoint `state` (temp file + rename).
    pub fn save(&self, state: &RunState) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("state write lock poisoned"))?;
        let path = self.state_path(&state.run_id);
        debug!(
            run_id = %state.run_id,
            stage = %state.current_stage,
            item = ?state.current_item_id,
            iteration = ?state.current_iteration,
            "checkpoint"
        );
        let mut buf = serde_json::to_string_pretty(state).context("serialize run state")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    /// Load a checkpoint, failing with [`OrxError::RunNotFound`] when absent.
    pub fn load(&self, run_id: &str) -> Result<RunState> {
        check_run_id(run_id)?;
        let path = self.state_path(run_id);
        if !path.exists() {
            return Err(OrxError::RunNotFound {
                run_id: run_id.to_string(),
            }
            .into());
        }
        load_run_state(&path)
    }

    /// Every readable checkpoint, oldest first. Unreadable ones are skipped.
    pub fn list(&self) -> Result<Vec<RunState>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)
            .with_context(|| format!("read {}", self.runs_dir.display()))?
        {
            let entry = entry.with_context(|| format!("read {}", self.runs_dir.display()))?;
            ids.push(entry.file_name().to_string_lossy().to_string());
        }
        ids.sort();
        let mut states = Vec::new();
        for id in ids {
            let path = self.state_path(&id);
            if !path.exists() {
                continue;
            }
            match load_run_state(&path) {
                Ok(state) => states.push(state),
                Err(err) => {
                    warn!(run_id = %id, err = %format!("{err:#}"), "skipping unreadable state");
                }
            }
        }
        Ok(states)
    }
}

fn load_run_state(path: &Path) -> Result<RunState> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = %state.run_id, stage = %state.current_stage, "run state loaded");
    Ok(state)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// `YYYYMMDD_HHMMSS_<8 hex>` in UTC.
pub fn generate_run_id() -> String {
    format!(
        "{}_{:08x}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        rand::random::<u32>()
    )
}

/// Reject anything that is not a generated run id, so a caller-supplied id
/// can never name a path outside `.orx/`.
pub fn check_run_id(run_id: &str) -> Result<()> {
    if RUN_ID_RE.is_match(run_id) {
        Ok(())
    } else {
        Err(OrxError::RunNotFound {
            run_id: run_id.to_string(),
        }
        .into())
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
