//! Test-only helpers: a throwaway git repository and scripted collaborators.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::io::executor::{ExecExtra, ExecMode, ExecRequest, ExecResult, Executor};
use crate::io::gates::{Gate, GateRequest, GateResult, GateStatus};
use crate::io::git::Git;

/// A temporary git repository on branch `main` with one commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git_cmd(&["init", "--quiet", "--initial-branch=main"])?;
        repo.git_cmd(&["config", "user.email", "orx@example.com"])?;
        repo.git_cmd(&["config", "user.name", "orx tests"])?;
        repo.git_cmd(&["config", "commit.gpgsign", "false"])?;
        repo.commit_file("README.md", "# fixture\n", "initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    pub fn head_sha(&self) -> Result<String> {
        self.git().head_sha()
    }

    /// Write `contents` to `rel` and commit it on the current branch.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) -> Result<String> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        self.git_cmd(&["add", rel])?;
        self.git_cmd(&["commit", "--quiet", "-m", message])?;
        self.head_sha()
    }

    fn git_cmd(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .status()
            .with_context(|| format!("git {}", args.join(" ")))?;
        if !status.success() {
            bail!("git {} failed with {status}", args.join(" "));
        }
        Ok(())
    }
}

/// One scripted executor response.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Succeed and print `stdout`.
    Text(String),
    /// Succeed after writing files (path relative to cwd, contents).
    Apply(Vec<(String, String)>),
    /// Fail with the given stderr.
    Fail { stderr: String, transient: bool },
}

impl ScriptedStep {
    pub fn text(stdout: &str) -> Self {
        Self::Text(stdout.to_string())
    }

    pub fn apply(files: &[(&str, &str)]) -> Self {
        Self::Apply(
            files
                .iter()
                .map(|(path, contents)| (path.to_string(), contents.to_string()))
                .collect(),
        )
    }

    /// Succeed without touching the workspace.
    pub fn noop() -> Self {
        Self::Apply(Vec::new())
    }

    pub fn failure(stderr: &str) -> Self {
        Self::Fail {
            stderr: stderr.to_string(),
            transient: false,
        }
    }

    pub fn transient_failure() -> Self {
        Self::Fail {
            stderr: "429 Too Many Requests".to_string(),
            transient: true,
        }
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: VecDeque<ScriptedStep>,
    calls: Vec<(ExecMode, String)>,
}

/// Executor that replays a fixed list of steps. Clones share one script.
#[derive(Debug, Clone)]
pub struct ScriptedExecutor {
    name: String,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedExecutor {
    pub fn new(name: &str, steps: Vec<ScriptedStep>) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(ScriptState {
                steps: steps.into(),
                calls: Vec::new(),
            })),
        }
    }

    pub fn calls(&self) -> usize {
        self.state.lock().map(|s| s.calls.len()).unwrap_or_default()
    }

    /// Prompts received so far, with their mode.
    pub fn prompts(&self) -> Vec<(ExecMode, String)> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().map(|s| s.steps.len()).unwrap_or_default()
    }

    fn play(&self, mode: ExecMode, request: &ExecRequest) -> Result<ExecResult> {
        let step = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow!("script lock poisoned"))?;
            state.calls.push((mode, request.prompt.clone()));
            state
                .steps
                .pop_front()
                .ok_or_else(|| anyhow!("{} script exhausted", self.name))?
        };
        let (stdout, stderr, returncode, transient) = match step {
            ScriptedStep::Text(stdout) => (stdout, String::new(), 0, false),
            ScriptedStep::Apply(files) => {
                if mode == ExecMode::Text {
                    bail!("{}: apply step scripted for a text invocation", self.name);
                }
                for (rel, contents) in &files {
                    let path = request.cwd.join(rel);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&path, contents)
                        .with_context(|| format!("write {}", path.display()))?;
                }
                (format!("wrote {} files", files.len()), String::new(), 0, false)
            }
            ScriptedStep::Fail { stderr, transient } => (String::new(), stderr, 1, transient),
        };
        write_log(&request.logs.stdout, &stdout)?;
        write_log(&request.logs.stderr, &stderr)?;
        let success = returncode == 0;
        Ok(ExecResult {
            returncode: Some(returncode),
            stdout_path: request.logs.stdout.clone(),
            stderr_path: request.logs.stderr.clone(),
            success,
            error_message: (!success).then(|| format!("exit code {returncode}: {stderr}")),
            extra: ExecExtra {
                transient,
                ..ExecExtra::default()
            },
        })
    }
}

fn write_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn run_text(&self, request: &ExecRequest) -> Result<ExecResult> {
        self.play(ExecMode::Text, request)
    }

    fn run_apply(&self, request: &ExecRequest) -> Result<ExecResult> {
        self.play(ExecMode::Apply, request)
    }
}

/// Gate that replays scripted statuses; the last status repeats once the
/// script runs out.
#[derive(Debug, Clone)]
pub struct ScriptedGate {
    name: String,
    required: bool,
    statuses: Arc<Mutex<VecDeque<(GateStatus, Option<i32>)>>>,
    runs: Arc<Mutex<Vec<PathBuf>>>,
}

impl ScriptedGate {
    pub fn new(name: &str, required: bool, statuses: &[(GateStatus, Option<i32>)]) -> Self {
        Self {
            name: name.to_string(),
            required,
            statuses: Arc::new(Mutex::new(statuses.iter().copied().collect())),
            runs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn passing(name: &str) -> Self {
        Self::new(name, true, &[(GateStatus::Passed, Some(0))])
    }

    pub fn runs(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or_default()
    }
}

impl Gate for ScriptedGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn required(&self) -> bool {
        self.required
    }

    fn run(&self, request: &GateRequest) -> Result<GateResult> {
        let (status, returncode) = {
            let mut statuses = self
                .statuses
                .lock()
                .map_err(|_| anyhow!("gate script lock poisoned"))?;
            let next = if statuses.len() > 1 {
                statuses.pop_front()
            } else {
                statuses.front().copied()
            };
            next.ok_or_else(|| anyhow!("{} has no scripted status", self.name))?
        };
        let log = match status {
            GateStatus::Failed => "E   assert 1 == 2\n1 failed, 0 passed\n".to_string(),
            GateStatus::Passed => "all checks passed\n".to_string(),
            GateStatus::Skipped => "no tests ran\n".to_string(),
        };
        write_log(&request.log_path, &log)?;
        self.runs
            .lock()
            .map_err(|_| anyhow!("gate runs lock poisoned"))?
            .push(request.log_path.clone());
        Ok(GateResult {
            name: self.name.clone(),
            status,
            required: self.required,
            returncode,
            duration_ms: 1,
            log_path: request.log_path.clone(),
            message: match returncode {
                Some(code) => format!("exit code {code}"),
                None => "no exit code".to_string(),
            },
            failing_tests: (status == GateStatus::Failed).then_some(1),
        })
    }
}
