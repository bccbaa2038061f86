//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the runner from the agent backend. Every
//! backend exposes a read-only `text` mode and a mutating `apply` mode; what
//! an apply invocation changed is always measured afterwards from the
//! workspace diff, never taken from the executor's output. Tests use scripted
//! executors that return predetermined outputs without spawning processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::config::{ExecutorConfig, OrxConfig};
use crate::io::paths::LogPaths;
use crate::io::process::{CancelToken, CommandOutput, ProcessOptions, run_command};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Must not mutate the workspace.
    Text,
    /// May mutate the workspace.
    Apply,
}

/// Model parameters passed to an executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelector {
    pub model: Option<String>,
    pub profile: Option<String>,
    pub reasoning_effort: Option<String>,
}

/// Parameters for one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub prompt: String,
    /// Working directory (the run workspace).
    pub cwd: PathBuf,
    pub logs: LogPaths,
    pub selector: ModelSelector,
    pub timeout: Duration,
    pub heartbeat: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

/// Adapter-reported metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecExtra {
    /// Failure looks retryable (rate limit, timeout).
    pub transient: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
    pub token_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub returncode: Option<i32>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub success: bool,
    pub error_message: Option<String>,
    pub extra: ExecExtra,
}

impl ExecResult {
    /// Agent output (stdout log contents).
    pub fn stdout_text(&self) -> Result<String> {
        fs::read_to_string(&self.stdout_path)
            .with_context(|| format!("read executor stdout {}", self.stdout_path.display()))
    }

    /// One-line failure description.
    pub fn failure_summary(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| format!("executor exited with {:?}", self.returncode))
    }
}

/// Abstraction over agent execution backends.
///
/// `Err` is reserved for infrastructure failures (spawn, log I/O). An agent
/// that runs and fails is an `Ok` result with `success == false`.
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Binary that must be on `PATH` for this executor to run, if any.
    fn binary(&self) -> Option<&str> {
        None
    }

    fn run_text(&self, request: &ExecRequest) -> Result<ExecResult>;

    fn run_apply(&self, request: &ExecRequest) -> Result<ExecResult>;

    fn run(&self, mode: ExecMode, request: &ExecRequest) -> Result<ExecResult> {
        match mode {
            ExecMode::Text => self.run_text(request),
            ExecMode::Apply => self.run_apply(request),
        }
    }
}

/// Executor that spawns an agent CLI described by [`ExecutorConfig`].
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    name: String,
    binary: String,
    config: ExecutorConfig,
    output_limit_bytes: usize,
}

impl CommandExecutor {
    pub fn new(name: &str, config: &ExecutorConfig, output_limit_bytes: usize) -> Self {
        Self {
            name: name.to_string(),
            binary: config.binary_or(name).to_string(),
            config: config.clone(),
            output_limit_bytes,
        }
    }

    /// argv after the binary for one invocation.
    pub fn build_args(&self, mode: ExecMode, cwd: &Path, selector: &ModelSelector) -> Vec<String> {
        let model = selector
            .model
            .as_deref()
            .or(self.config.default_model.as_deref());
        let vars = Placeholders {
            cwd: &cwd.display().to_string(),
            model: model.unwrap_or_default(),
            profile: selector.profile.as_deref().unwrap_or_default(),
            reasoning_effort: selector.reasoning_effort.as_deref().unwrap_or_default(),
        };
        let mut args: Vec<String> = self.config.args.iter().map(|a| vars.fill(a)).collect();
        if mode == ExecMode::Apply {
            args.extend(self.config.apply_args.iter().map(|a| vars.fill(a)));
        }
        if model.is_some() {
            args.extend(self.config.model_args.iter().map(|a| vars.fill(a)));
        }
        if selector.profile.is_some() {
            args.extend(self.config.profile_args.iter().map(|a| vars.fill(a)));
        }
        if selector.reasoning_effort.is_some() {
            args.extend(self.config.reasoning_args.iter().map(|a| vars.fill(a)));
        }
        args.extend(self.config.trailing_args.iter().map(|a| vars.fill(a)));
        args
    }

    #[instrument(skip_all, fields(executor = %self.name, mode = ?mode, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, mode: ExecMode, request: &ExecRequest) -> Result<ExecResult> {
        let args = self.build_args(mode, &request.cwd, &request.selector);
        info!(
            workdir = %request.cwd.display(),
            model = ?request.selector.model,
            "starting executor"
        );
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args).current_dir(&request.cwd);

        let opts = ProcessOptions {
            label: self.name.clone(),
            timeout: request.timeout,
            output_limit_bytes: self.output_limit_bytes,
            heartbeat: request.heartbeat,
            cancel: request.cancel.clone(),
        };
        let output = run_command(cmd, Some(request.prompt.as_bytes()), &opts)
            .with_context(|| format!("run executor {}", self.name))?;
        write_logs(&request.logs, &output, &self.name)?;

        let result = self.classify(&output, request);
        if result.success {
            debug!("executor completed successfully");
        } else {
            warn!(
                exit_code = ?result.returncode,
                transient = result.extra.transient,
                error = ?result.error_message,
                "executor failed"
            );
        }
        Ok(result)
    }

    fn classify(&self, output: &CommandOutput, request: &ExecRequest) -> ExecResult {
        let returncode = output.code();
        let success = returncode == Some(0) && !output.timed_out && !output.cancelled;
        let mut transient = output.timed_out;
        let error_message = if success {
            None
        } else if output.cancelled {
            Some("cancelled".to_string())
        } else if output.timed_out {
            Some(format!("timed out after {}s", request.timeout.as_secs()))
        } else {
            let stderr = output.stderr_lossy();
            let haystack = format!("{stderr}\n{}", output.stdout_lossy()).to_lowercase();
            transient = self
                .config
                .transient_markers
                .iter()
                .any(|marker| haystack.contains(&marker.to_lowercase()));
            let last_line = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or_default();
            Some(match returncode {
                Some(code) if last_line.is_empty() => format!("exit code {code}"),
                Some(code) => format!("exit code {code}: {last_line}"),
                None => "terminated by signal".to_string(),
            })
        };
        ExecResult {
            returncode,
            stdout_path: request.logs.stdout.clone(),
            stderr_path: request.logs.stderr.clone(),
            success,
            error_message,
            extra: ExecExtra {
                transient,
                timed_out: output.timed_out,
                cancelled: output.cancelled,
                duration_ms: output.duration.as_millis() as u64,
                token_count: None,
            },
        }
    }
}

impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn binary(&self) -> Option<&str> {
        Some(&self.binary)
    }

    fn run_text(&self, request: &ExecRequest) -> Result<ExecResult> {
        self.invoke(ExecMode::Text, request)
    }

    fn run_apply(&self, request: &ExecRequest) -> Result<ExecResult> {
        self.invoke(ExecMode::Apply, request)
    }
}

struct Placeholders<'a> {
    cwd: &'a str,
    model: &'a str,
    profile: &'a str,
    reasoning_effort: &'a str,
}

impl Placeholders<'_> {
    fn fill(&self, template: &str) -> String {
        template
            .replace("{cwd}", self.cwd)
            .replace("{model}", self.model)
            .replace("{profile}", self.profile)
            .replace("{reasoning_effort}", self.reasoning_effort)
    }
}

/// Write the stdout/stderr log pair for one invocation.
pub fn write_logs(logs: &LogPaths, output: &CommandOutput, label: &str) -> Result<()> {
    let mut stdout = output.stdout.clone();
    stdout.extend_from_slice(output.stdout_truncated_notice(label).as_bytes());
    let mut stderr = output.stderr.clone();
    stderr.extend_from_slice(output.stderr_truncated_notice(label).as_bytes());
    write_log(&logs.stdout, &stdout)?;
    write_log(&logs.stderr, &stderr)
}

fn write_log(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write executor log {}", path.display()))
}

/// Executors keyed by name, built once at startup.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn from_config(cfg: &OrxConfig) -> Self {
        let mut registry = Self::default();
        for (name, executor_cfg) in &cfg.executors {
            registry.register(Arc::new(CommandExecutor::new(
                name,
                executor_cfg,
                cfg.run.output_limit_bytes,
            )));
        }
        registry
    }

    /// Add or replace an executor under its own name.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Executor>> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("executor '{name}' is not registered"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.executors.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path, prompt: &str) -> ExecRequest {
        ExecRequest {
            prompt: prompt.to_string(),
            cwd: dir.to_path_buf(),
            logs: LogPaths {
                stdout: dir.join("logs/out.log"),
                stderr: dir.join("logs/err.log"),
            },
            selector: ModelSelector::default(),
            timeout: Duration::from_secs(10),
            heartbeat: None,
            cancel: None,
        }
    }

    fn shell_executor(script: &str) -> CommandExecutor {
        let cfg = ExecutorConfig {
            binary: Some("sh".to_string()),
            args: vec!["-c".to_string(), script.to_string()],
            transient_markers: vec!["rate limit".to_string()],
            ..ExecutorConfig::default()
        };
        CommandExecutor::new("shell", &cfg, 1_000_000)
    }

    #[test]
    fn codex_args_follow_mode_and_selector() {
        let cfg = ExecutorConfig::preset("codex").expect("preset");
        let exec = CommandExecutor::new("codex", &cfg, 1000);
        let selector = ModelSelector {
            model: Some("o3".to_string()),
            profile: None,
            reasoning_effort: Some("high".to_string()),
        };
        let text = exec.build_args(ExecMode::Text, Path::new("/ws"), &selector);
        assert_eq!(
            text,
            vec![
                "exec",
                "--skip-git-repo-check",
                "--cd",
                "/ws",
                "--model",
                "o3",
                "-c",
                "model_reasoning_effort=high",
                "-"
            ]
        );
        let apply = exec.build_args(ExecMode::Apply, Path::new("/ws"), &ModelSelector::default());
        assert_eq!(
            apply,
            vec!["exec", "--skip-git-repo-check", "--cd", "/ws", "--full-auto", "-"]
        );
    }

    #[test]
    fn default_model_fills_missing_selector_model() {
        let mut cfg = ExecutorConfig::preset("claude").expect("preset");
        cfg.default_model = Some("sonnet".to_string());
        let exec = CommandExecutor::new("claude", &cfg, 1000);
        let args = exec.build_args(ExecMode::Text, Path::new("/ws"), &ModelSelector::default());
        assert!(args.ends_with(&["--model".to_string(), "sonnet".to_string()]));
    }

    #[test]
    fn prompt_goes_to_stdin_and_output_to_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = shell_executor("cat");
        let result = exec
            .run_text(&request(temp.path(), "hello agent"))
            .expect("run");
        assert!(result.success);
        assert_eq!(result.returncode, Some(0));
        assert_eq!(result.stdout_text().expect("stdout"), "hello agent");
        assert!(result.stderr_path.exists());
    }

    #[test]
    fn rate_limit_failure_is_transient() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = shell_executor("echo 'Error: Rate limit exceeded' >&2; exit 1");
        let result = exec.run_apply(&request(temp.path(), "")).expect("run");
        assert!(!result.success);
        assert!(result.extra.transient);
        assert_eq!(
            result.error_message.as_deref(),
            Some("exit code 1: Error: Rate limit exceeded")
        );
    }

    #[test]
    fn plain_failure_is_not_transient() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = shell_executor("exit 2");
        let result = exec.run_text(&request(temp.path(), "")).expect("run");
        assert!(!result.success);
        assert!(!result.extra.transient);
        assert_eq!(result.failure_summary(), "exit code 2");
    }

    #[test]
    fn timeout_is_transient() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = shell_executor("exec sleep 5");
        let mut req = request(temp.path(), "");
        req.timeout = Duration::from_millis(300);
        let result = exec.run_text(&req).expect("run");
        assert!(!result.success);
        assert!(result.extra.timed_out);
        assert!(result.extra.transient);
    }

    #[test]
    fn registry_resolves_by_name() {
        let registry = ExecutorRegistry::from_config(&OrxConfig::default());
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["claude", "codex", "gemini"]
        );
        assert_eq!(registry.get("codex").expect("codex").binary(), Some("codex"));
        assert!(registry.get("cursor").is_err());
    }
}
