//! Verification gates run against a workspace.
//!
//! A gate is an independent named command. Results are recorded as passed,
//! failed or skipped; only failed *required* gates block an item.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::io::config::GateConfig;
use crate::io::process::{CancelToken, ProcessOptions, run_command};

static FAILED_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) failed").expect("failed-count regex is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub status: GateStatus,
    pub required: bool,
    pub returncode: Option<i32>,
    pub duration_ms: u64,
    pub log_path: PathBuf,
    pub message: String,
    pub failing_tests: Option<u32>,
}

impl GateResult {
    /// Skipped counts as passing.
    pub fn passed(&self) -> bool {
        self.status != GateStatus::Failed
    }

    /// A failed required gate; drives the fix loop.
    pub fn blocks(&self) -> bool {
        self.required && self.status == GateStatus::Failed
    }
}

/// Inputs for one gate execution.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub cwd: PathBuf,
    pub log_path: PathBuf,
    pub heartbeat: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

pub trait Gate: Send + Sync {
    fn name(&self) -> &str;

    fn required(&self) -> bool;

    fn run(&self, request: &GateRequest) -> Result<GateResult>;
}

/// Gate backed by an external command from config.
#[derive(Debug, Clone)]
pub struct CommandGate {
    config: GateConfig,
    output_limit_bytes: usize,
}

impl CommandGate {
    pub fn new(config: GateConfig, output_limit_bytes: usize) -> Self {
        Self {
            config,
            output_limit_bytes,
        }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.config.command.as_str())
            .chain(self.config.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn result(&self, request: &GateRequest, status: GateStatus, message: String) -> GateResult {
        GateResult {
            name: self.config.name.clone(),
            status,
            required: self.config.required,
            returncode: None,
            duration_ms: 0,
            log_path: request.log_path.clone(),
            message,
            failing_tests: None,
        }
    }
}

impl Gate for CommandGate {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn required(&self) -> bool {
        self.config.required
    }

    #[instrument(skip_all, fields(gate = %self.config.name))]
    fn run(&self, request: &GateRequest) -> Result<GateResult> {
        let header = format!("$ {}\n", self.command_line());
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args).current_dir(&request.cwd);
        let opts = ProcessOptions {
            label: format!("gate {}", self.config.name),
            timeout: self.config.timeout(),
            output_limit_bytes: self.output_limit_bytes,
            heartbeat: request.heartbeat,
            cancel: request.cancel.clone(),
        };

        let started = Instant::now();
        let output = match run_command(cmd, None, &opts) {
            Ok(output) => output,
            Err(err) => {
                let message = format!("failed to spawn {}: {err:#}", self.config.command);
                warn!(error = %message, "gate could not start");
                write_gate_log(&request.log_path, &format!("{header}{message}\n"))?;
                let mut result = self.result(request, GateStatus::Failed, message);
                result.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(result);
            }
        };

        let stdout = output.stdout_lossy();
        let stderr = output.stderr_lossy();
        let mut log = header;
        log.push_str(&stdout);
        log.push_str(&output.stdout_truncated_notice(&self.config.name));
        log.push_str(&stderr);
        log.push_str(&output.stderr_truncated_notice(&self.config.name));
        log.push_str(&format!("\n[exit code: {:?}]\n", output.code()));
        write_gate_log(&request.log_path, &log)?;

        let code = output.code();
        let (status, message) = if output.cancelled {
            (GateStatus::Failed, "cancelled".to_string())
        } else if output.timed_out {
            (
                GateStatus::Failed,
                format!("timed out after {}s", self.config.timeout_secs),
            )
        } else if code == Some(0) {
            (GateStatus::Passed, "passed".to_string())
        } else if let Some(code) = code.filter(|c| self.config.skip_exit_codes.contains(c)) {
            (GateStatus::Skipped, format!("skipped (exit code {code})"))
        } else {
            (
                GateStatus::Failed,
                match code {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                },
            )
        };
        let failing_tests = parse_failing_tests(&format!("{stdout}\n{stderr}"));
        info!(status = ?status, exit_code = ?code, "gate finished");

        Ok(GateResult {
            name: self.config.name.clone(),
            status,
            required: self.config.required,
            returncode: code,
            duration_ms: output.duration.as_millis() as u64,
            log_path: request.log_path.clone(),
            message,
            failing_tests,
        })
    }
}

/// Largest `N failed` count in a test log.
pub fn parse_failing_tests(log: &str) -> Option<u32> {
    FAILED_COUNT_RE
        .captures_iter(log)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .max()
}

fn write_gate_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write gate log {}", path.display()))
}

/// Runs a fixed gate set sequentially.
#[derive(Default)]
pub struct GateRunner {
    gates: Vec<Box<dyn Gate>>,
}

impl GateRunner {
    /// Enabled gates from config, in declaration order.
    pub fn from_config(gates: &[GateConfig], output_limit_bytes: usize) -> Self {
        Self::new(
            gates
                .iter()
                .filter(|gate| gate.enabled)
                .map(|gate| {
                    Box::new(CommandGate::new(gate.clone(), output_limit_bytes)) as Box<dyn Gate>
                })
                .collect(),
        )
    }

    pub fn new(gates: Vec<Box<dyn Gate>>) -> Self {
        Self { gates }
    }

    pub fn names(&self) -> Vec<&str> {
        self.gates.iter().map(|gate| gate.name()).collect()
    }

    /// Run every gate; `log_for` maps a gate name to its log file.
    pub fn run_all(
        &self,
        cwd: &Path,
        log_for: impl Fn(&str) -> PathBuf,
        heartbeat: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<GateResult>> {
        let mut results = Vec::with_capacity(self.gates.len());
        for gate in &self.gates {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                break;
            }
            let request = GateRequest {
                cwd: cwd.to_path_buf(),
                log_path: log_for(gate.name()),
                heartbeat,
                cancel: cancel.cloned(),
            };
            let result = gate
                .run(&request)
                .with_context(|| format!("run gate {}", gate.name()))?;
            if result.status == GateStatus::Failed && !result.required {
                warn!(gate = %result.name, message = %result.message, "advisory gate failed");
            }
            results.push(result);
        }
        Ok(results)
    }
}

impl std::fmt::Debug for GateRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_gate(name: &str, script: &str) -> GateConfig {
        GateConfig {
            name: name.to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..GateConfig::default()
        }
    }

    fn run_one(cfg: GateConfig) -> (tempfile::TempDir, GateResult) {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = GateRunner::from_config(&[cfg], 1_000_000);
        let logs = temp.path().join("logs");
        let mut results = runner
            .run_all(temp.path(), |name| logs.join(format!("{name}.log")), None, None)
            .expect("run");
        assert_eq!(results.len(), 1);
        (temp, results.remove(0))
    }

    #[test]
    fn passing_gate_writes_log() {
        let (_temp, result) = run_one(sh_gate("lint", "echo all clean"));
        assert_eq!(result.status, GateStatus::Passed);
        assert!(result.passed());
        let log = fs::read_to_string(&result.log_path).expect("log");
        assert!(log.starts_with("$ sh -c echo all clean\n"));
        assert!(log.contains("all clean"));
    }

    #[test]
    fn skip_exit_code_is_skipped_not_failed() {
        let mut cfg = sh_gate("pytest", "echo 'no tests ran'; exit 5");
        cfg.skip_exit_codes = vec![5];
        let (_temp, result) = run_one(cfg);
        assert_eq!(result.status, GateStatus::Skipped);
        assert_eq!(result.returncode, Some(5));
        assert!(!result.blocks());
    }

    #[test]
    fn failure_counts_failing_tests() {
        let (_temp, result) = run_one(sh_gate(
            "pytest",
            "echo 'FAILED test_a.py::test_x'; echo '2 failed, 3 passed in 0.1s'; exit 1",
        ));
        assert_eq!(result.status, GateStatus::Failed);
        assert_eq!(result.failing_tests, Some(2));
        assert!(result.blocks());
    }

    #[test]
    fn advisory_failure_does_not_block() {
        let mut cfg = sh_gate("style", "exit 1");
        cfg.required = false;
        let (_temp, result) = run_one(cfg);
        assert_eq!(result.status, GateStatus::Failed);
        assert!(!result.blocks());
    }

    #[test]
    fn timeout_fails_gate() {
        let mut cfg = sh_gate("slow", "exec sleep 5");
        cfg.timeout_secs = 1;
        let (_temp, result) = run_one(cfg);
        assert_eq!(result.status, GateStatus::Failed);
        assert_eq!(result.message, "timed out after 1s");
    }

    #[test]
    fn missing_binary_fails_with_spawn_error_in_log() {
        let cfg = GateConfig {
            name: "ghost".to_string(),
            command: "definitely-not-a-gate-binary".to_string(),
            ..GateConfig::default()
        };
        let (_temp, result) = run_one(cfg);
        assert_eq!(result.status, GateStatus::Failed);
        assert!(result.message.starts_with("failed to spawn"));
        let log = fs::read_to_string(&result.log_path).expect("log");
        assert!(log.contains("failed to spawn"));
    }

    #[test]
    fn disabled_gates_are_not_run() {
        let mut cfg = sh_gate("off", "exit 1");
        cfg.enabled = false;
        let runner = GateRunner::from_config(&[cfg], 1000);
        assert!(runner.names().is_empty());
    }

    #[test]
    fn parses_largest_failed_count() {
        assert_eq!(parse_failing_tests("1 failed\n=== 4 failed, 2 passed ==="), Some(4));
        assert_eq!(parse_failing_tests("all good"), None);
    }
}
