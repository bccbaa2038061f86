//! Orchestrator configuration (`orx.toml`).
//!
//! Every table is optional; missing fields fall back to defaults that run the
//! `codex` CLI with `ruff` and `pytest` gates.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::guardrails::{Glob, GuardrailPolicy};
use crate::core::stage::RouteKey;
use crate::error::OrxError;
use crate::io::run_state::write_atomic;

pub const DEFAULT_CONFIG_FILE: &str = "orx.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrxConfig {
    pub engine: EngineConfig,
    pub executors: BTreeMap<String, ExecutorConfig>,
    /// Per-stage overrides keyed by route (`plan`, `implement`, `fix`, ...).
    pub stages: BTreeMap<String, StageConfig>,
    pub fallback: FallbackConfig,
    pub gates: Vec<GateConfig>,
    pub guardrails: GuardrailPolicy,
    pub run: RunConfig,
    pub git: GitConfig,
    pub knowledge: KnowledgeConfig,
}

/// Global executor binding, used when nothing more specific applies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: String,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub reasoning_effort: Option<String>,
    pub timeout_secs: u64,
}

/// How to invoke one agent CLI.
///
/// Argument templates may contain `{cwd}`, `{model}`, `{profile}` and
/// `{reasoning_effort}` placeholders. The prompt is always written to stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Binary to spawn; defaults to the executor's name.
    pub binary: Option<String>,
    pub args: Vec<String>,
    /// Appended only for mutating (apply-mode) invocations.
    pub apply_args: Vec<String>,
    pub model_args: Vec<String>,
    pub profile_args: Vec<String>,
    pub reasoning_args: Vec<String>,
    /// Appended last, after model/profile arguments.
    pub trailing_args: Vec<String>,
    pub default_model: Option<String>,
    /// Route (stage name or `fix`) → profile.
    pub profiles: BTreeMap<String, String>,
    /// Case-insensitive stderr substrings that mark a failure as transient.
    pub transient_markers: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl ExecutorConfig {
    /// Built-in invocation shapes for known CLIs.
    pub fn preset(name: &str) -> Option<Self> {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let preset = match name {
            "codex" => Self {
                args: strings(&["exec", "--skip-git-repo-check", "--cd", "{cwd}"]),
                apply_args: strings(&["--full-auto"]),
                model_args: strings(&["--model", "{model}"]),
                profile_args: strings(&["--profile", "{profile}"]),
                reasoning_args: strings(&["-c", "model_reasoning_effort={reasoning_effort}"]),
                trailing_args: strings(&["-"]),
                ..Self::default()
            },
            "claude" => Self {
                args: strings(&["--print", "--output-format", "text"]),
                apply_args: strings(&["--permission-mode", "acceptEdits"]),
                model_args: strings(&["--model", "{model}"]),
                ..Self::default()
            },
            "gemini" => Self {
                args: strings(&["--output-format", "text"]),
                apply_args: strings(&["--yolo"]),
                model_args: strings(&["--model", "{model}"]),
                ..Self::default()
            },
            _ => return None,
        };
        Some(Self {
            transient_markers: default_transient_markers(),
            ..preset
        })
    }

    pub fn binary_or<'a>(&'a self, name: &'a str) -> &'a str {
        self.binary.as_deref().unwrap_or(name)
    }

    /// Fill unset invocation fields from the preset of the same name.
    fn with_preset(mut self, name: &str) -> Self {
        let Some(preset) = Self::preset(name) else {
            return self;
        };
        if self.args.is_empty() {
            self.args = preset.args;
            if self.apply_args.is_empty() {
                self.apply_args = preset.apply_args;
            }
            if self.trailing_args.is_empty() {
                self.trailing_args = preset.trailing_args;
            }
        }
        if self.model_args.is_empty() {
            self.model_args = preset.model_args;
        }
        if self.profile_args.is_empty() {
            self.profile_args = preset.profile_args;
        }
        if self.reasoning_args.is_empty() {
            self.reasoning_args = preset.reasoning_args;
        }
        if self.transient_markers.is_empty() {
            self.transient_markers = preset.transient_markers;
        }
        self
    }
}

fn default_transient_markers() -> Vec<String> {
    [
        "rate limit",
        "rate_limit",
        "429",
        "too many requests",
        "overloaded",
        "timed out",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StageConfig {
    pub executor: Option<String>,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub reasoning_effort: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub rules: Vec<FallbackRule>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

/// Retry once with `switch_to` when a failure matches.
///
/// A rule with no `error_contains` matches any transient failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FallbackRule {
    /// Only applies when the failing executor has this name.
    pub executor: Option<String>,
    pub error_contains: Vec<String>,
    pub switch_to: FallbackTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FallbackTarget {
    pub executor: Option<String>,
    pub model: Option<String>,
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Only required gate failures trigger the fix loop.
    pub required: bool,
    pub enabled: bool,
    pub timeout_secs: u64,
    /// Exit codes recorded as `skipped` instead of `failed`.
    pub skip_exit_codes: Vec<i32>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            required: true,
            enabled: true,
            timeout_secs: 600,
            skip_exit_codes: Vec::new(),
        }
    }
}

impl GateConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_gates() -> Vec<GateConfig> {
    vec![
        GateConfig {
            name: "ruff".to_string(),
            command: "ruff".to_string(),
            args: vec!["check".to_string(), ".".to_string()],
            ..GateConfig::default()
        },
        GateConfig {
            name: "pytest".to_string(),
            command: "pytest".to_string(),
            args: vec!["-q".to_string()],
            // pytest exits 5 when no tests were collected.
            skip_exit_codes: vec![5],
            ..GateConfig::default()
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Attempts per backlog item, including the first implementation.
    pub max_fix_attempts: u32,
    /// Fail the run as soon as one item fails.
    pub stop_on_first_failure: bool,
    /// Coalesce the backlog to at most this many items (0 = unlimited).
    pub max_backlog_items: usize,
    pub heartbeat_secs: u64,
    /// Concurrent backlog items. Only 1 is supported.
    pub workers: u32,
    /// Bytes of stdout/stderr kept per process.
    pub output_limit_bytes: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: 3,
            stop_on_first_failure: true,
            max_backlog_items: 0,
            heartbeat_secs: 30,
            workers: 1,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub base_branch: String,
    pub remote: String,
    pub auto_commit: bool,
    pub auto_push: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            auto_commit: false,
            auto_push: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executor: "codex".to_string(),
            model: None,
            profile: None,
            reasoning_effort: None,
            timeout_secs: 600,
        }
    }
}

impl Default for OrxConfig {
    fn default() -> Self {
        let executors = ["codex", "claude", "gemini"]
            .iter()
            .filter_map(|name| ExecutorConfig::preset(name).map(|cfg| (name.to_string(), cfg)))
            .collect();
        Self {
            engine: EngineConfig::default(),
            executors,
            stages: BTreeMap::new(),
            fallback: FallbackConfig::default(),
            gates: default_gates(),
            guardrails: GuardrailPolicy::default(),
            run: RunConfig::default(),
            git: GitConfig::default(),
            knowledge: KnowledgeConfig::default(),
        }
    }
}

impl OrxConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { OrxError::InvalidConfig(msg).into() };

        if !(1..=10).contains(&self.run.max_fix_attempts) {
            return Err(invalid(format!(
                "run.max_fix_attempts must be between 1 and 10 (got {})",
                self.run.max_fix_attempts
            )));
        }
        if self.run.workers != 1 {
            return Err(invalid(format!(
                "run.workers = {} requires per-item workspace isolation, which is not supported; use 1",
                self.run.workers
            )));
        }
        if self.run.output_limit_bytes == 0 {
            return Err(invalid("run.output_limit_bytes must be > 0".to_string()));
        }
        if self.engine.timeout_secs == 0 {
            return Err(invalid("engine.timeout_secs must be > 0".to_string()));
        }
        if !self.executors.contains_key(&self.engine.executor) {
            return Err(invalid(format!(
                "engine.executor '{}' is not defined under [executors]",
                self.engine.executor
            )));
        }
        let mut routes = HashSet::new();
        for (stage_name, stage) in &self.stages {
            let key = stage_name
                .parse::<RouteKey>()
                .map_err(|err| invalid(format!("stages.{stage_name}: {err}")))?;
            if !routes.insert(key) {
                return Err(invalid(format!(
                    "stages.{stage_name}: `{key}` is configured more than once"
                )));
            }
            if let Some(executor) = &stage.executor
                && !self.executors.contains_key(executor)
            {
                return Err(invalid(format!(
                    "stages.{stage_name}.executor '{executor}' is not defined"
                )));
            }
            if stage.timeout_secs == Some(0) {
                return Err(invalid(format!(
                    "stages.{stage_name}.timeout_secs must be > 0"
                )));
            }
        }
        for (name, executor) in &self.executors {
            let mut routes = HashSet::new();
            for route in executor.profiles.keys() {
                let key = route.parse::<RouteKey>().map_err(|err| {
                    invalid(format!("executors.{name}.profiles.{route}: {err}"))
                })?;
                if !routes.insert(key) {
                    return Err(invalid(format!(
                        "executors.{name}.profiles.{route}: `{key}` is configured more than once"
                    )));
                }
            }
        }
        for rule in &self.fallback.rules {
            if let Some(executor) = &rule.switch_to.executor
                && !self.executors.contains_key(executor)
            {
                return Err(invalid(format!(
                    "fallback switch_to.executor '{executor}' is not defined"
                )));
            }
        }

        let mut names = HashSet::new();
        for gate in &self.gates {
            if gate.name.trim().is_empty() {
                return Err(invalid("gate name must not be empty".to_string()));
            }
            if !names.insert(gate.name.as_str()) {
                return Err(invalid(format!("duplicate gate name '{}'", gate.name)));
            }
            if gate.command.trim().is_empty() {
                return Err(invalid(format!("gate '{}' has an empty command", gate.name)));
            }
            if gate.timeout_secs == 0 {
                return Err(invalid(format!(
                    "gate '{}' timeout_secs must be > 0",
                    gate.name
                )));
            }
        }

        for pattern in self
            .guardrails
            .patterns
            .iter()
            .chain(&self.guardrails.forbidden_new_files)
        {
            Glob::new(pattern).map_err(|err| invalid(format!("guardrails: {err:#}")))?;
        }
        Ok(())
    }

    /// Overrides from the command line.
    pub fn apply_overrides(&mut self, engine: Option<&str>, base_branch: Option<&str>) {
        if let Some(engine) = engine {
            self.engine.executor = engine.to_string();
            if !self.executors.contains_key(engine)
                && let Some(preset) = ExecutorConfig::preset(engine)
            {
                self.executors.insert(engine.to_string(), preset);
            }
        }
        if let Some(branch) = base_branch {
            self.git.base_branch = branch.to_string();
        }
    }

    pub fn stage(&self, key: impl Into<RouteKey>) -> Option<&StageConfig> {
        route_entry(&self.stages, key.into())
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        (self.run.heartbeat_secs > 0).then(|| Duration::from_secs(self.run.heartbeat_secs))
    }

    fn apply_presets(mut self) -> Self {
        self.executors = std::mem::take(&mut self.executors)
            .into_iter()
            .map(|(name, cfg)| {
                let cfg = cfg.with_preset(&name);
                (name, cfg)
            })
            .collect();
        self
    }
}

/// Entry of a route-keyed table (`[stages]`, executor `profiles`) for `key`.
/// Aliases such as `implement` match their canonical stage.
pub fn route_entry<V>(table: &BTreeMap<String, V>, key: RouteKey) -> Option<&V> {
    table
        .iter()
        .find(|(name, _)| name.parse::<RouteKey>().is_ok_and(|parsed| parsed == key))
        .map(|(_, value)| value)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrxConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrxConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        let cfg = OrxConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg = parse_config(&contents).with_context(|| format!("load {}", path.display()))?;
    debug!(
        path = %path.display(),
        executor = %cfg.engine.executor,
        gates = cfg.gates.len(),
        "config loaded"
    );
    Ok(cfg)
}

/// Parse and validate TOML config text.
pub fn parse_config(contents: &str) -> Result<OrxConfig> {
    let cfg: OrxConfig = toml::from_str(contents)
        .map_err(|err| OrxError::InvalidConfig(err.message().to_string()))?;
    let mut cfg = cfg.apply_presets();
    if cfg.executors.is_empty() {
        cfg.executors = OrxConfig::default().executors;
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrxConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guardrails::GuardrailMode;
    use crate::core::stage::Stage;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrxConfig::default());
        assert_eq!(cfg.run.max_fix_attempts, 3);
        assert_eq!(cfg.guardrails.max_files_changed, 50);
        assert_eq!(cfg.gates[1].skip_exit_codes, vec![5]);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orx.toml");
        let cfg = OrxConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn parses_partial_document_and_fills_presets() {
        let cfg = parse_config(
            r#"
[engine]
executor = "codex"

[executors.codex]
default_model = "o3"

[stages.review]
executor = "claude"
model = "sonnet"

[executors.claude]

[[gates]]
name = "cargo-test"
command = "cargo"
args = ["test"]

[guardrails]
mode = "allowlist"
patterns = ["src/**"]
max_files_changed = 10

[run]
max_fix_attempts = 5
"#,
        )
        .expect("parse");
        let codex = &cfg.executors["codex"];
        assert_eq!(codex.default_model.as_deref(), Some("o3"));
        assert_eq!(codex.trailing_args, vec!["-"]);
        assert_eq!(
            cfg.stage(Stage::Review).and_then(|s| s.model.as_deref()),
            Some("sonnet")
        );
        assert_eq!(cfg.gates.len(), 1);
        assert!(cfg.gates[0].required);
        assert_eq!(cfg.guardrails.mode, GuardrailMode::Allowlist);
        assert_eq!(cfg.run.max_fix_attempts, 5);
        assert_eq!(cfg.git.base_branch, "main");
    }

    fn expect_invalid(doc: &str, needle: &str) {
        let err = parse_config(doc).unwrap_err();
        let typed = err.downcast_ref::<OrxError>().expect("typed error");
        assert!(typed.is_precondition());
        assert!(
            format!("{err:#}").contains(needle),
            "expected '{needle}' in '{err:#}'"
        );
    }

    #[test]
    fn rejects_out_of_range_and_inconsistent_settings() {
        expect_invalid("[run]\nmax_fix_attempts = 11\n", "max_fix_attempts");
        expect_invalid("[run]\nworkers = 4\n", "per-item workspace isolation");
        expect_invalid("[engine]\nexecutor = \"nope\"\n", "engine.executor");
        expect_invalid("[stages.verify]\nmodel = \"x\"\n", "unknown stage");
        expect_invalid("[stages.done]\nmodel = \"x\"\n", "does not invoke an executor");
        expect_invalid(
            "[stages.implement]\nmodel = \"a\"\n[stages.implement_item]\nmodel = \"b\"\n",
            "configured more than once",
        );
        expect_invalid(
            "[executors.codex]\nprofiles = { verify = \"x\" }\n",
            "executors.codex.profiles.verify",
        );
        expect_invalid(
            "[[gates]]\nname = \"a\"\ncommand = \"x\"\n[[gates]]\nname = \"a\"\ncommand = \"y\"\n",
            "duplicate gate name",
        );
        expect_invalid("engine = 3\n", "invalid configuration");
    }

    #[test]
    fn stage_tables_accept_aliases_and_fix() {
        let cfg = parse_config(
            "[stages.implement]\nmodel = \"opus\"\n[stages.knowledge]\nmodel = \"mini\"\n[stages.fix]\nmodel = \"o3\"\n",
        )
        .expect("parse");
        assert_eq!(
            cfg.stage(Stage::ImplementItem).and_then(|s| s.model.as_deref()),
            Some("opus")
        );
        assert_eq!(
            cfg.stage(Stage::KnowledgeUpdate).and_then(|s| s.model.as_deref()),
            Some("mini")
        );
        assert_eq!(
            cfg.stage(RouteKey::Fix).and_then(|s| s.model.as_deref()),
            Some("o3")
        );
    }

    #[test]
    fn cli_overrides_engine_and_branch() {
        let mut cfg = OrxConfig::default();
        cfg.executors.remove("gemini");
        cfg.apply_overrides(Some("gemini"), Some("develop"));
        assert_eq!(cfg.engine.executor, "gemini");
        assert!(cfg.executors.contains_key("gemini"));
        assert_eq!(cfg.git.base_branch, "develop");
        cfg.validate().expect("valid");
    }
}
