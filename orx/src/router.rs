//! Per-stage executor and model resolution, with one-shot fallback.
//!
//! Resolution order, highest priority first:
//!
//! 1. `[stages.<stage>]` override
//! 2. `[executors.<name>].profiles[<stage>]`
//! 3. `[executors.<name>].default_model`
//! 4. `[engine]` defaults (only when the stage runs on the engine's executor)
//! 5. built-in: `codex` with the CLI's own default model
//!
//! Each field cascades on its own; [`Resolution::source`] names the highest
//! level that contributed anything. Fix-loop retries route under `fix` and
//! use the implement stage's entries when `fix` has none.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::core::stage::{RouteKey, Stage};
use crate::io::config::{
    EngineConfig, ExecutorConfig, FallbackConfig, OrxConfig, StageConfig, route_entry,
};
use crate::io::executor::{
    ExecMode, ExecRequest, ExecResult, Executor, ExecutorRegistry, ModelSelector,
};
use crate::io::meta::ExecutorAttempt;
use crate::io::paths::LogPaths;
use crate::io::process::CancelToken;

pub const BUILTIN_EXECUTOR: &str = "codex";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    StageOverride,
    ExecutorProfile,
    ExecutorDefault,
    EngineDefault,
    BuiltIn,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::StageOverride => "stage override",
            Self::ExecutorProfile => "executor profile",
            Self::ExecutorDefault => "executor default",
            Self::EngineDefault => "engine default",
            Self::BuiltIn => "built-in",
        };
        f.write_str(label)
    }
}

/// Where a stage runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub executor: String,
    pub selector: ModelSelector,
    #[serde(skip)]
    pub timeout: Duration,
    pub source: ResolutionSource,
}

/// Everything an invocation needs apart from the routing decision.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub prompt: String,
    pub cwd: PathBuf,
    pub logs: LogPaths,
    pub heartbeat: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub item_id: Option<String>,
    pub iteration: Option<u32>,
}

/// Final result plus every attempt made (one or two).
#[derive(Debug, Clone)]
pub struct Routed {
    pub result: ExecResult,
    pub attempts: Vec<ExecutorAttempt>,
    pub used_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct Router {
    engine: EngineConfig,
    executors: BTreeMap<String, ExecutorConfig>,
    stages: BTreeMap<String, StageConfig>,
    fallback: FallbackConfig,
    registry: ExecutorRegistry,
}

impl Router {
    pub fn new(config: &OrxConfig, registry: ExecutorRegistry) -> Self {
        Self {
            engine: config.engine.clone(),
            executors: config.executors.clone(),
            stages: config.stages.clone(),
            fallback: config.fallback.clone(),
            registry,
        }
    }

    /// Resolve the executor handle and model selector for `route`.
    pub fn resolve(&self, route: impl Into<RouteKey>) -> Result<(Arc<dyn Executor>, Resolution)> {
        let resolution = self.resolution(route);
        let executor = self.registry.get(&resolution.executor)?;
        Ok((executor, resolution))
    }

    /// Pure routing decision for `route`.
    pub fn resolution(&self, route: impl Into<RouteKey>) -> Resolution {
        let route = route.into();
        let stage_cfg = route
            .lookup_order()
            .into_iter()
            .find_map(|key| route_entry(&self.stages, key));
        let stage_executor = stage_cfg.and_then(|s| s.executor.clone());
        let executor = stage_executor
            .clone()
            .or_else(|| {
                (!self.engine.executor.is_empty()).then(|| self.engine.executor.clone())
            })
            .unwrap_or_else(|| BUILTIN_EXECUTOR.to_string());
        let executor_cfg = self.executors.get(&executor);
        let on_engine = executor == self.engine.executor;

        let mut source = ResolutionSource::BuiltIn;
        let mut note = |level: ResolutionSource| {
            if level_rank(level) < level_rank(source) {
                source = level;
            }
        };

        let model = if let Some(model) = stage_cfg.and_then(|s| s.model.clone()) {
            note(ResolutionSource::StageOverride);
            Some(model)
        } else if let Some(model) = executor_cfg.and_then(|e| e.default_model.clone()) {
            note(ResolutionSource::ExecutorDefault);
            Some(model)
        } else if let Some(model) = self.engine.model.clone().filter(|_| on_engine) {
            note(ResolutionSource::EngineDefault);
            Some(model)
        } else {
            None
        };

        let profile = if let Some(profile) = stage_cfg.and_then(|s| s.profile.clone()) {
            note(ResolutionSource::StageOverride);
            Some(profile)
        } else if let Some(profile) = executor_cfg.and_then(|e| {
            route
                .lookup_order()
                .into_iter()
                .find_map(|key| route_entry(&e.profiles, key).cloned())
        }) {
            note(ResolutionSource::ExecutorProfile);
            Some(profile)
        } else if let Some(profile) = self.engine.profile.clone().filter(|_| on_engine) {
            note(ResolutionSource::EngineDefault);
            Some(profile)
        } else {
            None
        };

        let reasoning_effort =
            if let Some(effort) = stage_cfg.and_then(|s| s.reasoning_effort.clone()) {
                note(ResolutionSource::StageOverride);
                Some(effort)
            } else if let Some(effort) = self.engine.reasoning_effort.clone().filter(|_| on_engine)
            {
                note(ResolutionSource::EngineDefault);
                Some(effort)
            } else {
                None
            };

        if stage_executor.is_some() {
            note(ResolutionSource::StageOverride);
        }

        let timeout_secs = stage_cfg
            .and_then(|s| s.timeout_secs)
            .or_else(|| executor_cfg.and_then(|e| e.timeout_secs))
            .unwrap_or(self.engine.timeout_secs);

        Resolution {
            executor,
            selector: ModelSelector {
                model,
                profile,
                reasoning_effort,
            },
            timeout: Duration::from_secs(timeout_secs),
            source,
        }
    }

    /// The retry target for a failed primary attempt, if a rule matches.
    ///
    /// Only transient failures, or failures whose text contains one of a
    /// rule's `error_contains` markers, are eligible. Cancellation never is.
    pub fn fallback_for(
        &self,
        primary: &Resolution,
        result: &ExecResult,
        error_text: &str,
    ) -> Option<Resolution> {
        if !self.fallback.enabled || result.success || result.extra.cancelled {
            return None;
        }
        let haystack = error_text.to_lowercase();
        let rule = self.fallback.rules.iter().find(|rule| {
            let executor_matches = rule
                .executor
                .as_deref()
                .is_none_or(|name| name == primary.executor);
            let error_matches = if rule.error_contains.is_empty() {
                result.extra.transient
            } else {
                result.extra.transient
                    || rule
                        .error_contains
                        .iter()
                        .any(|needle| haystack.contains(&needle.to_lowercase()))
            };
            executor_matches && error_matches
        })?;

        let executor = rule
            .switch_to
            .executor
            .clone()
            .unwrap_or_else(|| primary.executor.clone());
        let same_executor = executor == primary.executor;
        let model = rule.switch_to.model.clone().or_else(|| {
            if same_executor {
                primary.selector.model.clone()
            } else {
                self.executors
                    .get(&executor)
                    .and_then(|cfg| cfg.default_model.clone())
            }
        });
        let profile = rule
            .switch_to
            .profile
            .clone()
            .or_else(|| same_executor.then(|| primary.selector.profile.clone()).flatten());
        Some(Resolution {
            executor,
            selector: ModelSelector {
                model,
                profile,
                reasoning_effort: same_executor
                    .then(|| primary.selector.reasoning_effort.clone())
                    .flatten(),
            },
            timeout: primary.timeout,
            source: primary.source,
        })
    }

    /// Run `stage` on its resolved executor, retrying once on the fallback
    /// target when the failure qualifies.
    pub fn run_with_fallback(
        &self,
        route: impl Into<RouteKey>,
        mode: ExecMode,
        invocation: &Invocation,
    ) -> Result<Routed> {
        let route = route.into();
        let stage = route.stage();
        let (executor, primary) = self.resolve(route)?;
        let request = self.request(invocation, &primary, invocation.logs.clone());
        let result = executor.run(mode, &request)?;
        let mut attempts = vec![attempt_record(stage, invocation, &primary, &result, false)];
        if result.success {
            return Ok(Routed {
                result,
                attempts,
                used_fallback: false,
            });
        }

        let stderr = std::fs::read_to_string(&result.stderr_path).unwrap_or_default();
        let error_text = format!("{}\n{stderr}", result.failure_summary());
        let Some(target) = self.fallback_for(&primary, &result, &error_text) else {
            return Ok(Routed {
                result,
                attempts,
                used_fallback: false,
            });
        };
        let fallback_executor = match self.registry.get(&target.executor) {
            Ok(executor) => executor,
            Err(err) => {
                warn!(executor = %target.executor, err = %err, "fallback executor unavailable");
                return Ok(Routed {
                    result,
                    attempts,
                    used_fallback: false,
                });
            }
        };
        info!(
            route = %route,
            from = %primary.executor,
            to = %target.executor,
            model = ?target.selector.model,
            "retrying on fallback executor"
        );
        let request = self.request(invocation, &target, invocation.logs.with_suffix("fallback"));
        let result = fallback_executor.run(mode, &request)?;
        attempts.push(attempt_record(stage, invocation, &target, &result, true));
        Ok(Routed {
            result,
            attempts,
            used_fallback: true,
        })
    }

    fn request(
        &self,
        invocation: &Invocation,
        resolution: &Resolution,
        logs: LogPaths,
    ) -> ExecRequest {
        ExecRequest {
            prompt: invocation.prompt.clone(),
            cwd: invocation.cwd.clone(),
            logs,
            selector: resolution.selector.clone(),
            timeout: resolution.timeout,
            heartbeat: invocation.heartbeat,
            cancel: invocation.cancel.clone(),
        }
    }
}

fn level_rank(source: ResolutionSource) -> u8 {
    match source {
        ResolutionSource::StageOverride => 1,
        ResolutionSource::ExecutorProfile => 2,
        ResolutionSource::ExecutorDefault => 3,
        ResolutionSource::EngineDefault => 4,
        ResolutionSource::BuiltIn => 5,
    }
}

fn attempt_record(
    stage: Stage,
    invocation: &Invocation,
    resolution: &Resolution,
    result: &ExecResult,
    fallback: bool,
) -> ExecutorAttempt {
    ExecutorAttempt {
        stage,
        item_id: invocation.item_id.clone(),
        iteration: invocation.iteration,
        executor: resolution.executor.clone(),
        model: resolution.selector.model.clone(),
        profile: resolution.selector.profile.clone(),
        fallback,
        returncode: result.returncode,
        success: result.success,
        transient: result.extra.transient,
    }
}
