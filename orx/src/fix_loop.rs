//! Bounded implement → verify → fix loop for one backlog item.
//!
//! Each attempt invokes the implement stage executor in apply mode, then
//! checks the workspace diff against the guardrails and runs the gates. A
//! failing attempt produces an [`EvidenceBundle`] that is persisted in the run
//! state before the next attempt, so an interrupted loop resumes with the same
//! evidence.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::backlog::{Backlog, WorkItem, WorkItemStatus};
use crate::core::evidence::{EvidenceBundle, FailingGate, LOG_TAIL_LINES, tail_lines};
use crate::core::fix_policy::{AttemptFacts, AttemptVerdict, decide, diff_hash};
use crate::core::guardrails::{GuardrailPolicy, check_changes};
use crate::core::stage::{RouteKey, Stage};
use crate::error::OrxError;
use crate::io::artifacts::{ArtifactKey, ArtifactStore};
use crate::io::executor::{ExecMode, ExecResult};
use crate::io::gates::{GateResult, GateRunner, GateStatus};
use crate::io::meta::ExecutorAttempt;
use crate::io::paths::RunPaths;
use crate::io::process::CancelToken;
use crate::io::prompt::{ItemPrompt, render_fix, render_implement};
use crate::io::run_state::{RunState, StateManager};
use crate::io::workspace::Workspace;
use crate::router::{Invocation, Routed, Router};

/// Collaborators shared by every item of a run.
pub struct FixLoop<'a> {
    pub router: &'a Router,
    pub gates: &'a GateRunner,
    pub policy: &'a GuardrailPolicy,
    pub states: &'a StateManager,
    pub max_attempts: u32,
    pub heartbeat: Option<Duration>,
    pub cancel: Option<&'a CancelToken>,
}

/// Mutable run data the loop reads and checkpoints.
pub struct ItemScope<'a> {
    pub state: &'a mut RunState,
    pub backlog: &'a mut Backlog,
    pub artifacts: &'a ArtifactStore,
    pub paths: &'a RunPaths,
    pub workspace: &'a Workspace,
    pub task: &'a str,
    pub spec: &'a str,
    pub executor_attempts: &'a mut Vec<ExecutorAttempt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub item_id: String,
    pub verdict: AttemptVerdict,
    pub attempts: u32,
    /// Why the item failed; `None` when it passed.
    pub reason: Option<String>,
}

impl ItemReport {
    pub fn passed(&self) -> bool {
        self.verdict == AttemptVerdict::Passed
    }
}

/// What one attempt left behind in the workspace.
#[derive(Debug, Clone)]
pub struct Verification {
    pub evidence: EvidenceBundle,
    pub gate_results: Vec<GateResult>,
    pub diff_hash: String,
    pub passed: bool,
}

impl FixLoop<'_> {
    /// Drive `item_id` to `done` or `failed`.
    ///
    /// The attempt counter is incremented and saved before each executor call.
    /// Cancellation surfaces as [`OrxError::Cancelled`] with the item left
    /// `in_progress`.
    #[instrument(skip_all, fields(item = %item_id))]
    pub fn run_item(&self, scope: &mut ItemScope<'_>, item_id: &str) -> Result<ItemReport> {
        let attempts = {
            let item = item_mut(scope.backlog, item_id)?;
            if item.status == WorkItemStatus::Todo {
                item.status = WorkItemStatus::InProgress;
            }
            item.attempts
        };
        scope.state.set_current_item(item_id, attempts);
        self.checkpoint(scope)?;
        info!(attempts, max_attempts = self.max_attempts, "item started");

        loop {
            self.ensure_not_cancelled()?;
            let item = item_mut(scope.backlog, item_id)?;
            if item.attempts >= self.max_attempts {
                return self.finish(scope, item_id, AttemptVerdict::Exhausted, None);
            }
            item.attempts += 1;
            let attempt = item.attempts;
            let snapshot = item.clone();
            scope.state.increment_iteration();
            self.checkpoint(scope)?;

            let previous = scope
                .state
                .last_failure_evidence
                .clone()
                .filter(|evidence| evidence.item_id == item_id);
            let routed = match &previous {
                Some(evidence) => self.attempt_fix(scope, &snapshot, evidence, attempt)?,
                None => self.implement(scope, &snapshot, attempt)?,
            };
            scope
                .executor_attempts
                .extend(routed.attempts.iter().cloned());
            if routed.result.extra.cancelled {
                return Err(OrxError::Cancelled.into());
            }

            let verification = self.verify(scope, item_id, attempt, &routed.result)?;
            let verdict = decide(&AttemptFacts {
                attempt,
                max_attempts: self.max_attempts,
                passed: verification.passed,
                executor_failed: !routed.result.success,
                diff_empty: verification.evidence.diff_empty,
                diff_hash: &verification.diff_hash,
                previous_hash: scope.state.last_diff_hash.as_deref(),
            });
            scope.state.last_diff_hash = Some(verification.diff_hash.clone());

            match verdict {
                AttemptVerdict::Passed => {
                    return self.finish(scope, item_id, verdict, None);
                }
                AttemptVerdict::Retry => {
                    let evidence = verification.evidence;
                    warn!(attempt, reason = %evidence.headline(), "attempt failed, retrying");
                    item_mut(scope.backlog, item_id)?.notes = Some(evidence.headline());
                    scope.artifacts.write_json(ArtifactKey::Evidence, &evidence)?;
                    scope.state.last_failure_evidence = Some(evidence);
                    self.checkpoint(scope)?;
                }
                _ => {
                    return self.finish(scope, item_id, verdict, Some(verification.evidence));
                }
            }
        }
    }

    /// First attempt: implement prompt, no evidence.
    pub fn implement(
        &self,
        scope: &ItemScope<'_>,
        item: &WorkItem,
        iteration: u32,
    ) -> Result<Routed> {
        let gates = self.gates.names();
        let prompt = render_implement(&self.item_prompt(scope, item, &gates))?;
        self.invoke(scope, Stage::ImplementItem.into(), &item.id, iteration, prompt)
    }

    /// Later attempts: fix prompt built from the previous attempt's evidence.
    pub fn attempt_fix(
        &self,
        scope: &ItemScope<'_>,
        item: &WorkItem,
        evidence: &EvidenceBundle,
        iteration: u32,
    ) -> Result<Routed> {
        let gates = self.gates.names();
        let prompt = render_fix(
            &self.item_prompt(scope, item, &gates),
            &evidence.render_markdown(),
            iteration,
            self.max_attempts,
        )?;
        self.invoke(scope, RouteKey::Fix, &item.id, iteration, prompt)
    }

    /// Inspect the workspace after an attempt: diff, guardrails, then gates.
    ///
    /// Gates only run when the executor succeeded, the guardrails hold and
    /// something changed.
    pub fn verify(
        &self,
        scope: &ItemScope<'_>,
        item_id: &str,
        iteration: u32,
        result: &ExecResult,
    ) -> Result<Verification> {
        let diff = scope.workspace.diff()?;
        let changed = scope.workspace.changed_files()?;
        let mut evidence = EvidenceBundle::new(item_id, iteration).with_diff(&diff);
        evidence.changed_files = changed.iter().map(|file| file.path.clone()).collect();
        if !result.success {
            evidence.executor_error = Some(result.failure_summary());
        }

        let guardrails = check_changes(self.policy, &changed)?;
        evidence.guardrail_violations = guardrails
            .violations
            .iter()
            .map(ToString::to_string)
            .collect();
        if !guardrails.ok {
            warn!(violations = %guardrails.summary(), "guardrail violations");
        }

        let mut gate_results = Vec::new();
        if result.success && guardrails.ok && !evidence.diff_empty {
            gate_results = self.gates.run_all(
                &scope.workspace.path,
                |gate| scope.paths.gate_log(gate, Some(item_id), Some(iteration)),
                self.heartbeat,
                self.cancel,
            )?;
            self.ensure_not_cancelled()?;
            for gate in &gate_results {
                if gate.blocks() {
                    evidence.failing_gates.push(failing_gate(gate)?);
                } else if gate.status == GateStatus::Failed {
                    evidence
                        .advisory_failures
                        .push(format!("{} ({})", gate.name, gate.message));
                }
            }
        }

        let passed = result.success
            && guardrails.ok
            && !evidence.diff_empty
            && gate_results.iter().all(|gate| !gate.blocks());
        Ok(Verification {
            diff_hash: diff_hash(&diff),
            evidence,
            gate_results,
            passed,
        })
    }

    fn item_prompt<'s>(
        &'s self,
        scope: &'s ItemScope<'_>,
        item: &'s WorkItem,
        gates: &'s [&'s str],
    ) -> ItemPrompt<'s> {
        ItemPrompt {
            task: scope.task,
            spec: scope.spec,
            item,
            policy: self.policy,
            gates,
        }
    }

    fn invoke(
        &self,
        scope: &ItemScope<'_>,
        route: RouteKey,
        item_id: &str,
        iteration: u32,
        prompt: String,
    ) -> Result<Routed> {
        let stage = route.stage();
        let prompt_path = scope.paths.prompt_path(stage, Some(item_id), Some(iteration));
        fs::write(&prompt_path, &prompt)
            .with_context(|| format!("write {}", prompt_path.display()))?;
        let invocation = Invocation {
            prompt,
            cwd: scope.workspace.path.clone(),
            logs: scope.paths.agent_logs(stage, Some(item_id), Some(iteration)),
            heartbeat: self.heartbeat,
            cancel: self.cancel.cloned(),
            item_id: Some(item_id.to_string()),
            iteration: Some(iteration),
        };
        info!(iteration, %route, "invoking executor");
        self.router.run_with_fallback(route, ExecMode::Apply, &invocation)
    }

    fn finish(
        &self,
        scope: &mut ItemScope<'_>,
        item_id: &str,
        verdict: AttemptVerdict,
        evidence: Option<EvidenceBundle>,
    ) -> Result<ItemReport> {
        let item = item_mut(scope.backlog, item_id)?;
        let attempts = item.attempts;
        let reason = if verdict == AttemptVerdict::Passed {
            item.status = WorkItemStatus::Done;
            item.notes = None;
            scope.state.last_failure_evidence = None;
            info!(attempts, "item done");
            None
        } else {
            let mut reason = verdict.describe(self.max_attempts);
            if let Some(evidence) = &evidence {
                reason.push_str(&format!(": {}", evidence.headline()));
            }
            item.status = WorkItemStatus::Failed;
            item.notes = Some(reason.clone());
            warn!(attempts, %reason, "item failed");
            Some(reason)
        };
        if let Some(evidence) = evidence {
            scope.artifacts.write_json(ArtifactKey::Evidence, &evidence)?;
            scope.state.last_failure_evidence = Some(evidence);
        }
        self.checkpoint(scope)?;
        Ok(ItemReport {
            item_id: item_id.to_string(),
            verdict,
            attempts,
            reason,
        })
    }

    /// Persist the run state and the backlog together.
    fn checkpoint(&self, scope: &ItemScope<'_>) -> Result<()> {
        scope
            .artifacts
            .write(ArtifactKey::Backlog, &scope.backlog.to_yaml()?)?;
        self.states.save(scope.state)
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(OrxError::Cancelled.into());
        }
        Ok(())
    }
}

fn item_mut<'b>(backlog: &'b mut Backlog, item_id: &str) -> Result<&'b mut WorkItem> {
    backlog
        .item_mut(item_id)
        .with_context(|| format!("backlog has no item {item_id}"))
}

fn failing_gate(gate: &GateResult) -> Result<FailingGate> {
    let log = match fs::read_to_string(&gate.log_path) {
        Ok(log) => log,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", gate.log_path.display()));
        }
    };
    Ok(FailingGate {
        name: gate.name.clone(),
        returncode: gate.returncode,
        message: gate.message.clone(),
        failing_tests: gate.failing_tests,
        log_tail: tail_lines(&log, LOG_TAIL_LINES),
    })
}
