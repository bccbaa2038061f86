//! Pipeline driver: runs and resumes the stage state machine.
//!
//! `run` creates a run directory and an isolated worktree, then drives
//! `plan → spec → decompose → implement_item → review → ship → [knowledge_update]`.
//! State is checkpointed before each stage starts and after it completes, so a
//! crashed stage is re-executed on `resume` unless its output artifact is
//! already on disk.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::core::backlog::{Backlog, WorkItemStatus, parse_backlog};
use crate::core::stage::{PIPELINE, RouteKey, Stage, remaining_stages};
use crate::error::{OrxError, find_orx_error};
use crate::evidence_pack::EvidencePack;
use crate::fix_loop::{FixLoop, ItemScope};
use crate::io::artifacts::{ArtifactKey, ArtifactStore};
use crate::io::config::OrxConfig;
use crate::io::executor::{ExecMode, ExecutorRegistry};
use crate::io::gates::GateRunner;
use crate::io::git::Git;
use crate::io::meta::{ReviewVerdict, RunMeta};
use crate::io::paths::{OrxPaths, RunPaths};
use crate::io::process::{CancelToken, find_on_path};
use crate::io::prompt::{
    render_decompose, render_knowledge, render_plan, render_review, render_spec,
};
use crate::io::run_state::{RunState, StateManager, generate_run_id};
use crate::io::workspace::{Workspace, WorkspaceManager};
use crate::router::{Invocation, Resolution, Router};

/// Result of `run` or `resume`. In-pipeline failures land here, not in `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub success: bool,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
    pub cancelled: bool,
}

/// What a run would do, without creating one.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub base_branch: String,
    pub baseline_sha: String,
    pub stages: Vec<(RouteKey, Resolution)>,
    pub gates: Vec<String>,
}

impl fmt::Display for DryRunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "base branch: {} ({})", self.base_branch, self.baseline_sha)?;
        writeln!(f, "stages:")?;
        for (route, resolution) in &self.stages {
            write!(f, "  {route:<16} {}", resolution.executor)?;
            if let Some(model) = &resolution.selector.model {
                write!(f, " model={model}")?;
            }
            if let Some(profile) = &resolution.selector.profile {
                write!(f, " profile={profile}")?;
            }
            writeln!(f, " [{}]", resolution.source)?;
        }
        if self.gates.is_empty() {
            writeln!(f, "gates: none")
        } else {
            writeln!(f, "gates: {}", self.gates.join(", "))
        }
    }
}

/// Run-scoped values threaded through every stage.
struct RunContext {
    paths: RunPaths,
    artifacts: ArtifactStore,
    workspace: Workspace,
    task: String,
    meta: RunMeta,
}

impl RunContext {
    fn backlog(&self) -> Result<Backlog> {
        let raw = self.artifacts.require(ArtifactKey::Backlog)?;
        parse_backlog(&raw).context("load backlog artifact")
    }
}

pub struct Runner {
    paths: OrxPaths,
    config: OrxConfig,
    router: Router,
    gates: GateRunner,
    states: StateManager,
    workspaces: WorkspaceManager,
    cancel: CancelToken,
}

impl Runner {
    /// Build a runner for the repository containing `dir`.
    ///
    /// Executors and gates come from `config`; tests swap them with
    /// [`with_registry`](Self::with_registry) and [`with_gates`](Self::with_gates).
    pub fn new(dir: &Path, config: OrxConfig) -> Result<Self> {
        config.validate()?;
        let root = Git::new(dir)
            .toplevel()
            .unwrap_or_else(|_| dir.to_path_buf());
        let paths = OrxPaths::new(root);
        let registry = ExecutorRegistry::from_config(&config);
        Ok(Self {
            router: Router::new(&config, registry),
            gates: GateRunner::from_config(&config.gates, config.run.output_limit_bytes),
            states: StateManager::new(&paths),
            workspaces: WorkspaceManager::new(&paths),
            cancel: CancelToken::new(),
            paths,
            config,
        })
    }

    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.router = Router::new(&self.config, registry);
        self
    }

    pub fn with_gates(mut self, gates: GateRunner) -> Self {
        self.gates = gates;
        self
    }

    /// Token that aborts the run at the next safe point when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn paths(&self) -> &OrxPaths {
        &self.paths
    }

    pub fn states(&self) -> &StateManager {
        &self.states
    }

    /// Stages this configuration will execute, in order.
    pub fn active_stages(&self) -> Vec<Stage> {
        PIPELINE
            .iter()
            .copied()
            .filter(|stage| self.stage_enabled(*stage))
            .collect()
    }

    fn stage_enabled(&self, stage: Stage) -> bool {
        stage != Stage::KnowledgeUpdate || self.config.knowledge.enabled
    }

    /// Fail fast before anything is written. Returns the resolved baseline sha.
    pub fn check_preconditions(&self) -> Result<String> {
        self.check_repository()?;
        let baseline_sha = self.workspaces.resolve_base(&self.config.git.base_branch)?;
        self.check_binaries()?;
        Ok(baseline_sha)
    }

    fn check_repository(&self) -> Result<()> {
        if !self.workspaces.repo().is_repository() {
            return Err(OrxError::NotAGitRepository {
                path: self.paths.root.display().to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn check_binaries(&self) -> Result<()> {
        for stage in self.active_stages() {
            let (executor, _) = self
                .router
                .resolve(stage)
                .map_err(|err| OrxError::InvalidConfig(format!("{stage}: {err:#}")))?;
            if let Some(binary) = executor.binary()
                && find_on_path(binary).is_none()
            {
                return Err(OrxError::MissingBinary {
                    binary: binary.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Resolve everything a run needs without creating one.
    pub fn dry_run(&self) -> Result<DryRunReport> {
        let baseline_sha = self.check_preconditions()?;
        Ok(DryRunReport {
            base_branch: self.config.git.base_branch.clone(),
            baseline_sha,
            stages: self
                .active_stages()
                .into_iter()
                .flat_map(|stage| {
                    let mut routes = vec![RouteKey::Stage(stage)];
                    if stage == Stage::ImplementItem {
                        routes.push(RouteKey::Fix);
                    }
                    routes
                })
                .map(|route| (route, self.router.resolution(route)))
                .collect(),
            gates: self.gates.names().into_iter().map(str::to_string).collect(),
        })
    }

    /// Create a run for `task` and drive it to `done` or `failed`.
    #[instrument(skip_all)]
    pub fn run(&self, task: &str) -> Result<RunOutcome> {
        if task.trim().is_empty() {
            return Err(anyhow!("task must not be empty"));
        }
        self.check_preconditions()?;

        let run_id = generate_run_id();
        let paths = self.paths.run(&run_id);
        paths.create_dirs()?;
        let artifacts = ArtifactStore::new(&paths);
        artifacts.write(ArtifactKey::Task, task)?;

        let base_branch = &self.config.git.base_branch;
        let workspace = self.workspaces.create(&run_id, base_branch)?;
        let mut state = RunState::new(&run_id);
        state.set_baseline_sha(&workspace.baseline_sha)?;
        let mut meta = RunMeta::new(&run_id, task, base_branch, &self.config.engine.executor);
        meta.warnings = self.workspaces.validate_baseline(
            &workspace,
            base_branch,
            &self.config.git.remote,
        );
        info!(run_id = %run_id, baseline_sha = %workspace.baseline_sha, "run created");

        let mut ctx = RunContext {
            paths,
            artifacts,
            workspace,
            task: task.to_string(),
            meta,
        };
        self.checkpoint(&mut state, &mut ctx)?;
        self.drive(&mut state, &mut ctx, false)
    }

    /// Continue a checkpointed run from its recorded stage.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub fn resume(&self, run_id: &str) -> Result<RunOutcome> {
        let mut state = self.states.load(run_id)?;
        if !state.is_resumable() {
            return Err(OrxError::NotResumable {
                run_id: run_id.to_string(),
                stage: state.current_stage,
            }
            .into());
        }
        self.check_repository()?;
        self.check_binaries()?;

        let paths = self.paths.run(run_id);
        paths.create_dirs()?;
        let artifacts = ArtifactStore::new(&paths);
        let task = artifacts.require(ArtifactKey::Task)?;
        let baseline_sha = state
            .baseline_sha
            .clone()
            .with_context(|| format!("run {run_id} has no recorded baseline"))?;
        let workspace = self.workspaces.restore(run_id, &baseline_sha)?;
        let meta = match RunMeta::load(&paths.meta_path)? {
            Some(meta) => meta,
            None => RunMeta::new(
                run_id,
                &task,
                &self.config.git.base_branch,
                &self.config.engine.executor,
            ),
        };
        info!(stage = %state.current_stage, item = ?state.current_item_id, "resuming run");

        let mut ctx = RunContext {
            paths,
            artifacts,
            workspace,
            task,
            meta,
        };
        self.drive(&mut state, &mut ctx, true)
    }

    fn drive(
        &self,
        state: &mut RunState,
        ctx: &mut RunContext,
        resuming: bool,
    ) -> Result<RunOutcome> {
        for stage in remaining_stages(state.current_stage) {
            if !self.stage_enabled(stage) {
                continue;
            }
            if let Err(err) = self.ensure_not_cancelled() {
                return self.fail(state, ctx, stage, err);
            }
            if resuming && self.output_present(ctx, stage)? {
                info!(stage = %stage, "output already present, skipping");
                if stage == Stage::Review && ctx.meta.review_verdict.is_none() {
                    let review = ctx.artifacts.require(ArtifactKey::Review)?;
                    ctx.meta.review_verdict = Some(ReviewVerdict::from_review(&review));
                }
                state.transition_to(stage);
                state.mark_stage_completed(stage);
                self.checkpoint(state, ctx)?;
                continue;
            }

            state.transition_to(stage);
            self.checkpoint(state, ctx)?;
            info!(stage = %stage, "stage started");

            let result = match stage {
                Stage::Plan => self.plan(ctx),
                Stage::Spec => self.spec(ctx),
                Stage::Decompose => self.decompose(ctx),
                Stage::ImplementItem => self.implement(state, ctx),
                Stage::Review => self.review(ctx),
                Stage::Ship => self.ship(ctx),
                Stage::KnowledgeUpdate => self.knowledge(ctx),
                Stage::Init | Stage::Done | Stage::Failed => Ok(()),
            };
            match result {
                Ok(()) => {
                    state.mark_stage_completed(stage);
                    self.checkpoint(state, ctx)?;
                    info!(stage = %stage, "stage completed");
                }
                Err(err)
                    if stage == Stage::KnowledgeUpdate
                        && !matches!(find_orx_error(&err), Some(OrxError::Cancelled)) =>
                {
                    warn!(error = %format!("{err:#}"), "knowledge update failed, ignoring");
                    state.mark_stage_failed(stage, format!("{err:#}"));
                    self.checkpoint(state, ctx)?;
                }
                Err(err) => return self.fail(state, ctx, stage, err),
            }
        }

        state.transition_to(Stage::Done);
        self.checkpoint(state, ctx)?;
        info!(run_id = %state.run_id, "run done");
        Ok(RunOutcome {
            run_id: state.run_id.clone(),
            success: true,
            failed_stage: None,
            error: None,
            cancelled: false,
        })
    }

    fn fail(
        &self,
        state: &mut RunState,
        ctx: &mut RunContext,
        stage: Stage,
        err: anyhow::Error,
    ) -> Result<RunOutcome> {
        let cancelled = matches!(find_orx_error(&err), Some(OrxError::Cancelled));
        let reason = if cancelled {
            "cancelled".to_string()
        } else {
            format!("{err:#}")
        };
        error!(stage = %stage, reason = %reason, "run failed");
        if state.current_stage != stage {
            state.transition_to(stage);
        }
        state.fail(reason.clone());
        self.checkpoint(state, ctx)?;
        Ok(RunOutcome {
            run_id: state.run_id.clone(),
            success: false,
            failed_stage: Some(stage),
            error: Some(reason),
            cancelled,
        })
    }

    /// Persist state and refresh `meta.json`.
    fn checkpoint(&self, state: &mut RunState, ctx: &mut RunContext) -> Result<()> {
        self.states.save(state)?;
        ctx.meta.sync_state(state);
        ctx.meta.save(&ctx.paths.meta_path)
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OrxError::Cancelled.into());
        }
        Ok(())
    }

    /// Text stages whose output artifacts all survived a crash are not re-run.
    fn output_present(&self, ctx: &RunContext, stage: Stage) -> Result<bool> {
        let keys = output_artifacts(stage);
        if !stage.is_text_stage() || keys.is_empty() {
            return Ok(false);
        }
        for key in keys {
            if !ctx.artifacts.is_present(*key)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn invoke_text(
        &self,
        ctx: &mut RunContext,
        stage: Stage,
        prompt: String,
        iteration: Option<u32>,
    ) -> Result<String> {
        let prompt_path = ctx.paths.prompt_path(stage, None, iteration);
        fs::write(&prompt_path, &prompt)
            .with_context(|| format!("write {}", prompt_path.display()))?;
        let invocation = Invocation {
            prompt,
            cwd: ctx.workspace.path.clone(),
            logs: ctx.paths.agent_logs(stage, None, iteration),
            heartbeat: self.config.heartbeat(),
            cancel: Some(self.cancel.clone()),
            item_id: None,
            iteration,
        };
        let routed = self
            .router
            .run_with_fallback(stage, ExecMode::Text, &invocation)?;
        ctx.meta.executor_attempts.extend(routed.attempts);
        let result = routed.result;
        if result.extra.cancelled {
            return Err(OrxError::Cancelled.into());
        }
        if !result.success {
            return Err(anyhow!("{stage} executor failed: {}", result.failure_summary()));
        }
        let output = result.stdout_text()?;
        if output.trim().is_empty() {
            return Err(anyhow!("{stage} executor produced no output"));
        }
        Ok(output)
    }

    fn plan(&self, ctx: &mut RunContext) -> Result<()> {
        let prompt = render_plan(&ctx.task)?;
        let plan = self.invoke_text(ctx, Stage::Plan, prompt, None)?;
        ctx.artifacts.write(ArtifactKey::Plan, &plan)?;
        Ok(())
    }

    fn spec(&self, ctx: &mut RunContext) -> Result<()> {
        let plan = ctx.artifacts.require(ArtifactKey::Plan)?;
        let prompt = render_spec(&ctx.task, &plan)?;
        let spec = self.invoke_text(ctx, Stage::Spec, prompt, None)?;
        ctx.artifacts.write(ArtifactKey::Spec, &spec)?;
        Ok(())
    }

    /// Ask for a backlog; one retry with the validation error appended.
    fn decompose(&self, ctx: &mut RunContext) -> Result<()> {
        let spec = ctx.artifacts.require(ArtifactKey::Spec)?;
        let mut rejection: Option<anyhow::Error> = None;
        for attempt in 1..=2u32 {
            let feedback = rejection.as_ref().map(|err| format!("{err:#}"));
            let prompt = render_decompose(&ctx.task, &spec, feedback.as_deref())?;
            let iteration = (attempt > 1).then_some(attempt);
            let output = self.invoke_text(ctx, Stage::Decompose, prompt, iteration)?;
            match parse_backlog(&output) {
                Ok(parsed) => {
                    let mut backlog = parsed.coalesce(self.config.run.max_backlog_items);
                    backlog.run_id = Some(ctx.paths.run_id.clone());
                    ctx.artifacts
                        .write(ArtifactKey::Backlog, &backlog.to_yaml()?)?;
                    ctx.meta.sync_backlog(&backlog);
                    info!(items = backlog.items.len(), "backlog accepted");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %format!("{err:#}"), "backlog rejected");
                    rejection = Some(err);
                }
            }
        }
        let err = rejection.unwrap_or_else(|| anyhow!("no backlog produced"));
        Err(err.context("decompose output rejected twice"))
    }

    fn implement(&self, state: &mut RunState, ctx: &mut RunContext) -> Result<()> {
        let mut backlog = ctx.backlog()?;
        let spec = ctx.artifacts.require(ArtifactKey::Spec)?;
        let fix_loop = FixLoop {
            router: &self.router,
            gates: &self.gates,
            policy: &self.config.guardrails,
            states: &self.states,
            max_attempts: self.config.run.max_fix_attempts,
            heartbeat: self.config.heartbeat(),
            cancel: Some(&self.cancel),
        };

        let mut failures = Vec::new();
        while let Some(item_id) = backlog.next_ready().map(|item| item.id.clone()) {
            self.ensure_not_cancelled()?;
            let report = {
                let mut scope = ItemScope {
                    state: &mut *state,
                    backlog: &mut backlog,
                    artifacts: &ctx.artifacts,
                    paths: &ctx.paths,
                    workspace: &ctx.workspace,
                    task: &ctx.task,
                    spec: &spec,
                    executor_attempts: &mut ctx.meta.executor_attempts,
                };
                fix_loop.run_item(&mut scope, &item_id)
            };
            ctx.meta.sync_backlog(&backlog);
            let report = report?;

            if report.passed() {
                if self.config.git.auto_commit {
                    self.commit_item(ctx, &backlog, &item_id)?;
                }
                continue;
            }
            let reason = report.reason.unwrap_or_else(|| "failed".to_string());
            failures.push(format!("{item_id}: {reason}"));
            let skipped = skip_dependents(&mut backlog, &item_id);
            if !skipped.is_empty() {
                warn!(item = %item_id, skipped = ?skipped, "dependents skipped");
            }
            ctx.artifacts
                .write(ArtifactKey::Backlog, &backlog.to_yaml()?)?;
            ctx.meta.sync_backlog(&backlog);
            if self.config.run.stop_on_first_failure {
                break;
            }
        }

        if !failures.is_empty() {
            return Err(anyhow!("work item failed: {}", failures.join("; ")));
        }
        if backlog.is_blocked() {
            let waiting: Vec<&str> = backlog
                .items
                .iter()
                .filter(|item| item.status == WorkItemStatus::Todo)
                .map(|item| item.id.as_str())
                .collect();
            return Err(anyhow!(
                "backlog blocked: no ready item among {}",
                waiting.join(", ")
            ));
        }
        Ok(())
    }

    fn commit_item(&self, ctx: &RunContext, backlog: &Backlog, item_id: &str) -> Result<()> {
        let title = backlog
            .item(item_id)
            .map(|item| item.title.as_str())
            .unwrap_or_default();
        let message = format!("orx: {item_id} {title}");
        if ctx.workspace.commit_all(message.trim_end())? {
            info!(item = %item_id, "item committed");
        }
        Ok(())
    }

    fn review(&self, ctx: &mut RunContext) -> Result<()> {
        let spec = ctx.artifacts.require(ArtifactKey::Spec)?;
        let backlog_yaml = ctx.artifacts.require(ArtifactKey::Backlog)?;
        let diff = ctx.workspace.diff()?;
        let prompt = render_review(&spec, &backlog_yaml, &diff)?;
        let review = self.invoke_text(ctx, Stage::Review, prompt, None)?;
        ctx.artifacts.write(ArtifactKey::Review, &review)?;

        let verdict = ReviewVerdict::from_review(&review);
        if verdict == ReviewVerdict::ChangesRequested {
            warn!("review requested changes (advisory)");
        }
        ctx.meta.review_verdict = Some(verdict);
        let backlog = ctx.backlog()?;
        ctx.artifacts
            .write(ArtifactKey::PrBody, &pr_body(&ctx.meta.task_summary, &backlog, &review))?;
        Ok(())
    }

    /// Capture the final patch straight from git, then optionally commit and push.
    fn ship(&self, ctx: &mut RunContext) -> Result<()> {
        let diff = ctx.workspace.diff()?;
        let path = ctx.artifacts.write(ArtifactKey::PatchDiff, &diff)?;
        info!(path = %path.display(), bytes = diff.len(), "patch written");

        let git = &self.config.git;
        if git.auto_commit {
            let message = format!("orx: {}", ctx.meta.task_summary);
            if ctx.workspace.commit_all(&message)? {
                info!("run changes committed");
            }
        }
        if git.auto_push {
            if !git.auto_commit {
                warn!("auto_push without auto_commit pushes only what is already committed");
            }
            let branch = format!("orx/{}", ctx.paths.run_id);
            ctx.workspace.git().push_head(&git.remote, &branch)?;
            info!(remote = %git.remote, branch = %branch, "pushed");
        }
        Ok(())
    }

    fn knowledge(&self, ctx: &mut RunContext) -> Result<()> {
        let pack = EvidencePack::collect(&ctx.artifacts, &ctx.paths, &ctx.workspace)?;
        let prompt = render_knowledge(&pack)?;
        let notes = self.invoke_text(ctx, Stage::KnowledgeUpdate, prompt, None)?;
        ctx.artifacts.write(ArtifactKey::Knowledge, &notes)?;
        Ok(())
    }
}

/// Artifacts a text stage produces.
fn output_artifacts(stage: Stage) -> &'static [ArtifactKey] {
    match stage {
        Stage::Plan => &[ArtifactKey::Plan],
        Stage::Spec => &[ArtifactKey::Spec],
        Stage::Decompose => &[ArtifactKey::Backlog],
        Stage::Review => &[ArtifactKey::Review, ArtifactKey::PrBody],
        Stage::KnowledgeUpdate => &[ArtifactKey::Knowledge],
        _ => &[],
    }
}

/// Mark every `todo` item that transitively depends on `failed_id` as skipped.
fn skip_dependents(backlog: &mut Backlog, failed_id: &str) -> Vec<String> {
    let mut blocked = vec![failed_id.to_string()];
    let mut skipped = Vec::new();
    loop {
        let next = backlog.items.iter_mut().find(|item| {
            item.status == WorkItemStatus::Todo
                && item.depends_on.iter().any(|dep| blocked.contains(dep))
        });
        let Some(item) = next else {
            return skipped;
        };
        item.status = WorkItemStatus::Skipped;
        item.notes = Some(format!("skipped: depends on failed {failed_id}"));
        blocked.push(item.id.clone());
        skipped.push(item.id.clone());
    }
}

fn pr_body(summary: &str, backlog: &Backlog, review: &str) -> String {
    let mut body = format!("## Summary\n\n{summary}\n\n## Work items\n\n");
    for item in &backlog.items {
        let mark = if item.status == WorkItemStatus::Done {
            "x"
        } else {
            " "
        };
        body.push_str(&format!("- [{mark}] {} {}\n", item.id, item.title));
    }
    body.push_str(&format!("\n## Review\n\n{}\n", review.trim()));
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backlog::WorkItem;

    fn backlog() -> Backlog {
        let a = WorkItem::new("W001", "A", "a");
        let mut b = WorkItem::new("W002", "B", "b");
        b.depends_on = vec!["W001".to_string()];
        let mut c = WorkItem::new("W003", "C", "c");
        c.depends_on = vec!["W002".to_string()];
        let d = WorkItem::new("W004", "D", "d");
        Backlog {
            run_id: None,
            items: vec![a, b, c, d],
        }
    }

    #[test]
    fn skips_transitive_dependents_only() {
        let mut backlog = backlog();
        backlog.items[0].status = WorkItemStatus::Failed;
        let skipped = skip_dependents(&mut backlog, "W001");
        assert_eq!(skipped, vec!["W002", "W003"]);
        assert_eq!(backlog.items[3].status, WorkItemStatus::Todo);
        assert!(!backlog.is_blocked());
    }

    #[test]
    fn pr_body_checks_done_items() {
        let mut backlog = backlog();
        backlog.items[0].status = WorkItemStatus::Done;
        let body = pr_body("Add flag", &backlog, "APPROVED\n");
        assert!(body.starts_with("## Summary\n\nAdd flag\n"));
        assert!(body.contains("- [x] W001 A\n"));
        assert!(body.contains("- [ ] W002 B\n"));
        assert!(body.ends_with("## Review\n\nAPPROVED\n"));
    }

    #[test]
    fn only_text_stages_have_outputs() {
        assert_eq!(output_artifacts(Stage::Decompose), &[ArtifactKey::Backlog]);
        assert_eq!(
            output_artifacts(Stage::Review),
            &[ArtifactKey::Review, ArtifactKey::PrBody]
        );
        assert!(output_artifacts(Stage::ImplementItem).is_empty());
        assert!(output_artifacts(Stage::Ship).is_empty());
    }

    #[test]
    fn dry_run_report_lists_stages_and_gates() {
        let report = DryRunReport {
            base_branch: "main".to_string(),
            baseline_sha: "abc".to_string(),
            stages: vec![(
                Stage::Plan.into(),
                Router::new(&OrxConfig::default(), ExecutorRegistry::default())
                    .resolution(Stage::Plan),
            )],
            gates: vec!["ruff".to_string(), "pytest".to_string()],
        };
        let text = report.to_string();
        assert!(text.contains("base branch: main (abc)"));
        assert!(text.contains("  plan             codex"));
        assert!(text.contains("codex"));
        assert!(text.contains("gates: ruff, pytest"));
    }
}
