//! Resume behavior: checkpoints, skipped stages and terminal runs.

use std::fs;
use std::sync::Arc;

use orx::core::stage::{Stage, StageStatus};
use orx::error::{OrxError, find_orx_error};
use orx::io::config::OrxConfig;
use orx::io::executor::ExecutorRegistry;
use orx::io::gates::{Gate, GateRunner};
use orx::io::meta::{ReviewVerdict, RunMeta};
use orx::io::paths::OrxPaths;
use orx::io::run_state::{RunState, StateManager};
use orx::io::workspace::WorkspaceManager;
use orx::runner::Runner;
use orx::test_support::{ScriptedExecutor, ScriptedGate, ScriptedStep, TestRepo};

const BACKLOG: &str = "items:
  - id: W001
    title: Add greeting module
    objective: Create greet.py
";

fn runner(repo: &TestRepo, executor: &ScriptedExecutor) -> Runner {
    let mut registry = ExecutorRegistry::default();
    registry.register(Arc::new(executor.clone()));
    let gates: Vec<Box<dyn Gate>> = vec![Box::new(ScriptedGate::passing("pytest"))];
    Runner::new(repo.path(), OrxConfig::default())
        .expect("runner")
        .with_registry(registry)
        .with_gates(GateRunner::new(gates))
}

/// Run until the review stage fails, then rewind the checkpoint so it looks
/// like the process died while `stage` was running.
fn interrupted_run(repo: &TestRepo, stage: Stage) -> (String, RunState) {
    let executor = ScriptedExecutor::new(
        "codex",
        vec![
            ScriptedStep::text("# Plan"),
            ScriptedStep::text("# Spec"),
            ScriptedStep::text(BACKLOG),
            ScriptedStep::apply(&[("greet.py", "def greet():\n    return 'hi'\n")]),
            ScriptedStep::failure("agent crashed"),
        ],
    );
    let outcome = runner(repo, &executor).run("Add greet").expect("run");
    assert_eq!(outcome.failed_stage, Some(Stage::Review));

    let states = StateManager::new(&orx::io::paths::OrxPaths::new(repo.path()));
    let mut state = states.load(&outcome.run_id).expect("load");
    state.current_stage = stage;
    state.failure_reason = None;
    if let Some(record) = state.stage_statuses.get_mut(&stage) {
        record.status = StageStatus::Running;
        record.error = None;
    }
    states.save(&state).expect("save");
    (outcome.run_id, state)
}

#[test]
fn resume_continues_at_checkpointed_stage() {
    let repo = TestRepo::new().expect("repo");
    let (run_id, _) = interrupted_run(&repo, Stage::Review);

    let executor = ScriptedExecutor::new("codex", vec![ScriptedStep::text("APPROVED")]);
    let runner = runner(&repo, &executor);
    let outcome = runner.resume(&run_id).expect("resume");
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(executor.calls(), 1);
    assert!(executor.prompts()[0].1.contains("greet.py"));

    let state = StateManager::new(runner.paths()).load(&run_id).expect("load");
    assert_eq!(state.current_stage, Stage::Done);
    assert_eq!(state.status_of(Stage::Review), StageStatus::Success);
    assert_eq!(state.status_of(Stage::Ship), StageStatus::Success);
}

#[test]
fn resume_skips_text_stages_with_existing_output() {
    let repo = TestRepo::new().expect("repo");
    let (run_id, _) = interrupted_run(&repo, Stage::Spec);

    // spec.md and backlog.yaml exist, the only item is done: review is the
    // first stage that needs the agent.
    let executor = ScriptedExecutor::new("codex", vec![ScriptedStep::text("APPROVED")]);
    let runner = runner(&repo, &executor);
    let outcome = runner.resume(&run_id).expect("resume");
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(executor.calls(), 1);
    let state = StateManager::new(runner.paths()).load(&run_id).expect("load");
    assert_eq!(state.status_of(Stage::Spec), StageStatus::Success);
    assert_eq!(state.status_of(Stage::Decompose), StageStatus::Success);
}

#[test]
fn review_without_pr_body_runs_again() {
    let repo = TestRepo::new().expect("repo");
    let (run_id, _) = interrupted_run(&repo, Stage::Review);
    let paths = OrxPaths::new(repo.path()).run(&run_id);
    fs::write(paths.artifacts_dir.join("review.md"), "partial").expect("write review");
    assert!(!paths.artifacts_dir.join("pr_body.md").exists());

    let executor = ScriptedExecutor::new("codex", vec![ScriptedStep::text("APPROVED")]);
    let outcome = runner(&repo, &executor).resume(&run_id).expect("resume");
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(executor.calls(), 1);
    assert!(paths.artifacts_dir.join("pr_body.md").exists());
    let review = fs::read_to_string(paths.artifacts_dir.join("review.md")).expect("review");
    assert_eq!(review.trim(), "APPROVED");
}

#[test]
fn skipped_review_restores_its_verdict() {
    let repo = TestRepo::new().expect("repo");
    let (run_id, _) = interrupted_run(&repo, Stage::Review);
    let paths = OrxPaths::new(repo.path()).run(&run_id);
    fs::write(paths.artifacts_dir.join("review.md"), "CHANGES_REQUESTED: rename").expect("review");
    fs::write(paths.artifacts_dir.join("pr_body.md"), "body").expect("pr body");

    let executor = ScriptedExecutor::new("codex", Vec::new());
    let outcome = runner(&repo, &executor).resume(&run_id).expect("resume");
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(executor.calls(), 0);
    let meta = RunMeta::load(&paths.meta_path).expect("meta").expect("meta present");
    assert_eq!(meta.review_verdict, Some(ReviewVerdict::ChangesRequested));
}

#[test]
fn resume_recreates_missing_worktree_at_baseline() {
    let repo = TestRepo::new().expect("repo");
    let (run_id, state) = interrupted_run(&repo, Stage::Review);
    let orx_paths = orx::io::paths::OrxPaths::new(repo.path());
    let worktree = orx_paths.run(&run_id).worktree;
    WorkspaceManager::new(&orx_paths)
        .destroy(&worktree)
        .expect("destroy");
    assert!(!worktree.exists());

    let executor = ScriptedExecutor::new("codex", vec![ScriptedStep::text("APPROVED")]);
    let outcome = runner(&repo, &executor).resume(&run_id).expect("resume");
    assert!(outcome.success, "{outcome:?}");
    assert!(worktree.join(".git").exists());
    let head = orx::io::git::Git::new(&worktree).head_sha().expect("head");
    assert_eq!(Some(head), state.baseline_sha);
}

#[test]
fn terminal_runs_are_not_resumable() {
    let repo = TestRepo::new().expect("repo");
    let executor = ScriptedExecutor::new("codex", vec![ScriptedStep::failure("boom")]);
    let runner = runner(&repo, &executor);
    let outcome = runner.run("Add greet").expect("run");
    assert!(!outcome.success);
    assert_eq!(outcome.failed_stage, Some(Stage::Plan));

    let err = runner.resume(&outcome.run_id).expect_err("terminal");
    assert!(matches!(
        find_orx_error(&err),
        Some(OrxError::NotResumable {
            stage: Stage::Failed,
            ..
        })
    ));
    assert_eq!(executor.calls(), 1);
}

#[test]
fn unknown_run_is_not_found() {
    let repo = TestRepo::new().expect("repo");
    let executor = ScriptedExecutor::new("codex", Vec::new());
    let err = runner(&repo, &executor)
        .resume("20260101_000000_deadbeef")
        .expect_err("missing");
    assert!(matches!(
        find_orx_error(&err),
        Some(OrxError::RunNotFound { .. })
    ));
}

#[test]
fn path_like_run_ids_are_not_found() {
    let repo = TestRepo::new().expect("repo");
    let executor = ScriptedExecutor::new("codex", Vec::new());
    for run_id in ["../..", "../../.git", "20260101_000000_deadbeef/.."] {
        let err = runner(&repo, &executor).resume(run_id).expect_err(run_id);
        assert!(matches!(
            find_orx_error(&err),
            Some(OrxError::RunNotFound { .. })
        ));
    }
}

#[test]
fn interrupted_item_resumes_with_its_attempt_count() {
    let repo = TestRepo::new().expect("repo");
    let (run_id, mut state) = interrupted_run(&repo, Stage::ImplementItem);

    // Put the item back in progress after one recorded attempt.
    let paths = orx::io::paths::OrxPaths::new(repo.path()).run(&run_id);
    let backlog_path = paths.context_dir.join("backlog.yaml");
    let backlog = fs::read_to_string(&backlog_path).expect("backlog");
    fs::write(&backlog_path, backlog.replace("status: done", "status: in_progress"))
        .expect("rewrite backlog");
    state.current_item_id = Some("W001".to_string());
    state.current_iteration = Some(1);
    StateManager::new(&orx::io::paths::OrxPaths::new(repo.path()))
        .save(&state)
        .expect("save");

    let executor = ScriptedExecutor::new(
        "codex",
        vec![
            ScriptedStep::apply(&[("greet.py", "def greet():\n    return 'hello'\n")]),
            ScriptedStep::text("APPROVED"),
        ],
    );
    let outcome = runner(&repo, &executor).resume(&run_id).expect("resume");
    assert!(outcome.success, "{outcome:?}");
    let backlog = fs::read_to_string(&backlog_path).expect("backlog");
    assert!(backlog.contains("attempts: 2"));
}
