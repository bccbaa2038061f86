//! Checkpointed orchestration of coding-agent CLIs.
//!
//! A run takes a task through a fixed pipeline (plan, spec, decompose,
//! implement/verify/fix per backlog item, review, ship) inside an isolated git
//! worktree. Every stage boundary is persisted so an interrupted run resumes
//! where it stopped. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (stages, backlog, guardrails, fix-loop
//!   decisions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution,
//!   executors, gates). Isolated behind traits to enable scripting in tests.
//!
//! Orchestration modules ([`runner`], [`fix_loop`], [`router`]) coordinate
//! core logic with I/O; [`status`] and [`clean`] back the remaining commands.

pub mod clean;
pub mod core;
pub mod error;
pub mod evidence_pack;
pub mod exit_codes;
pub mod fix_loop;
pub mod io;
pub mod logging;
pub mod router;
pub mod runner;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
