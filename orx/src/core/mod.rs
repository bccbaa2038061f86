//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backlog;
pub mod evidence;
pub mod fix_policy;
pub mod guardrails;
pub mod stage;
