//! I/O for the orchestrator: filesystem, git, child processes and agents.

pub mod artifacts;
pub mod config;
pub mod executor;
pub mod gates;
pub mod git;
pub mod meta;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod workspace;
