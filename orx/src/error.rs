//! Typed failure conditions the CLI needs to tell apart.
//!
//! Everything else flows through `anyhow`; these variants ride inside an
//! `anyhow::Error` and are recovered with `downcast_ref`.

use crate::core::stage::Stage;

#[derive(Debug, thiserror::Error)]
pub enum OrxError {
    #[error("{path} is not inside a git repository")]
    NotAGitRepository { path: String },
    #[error("base branch `{branch}` does not resolve to a commit")]
    BaseBranchNotFound { branch: String },
    #[error("executor binary `{binary}` was not found on PATH")]
    MissingBinary { binary: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("run `{run_id}` not found")]
    RunNotFound { run_id: String },
    #[error("run `{run_id}` is at terminal stage `{stage}` and cannot be resumed")]
    NotResumable { run_id: String, stage: Stage },
    #[error("run cancelled")]
    Cancelled,
    #[error("invalid backlog: {0}")]
    InvalidBacklog(String),
}

impl OrxError {
    /// True for failures detected before any stage runs.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotAGitRepository { .. }
                | Self::BaseBranchNotFound { .. }
                | Self::MissingBinary { .. }
                | Self::InvalidConfig(_)
        )
    }
}

/// Find the first `OrxError` in an error chain.
pub fn find_orx_error(err: &anyhow::Error) -> Option<&OrxError> {
    err.chain().find_map(|cause| cause.downcast_ref::<OrxError>())
}
