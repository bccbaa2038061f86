//! Process exit codes for the `orx` CLI.

use crate::error::{OrxError, find_orx_error};
use crate::runner::RunOutcome;

/// The command completed successfully (for `run`/`resume`: the run reached `done`).
pub const OK: i32 = 0;
/// The run reached the `failed` stage, or the command failed unexpectedly.
pub const RUN_FAILED: i32 = 1;
/// Configuration or precondition error detected before any stage ran.
pub const PRECONDITION: i32 = 2;
/// The requested run does not exist or is already terminal.
pub const NOT_RESUMABLE: i32 = 3;
/// The run was cancelled.
pub const CANCELLED: i32 = 130;

/// Exit code for a finished `run`/`resume`.
pub fn for_outcome(outcome: &RunOutcome) -> i32 {
    if outcome.success {
        OK
    } else if outcome.cancelled {
        CANCELLED
    } else {
        RUN_FAILED
    }
}

/// Exit code for a command that returned an error.
pub fn for_error(err: &anyhow::Error) -> i32 {
    match find_orx_error(err) {
        Some(typed) if typed.is_precondition() => PRECONDITION,
        Some(OrxError::NotResumable { .. } | OrxError::RunNotFound { .. }) => NOT_RESUMABLE,
        Some(OrxError::Cancelled) => CANCELLED,
        _ => RUN_FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::Stage;
    use anyhow::Context;

    #[test]
    fn typed_errors_map_to_distinct_codes() {
        let missing = Err::<(), _>(OrxError::MissingBinary {
            binary: "codex".to_string(),
        })
        .context("check preconditions")
        .unwrap_err();
        assert_eq!(for_error(&missing), PRECONDITION);

        let terminal = anyhow::Error::from(OrxError::NotResumable {
            run_id: "r".to_string(),
            stage: Stage::Done,
        });
        assert_eq!(for_error(&terminal), NOT_RESUMABLE);
        assert_eq!(for_error(&anyhow::anyhow!("disk full")), RUN_FAILED);
    }

    #[test]
    fn outcome_codes() {
        let mut outcome = RunOutcome {
            run_id: "r".to_string(),
            success: true,
            failed_stage: None,
            error: None,
            cancelled: false,
        };
        assert_eq!(for_outcome(&outcome), OK);
        outcome.success = false;
        assert_eq!(for_outcome(&outcome), RUN_FAILED);
        outcome.cancelled = true;
        assert_eq!(for_outcome(&outcome), CANCELLED);
    }
}
