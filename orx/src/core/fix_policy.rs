//! Stop rules for the bounded fix loop.

use sha2::{Digest, Sha256};

/// What the fix loop does after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptVerdict {
    /// Guardrails and required gates passed.
    Passed,
    /// Try again with the new evidence.
    Retry,
    /// `max_fix_attempts` used up.
    Exhausted,
    /// The diff is byte-identical to the previous attempt's.
    NoProgress,
    /// The final allowed attempt ran cleanly but made no changes.
    EmptyOnFinal,
}

impl AttemptVerdict {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Exhausted | Self::NoProgress | Self::EmptyOnFinal)
    }

    pub fn describe(&self, max_attempts: u32) -> String {
        match self {
            Self::Passed => "passed".to_string(),
            Self::Retry => "retrying".to_string(),
            Self::Exhausted => format!("fix attempts exhausted ({max_attempts})"),
            Self::NoProgress => "no progress: diff identical to previous attempt".to_string(),
            Self::EmptyOnFinal => "final attempt made no changes".to_string(),
        }
    }
}

/// Facts about one finished attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptFacts<'a> {
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub passed: bool,
    /// The executor itself reported failure.
    pub executor_failed: bool,
    pub diff_empty: bool,
    pub diff_hash: &'a str,
    /// Hash of the previous attempt's diff for the same item.
    pub previous_hash: Option<&'a str>,
}

pub fn decide(facts: &AttemptFacts<'_>) -> AttemptVerdict {
    if facts.passed {
        return AttemptVerdict::Passed;
    }
    let last = facts.attempt >= facts.max_attempts;
    if facts.diff_empty {
        return match (last, facts.executor_failed) {
            (false, _) => AttemptVerdict::Retry,
            (true, true) => AttemptVerdict::Exhausted,
            (true, false) => AttemptVerdict::EmptyOnFinal,
        };
    }
    if facts.previous_hash == Some(facts.diff_hash) {
        return AttemptVerdict::NoProgress;
    }
    if last {
        AttemptVerdict::Exhausted
    } else {
        AttemptVerdict::Retry
    }
}

/// Stable fingerprint of a diff (sha256, lowercase hex).
pub fn diff_hash(diff: &str) -> String {
    hex::encode(Sha256::digest(diff.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts<'a>(
        attempt: u32,
        diff_empty: bool,
        hash: &'a str,
        prev: Option<&'a str>,
    ) -> AttemptFacts<'a> {
        AttemptFacts {
            attempt,
            max_attempts: 3,
            passed: false,
            executor_failed: false,
            diff_empty,
            diff_hash: hash,
            previous_hash: prev,
        }
    }

    #[test]
    fn pass_wins() {
        let mut f = facts(3, false, "a", Some("a"));
        f.passed = true;
        assert_eq!(decide(&f), AttemptVerdict::Passed);
    }

    #[test]
    fn identical_diffs_stop_before_bound() {
        assert_eq!(decide(&facts(1, false, "a", None)), AttemptVerdict::Retry);
        assert_eq!(
            decide(&facts(2, false, "a", Some("a"))),
            AttemptVerdict::NoProgress
        );
    }

    #[test]
    fn empty_diff_retries_until_final_attempt() {
        let empty = diff_hash("");
        assert_eq!(decide(&facts(1, true, &empty, None)), AttemptVerdict::Retry);
        assert_eq!(
            decide(&facts(2, true, &empty, Some(&empty))),
            AttemptVerdict::Retry
        );
        assert_eq!(
            decide(&facts(3, true, &empty, Some(&empty))),
            AttemptVerdict::EmptyOnFinal
        );
    }

    #[test]
    fn failed_executor_on_final_attempt_is_not_an_empty_diff() {
        let empty = diff_hash("");
        let mut f = facts(3, true, &empty, None);
        f.executor_failed = true;
        assert_eq!(decide(&f), AttemptVerdict::Exhausted);
        f.attempt = 1;
        assert_eq!(decide(&f), AttemptVerdict::Retry);
    }

    #[test]
    fn bound_exhausts() {
        let verdict = decide(&facts(3, false, "c", Some("b")));
        assert_eq!(verdict, AttemptVerdict::Exhausted);
        assert!(verdict.is_terminal_failure());
        assert_eq!(verdict.describe(3), "fix attempts exhausted (3)");
    }

    #[test]
    fn hash_is_stable_hex() {
        let h = diff_hash("diff --git a/x b/x\n");
        assert_eq!(h.len(), 64);
        assert_eq!(h, diff_hash("diff --git a/x b/x\n"));
        assert_ne!(h, diff_hash("other"));
    }
}
