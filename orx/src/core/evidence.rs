//! Failure evidence carried from one fix attempt into the next.

use serde::{Deserialize, Serialize};

/// Lines of each failing gate log kept in the bundle.
pub const LOG_TAIL_LINES: usize = 50;
/// Characters of the patch kept in the bundle.
pub const DIFF_CHAR_LIMIT: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingGate {
    pub name: String,
    pub returncode: Option<i32>,
    pub message: String,
    pub failing_tests: Option<u32>,
    pub log_tail: String,
}

/// Everything the next attempt needs to know about why this one failed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub item_id: String,
    pub iteration: u32,
    /// The attempt left the workspace identical to the baseline.
    pub diff_empty: bool,
    pub patch_diff: String,
    pub diff_truncated: bool,
    pub changed_files: Vec<String>,
    pub guardrail_violations: Vec<String>,
    pub failing_gates: Vec<FailingGate>,
    pub advisory_failures: Vec<String>,
    pub executor_error: Option<String>,
}

impl EvidenceBundle {
    pub fn new(item_id: &str, iteration: u32) -> Self {
        Self {
            item_id: item_id.to_string(),
            iteration,
            ..Self::default()
        }
    }

    pub fn with_diff(mut self, diff: &str) -> Self {
        self.diff_empty = diff.trim().is_empty();
        let (kept, truncated) = truncate_chars(diff, DIFF_CHAR_LIMIT);
        self.patch_diff = kept;
        self.diff_truncated = truncated;
        self
    }

    /// One-line description for logs and `RunState.failure_reason`.
    pub fn headline(&self) -> String {
        if let Some(err) = &self.executor_error {
            return format!("executor failed: {err}");
        }
        if self.diff_empty {
            return "no changes were made".to_string();
        }
        if !self.guardrail_violations.is_empty() {
            return format!(
                "guardrail violations: {}",
                self.guardrail_violations.join("; ")
            );
        }
        if !self.failing_gates.is_empty() {
            let names: Vec<&str> = self.failing_gates.iter().map(|g| g.name.as_str()).collect();
            return format!("required gates failed: {}", names.join(", "));
        }
        "attempt failed".to_string()
    }

    /// Markdown block inserted into the fix prompt.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "## Evidence from attempt {} of {}\n\n",
            self.iteration, self.item_id
        ));
        if self.diff_empty {
            out.push_str(
                "**NO CHANGES WERE MADE.** The previous attempt did not modify any file. \
                 You must edit files in the working directory to complete this item.\n\n",
            );
        }
        if let Some(err) = &self.executor_error {
            out.push_str(&format!("### Executor error\n\n{err}\n\n"));
        }
        if !self.guardrail_violations.is_empty() {
            out.push_str("### Guardrail violations\n\nRevert or avoid these changes:\n\n");
            for violation in &self.guardrail_violations {
                out.push_str(&format!("- {violation}\n"));
            }
            out.push('\n');
        }
        for gate in &self.failing_gates {
            out.push_str(&format!("### Gate `{}` failed", gate.name));
            if let Some(code) = gate.returncode {
                out.push_str(&format!(" (exit {code})"));
            }
            if let Some(count) = gate.failing_tests {
                out.push_str(&format!(", {count} failing tests"));
            }
            out.push_str("\n\n");
            if !gate.message.is_empty() {
                out.push_str(&format!("{}\n\n", gate.message));
            }
            out.push_str(&format!("```\n{}\n```\n\n", gate.log_tail.trim_end()));
        }
        if !self.advisory_failures.is_empty() {
            out.push_str(&format!(
                "Advisory gates also failed: {}\n\n",
                self.advisory_failures.join(", ")
            ));
        }
        if !self.changed_files.is_empty() {
            out.push_str("### Changed files\n\n");
            for path in &self.changed_files {
                out.push_str(&format!("- {path}\n"));
            }
            out.push('\n');
        }
        if !self.diff_empty {
            out.push_str("### Current diff\n\n```diff\n");
            out.push_str(self.patch_diff.trim_end());
            if self.diff_truncated {
                out.push_str("\n... [diff truncated]");
            }
            out.push_str("\n```\n");
        }
        out
    }
}

/// Last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Truncate to at most `limit` characters, reporting whether anything was cut.
pub fn truncate_chars(text: &str, limit: usize) -> (String, bool) {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => (text[..byte_idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_diff_is_called_out_first() {
        let bundle = EvidenceBundle::new("W001", 1).with_diff("  \n");
        assert!(bundle.diff_empty);
        let rendered = bundle.render_markdown();
        assert!(rendered.contains("NO CHANGES WERE MADE"));
        assert!(!rendered.contains("Current diff"));
        assert_eq!(bundle.headline(), "no changes were made");
    }

    #[test]
    fn diff_is_truncated_to_limit() {
        let diff = "x".repeat(DIFF_CHAR_LIMIT + 10);
        let bundle = EvidenceBundle::new("W001", 2).with_diff(&diff);
        assert!(bundle.diff_truncated);
        assert_eq!(bundle.patch_diff.chars().count(), DIFF_CHAR_LIMIT);
        assert!(bundle.render_markdown().contains("[diff truncated]"));
    }

    #[test]
    fn renders_gates_and_violations() {
        let mut bundle = EvidenceBundle::new("W002", 1).with_diff("+line\n");
        bundle
            .guardrail_violations
            .push("a.txt: not covered by any allowed pattern".to_string());
        bundle.failing_gates.push(FailingGate {
            name: "pytest".to_string(),
            returncode: Some(1),
            message: String::new(),
            failing_tests: Some(2),
            log_tail: "FAILED test_a\n2 failed".to_string(),
        });
        let rendered = bundle.render_markdown();
        assert!(rendered.contains("### Guardrail violations"));
        assert!(rendered.contains("Gate `pytest` failed (exit 1), 2 failing tests"));
        assert!(rendered.contains("+line"));
        assert!(bundle.headline().starts_with("guardrail violations"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text = (1..=60).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&text, LOG_TAIL_LINES);
        assert_eq!(tail.lines().count(), 50);
        assert!(tail.starts_with("11\n"));
        assert_eq!(tail_lines("a\nb", 5), "a\nb");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let (kept, truncated) = truncate_chars("héllo", 2);
        assert_eq!(kept, "hé");
        assert!(truncated);
        assert_eq!(truncate_chars("ok", 5), ("ok".to_string(), false));
    }
}
