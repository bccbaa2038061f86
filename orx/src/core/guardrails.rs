//! File-change guardrails evaluated after every mutating executor call.
//!
//! Patterns are [`glob::Pattern`]s matched with a literal separator: `*` and
//! `?` stay within one path segment, `**` spans segments. A pattern without
//! `/` also matches the file name or any single directory component, so `.env`
//! catches `config/.env` and `secrets` catches `a/secrets/key.txt`.

use std::fmt;

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailMode {
    #[default]
    Denylist,
    Allowlist,
}

/// Which files an apply-mode invocation may have changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailPolicy {
    pub enabled: bool,
    pub mode: GuardrailMode,
    /// Denied paths (denylist) or permitted paths (allowlist).
    pub patterns: Vec<String>,
    /// Paths that may be edited but never created.
    pub forbidden_new_files: Vec<String>,
    pub max_files_changed: usize,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: GuardrailMode::Denylist,
            patterns: [".env", ".env.*", "*.pem", "*.key", "**/secrets/**", ".git/**"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            forbidden_new_files: Vec::new(),
            max_files_changed: 50,
        }
    }
}

/// A path changed relative to the baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    /// True when the file does not exist at the baseline.
    pub added: bool,
}

impl ChangedFile {
    pub fn modified(path: &str) -> Self {
        Self {
            path: path.to_string(),
            added: false,
        }
    }

    pub fn added(path: &str) -> Self {
        Self {
            path: path.to_string(),
            added: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Offending path; `None` for whole-change violations such as the file count.
    pub path: Option<String>,
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{path}: {}", self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub ok: bool,
    pub violations: Vec<Violation>,
}

impl GuardrailResult {
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Evaluate `changed` against `policy`.
pub fn check_changes(policy: &GuardrailPolicy, changed: &[ChangedFile]) -> Result<GuardrailResult> {
    if !policy.enabled {
        return Ok(GuardrailResult {
            ok: true,
            violations: Vec::new(),
        });
    }
    let patterns = compile_all(&policy.patterns)?;
    let new_file_patterns = compile_all(&policy.forbidden_new_files)?;

    let mut violations = Vec::new();
    if changed.len() > policy.max_files_changed {
        violations.push(Violation {
            path: None,
            reason: format!(
                "{} files changed, exceeding max_files_changed={}",
                changed.len(),
                policy.max_files_changed
            ),
        });
    }

    for file in changed {
        let hit = patterns.iter().find(|glob| glob.matches(&file.path));
        match (policy.mode, hit) {
            (GuardrailMode::Denylist, Some(glob)) => violations.push(Violation {
                path: Some(file.path.clone()),
                reason: format!("matches denied pattern '{}'", glob.pattern),
            }),
            (GuardrailMode::Allowlist, None) => violations.push(Violation {
                path: Some(file.path.clone()),
                reason: "not covered by any allowed pattern".to_string(),
            }),
            _ => {}
        }
        if file.added
            && let Some(glob) = new_file_patterns.iter().find(|glob| glob.matches(&file.path))
        {
            violations.push(Violation {
                path: Some(file.path.clone()),
                reason: format!("new file matches forbidden pattern '{}'", glob.pattern),
            });
        }
    }

    Ok(GuardrailResult {
        ok: violations.is_empty(),
        violations,
    })
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled guardrail pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    compiled: Pattern,
    /// No `/` in the pattern: also try the basename and each component.
    segment_only: bool,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self> {
        let trimmed = pattern.trim().trim_start_matches("./");
        let compiled = Pattern::new(trimmed)
            .with_context(|| format!("invalid guardrail pattern '{pattern}'"))?;
        Ok(Self {
            pattern: pattern.to_string(),
            compiled,
            segment_only: !trimmed.contains('/'),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        if self.compiled.matches_with(path, MATCH_OPTIONS) {
            return true;
        }
        self.segment_only
            && path
                .split('/')
                .any(|part| self.compiled.matches_with(part, MATCH_OPTIONS))
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Glob>> {
    patterns.iter().map(|p| Glob::new(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(patterns: &[&str], max: usize) -> GuardrailPolicy {
        GuardrailPolicy {
            enabled: true,
            mode: GuardrailMode::Allowlist,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            forbidden_new_files: Vec::new(),
            max_files_changed: max,
        }
    }

    #[test]
    fn allowlist_rejects_paths_outside_patterns() {
        let policy = allowlist(&["src/**"], 50);

        let rejected = check_changes(&policy, &[ChangedFile::modified("docs/readme.md")])
            .expect("check");
        assert!(!rejected.ok);
        assert_eq!(rejected.violations[0].path.as_deref(), Some("docs/readme.md"));

        let accepted = check_changes(&policy, &[ChangedFile::modified("src/a.py")]).expect("check");
        assert!(accepted.ok);
    }

    #[test]
    fn empty_allowlist_allows_nothing() {
        let policy = allowlist(&[], 50);
        let result = check_changes(&policy, &[ChangedFile::modified("a.txt")]).expect("check");
        assert!(!result.ok);
    }

    #[test]
    fn default_denylist_catches_secrets_anywhere() {
        let policy = GuardrailPolicy::default();
        let result = check_changes(
            &policy,
            &[
                ChangedFile::modified("config/.env"),
                ChangedFile::added("deploy/tls/server.pem"),
                ChangedFile::modified("app/secrets/token.txt"),
                ChangedFile::modified("src/main.rs"),
            ],
        )
        .expect("check");
        let paths: Vec<_> = result
            .violations
            .iter()
            .filter_map(|v| v.path.as_deref())
            .collect();
        assert_eq!(
            paths,
            vec!["config/.env", "deploy/tls/server.pem", "app/secrets/token.txt"]
        );
    }

    #[test]
    fn file_count_bound_applies_in_any_mode() {
        let mut policy = GuardrailPolicy::default();
        policy.max_files_changed = 2;
        let changed = [
            ChangedFile::modified("a.rs"),
            ChangedFile::modified("b.rs"),
            ChangedFile::modified("c.rs"),
        ];
        let result = check_changes(&policy, &changed).expect("check");
        assert!(!result.ok);
        assert_eq!(result.violations.len(), 1);
        assert!(result.violations[0].path.is_none());
        assert!(result.summary().contains("max_files_changed=2"));
    }

    #[test]
    fn forbidden_new_files_only_rejects_creation() {
        let mut policy = GuardrailPolicy::default();
        policy.forbidden_new_files = vec!["migrations/*.sql".to_string()];

        let edited =
            check_changes(&policy, &[ChangedFile::modified("migrations/001.sql")]).expect("check");
        assert!(edited.ok);
        let created =
            check_changes(&policy, &[ChangedFile::added("migrations/002.sql")]).expect("check");
        assert!(!created.ok);
    }

    #[test]
    fn disabled_policy_accepts_everything() {
        let mut policy = allowlist(&[], 0);
        policy.enabled = false;
        let result = check_changes(&policy, &[ChangedFile::modified("x")]).expect("check");
        assert!(result.ok);
    }

    #[test]
    fn glob_semantics() {
        let star = Glob::new("src/*.rs").expect("glob");
        assert!(star.matches("src/lib.rs"));
        assert!(!star.matches("src/core/lib.rs"));

        let deep = Glob::new("**/tests/**").expect("glob");
        assert!(deep.matches("tests/a.rs"));
        assert!(deep.matches("crates/x/tests/a.rs"));

        let name = Glob::new("*.lock").expect("glob");
        assert!(name.matches("nested/Cargo.lock"));

        let dotted = Glob::new(".env.*").expect("glob");
        assert!(dotted.matches("config/.env.local"));
        assert!(!dotted.matches("config/env.local"));

        assert!(Glob::new("src/a**").is_err());
    }
}
