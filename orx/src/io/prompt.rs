//! Prompt rendering for every agent-facing stage.
//!
//! Templates live next to this module and are compiled into the binary.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior, context};

use crate::core::backlog::WorkItem;
use crate::core::guardrails::{GuardrailMode, GuardrailPolicy};
use crate::evidence_pack::EvidencePack;

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const SPEC_TEMPLATE: &str = include_str!("prompts/spec.md");
const DECOMPOSE_TEMPLATE: &str = include_str!("prompts/decompose.md");
const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");
const KNOWLEDGE_TEMPLATE: &str = include_str!("prompts/knowledge.md");

static ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    for (name, source) in [
        ("plan", PLAN_TEMPLATE),
        ("spec", SPEC_TEMPLATE),
        ("decompose", DECOMPOSE_TEMPLATE),
        ("implement", IMPLEMENT_TEMPLATE),
        ("fix", FIX_TEMPLATE),
        ("review", REVIEW_TEMPLATE),
        ("knowledge", KNOWLEDGE_TEMPLATE),
    ] {
        env.add_template(name, source)
            .expect("bundled prompt template should be valid");
    }
    env
});

fn render(name: &str, ctx: minijinja::Value) -> Result<String> {
    let template = ENV
        .get_template(name)
        .with_context(|| format!("load prompt template {name}"))?;
    let rendered = template
        .render(ctx)
        .with_context(|| format!("render prompt template {name}"))?;
    Ok(format!("{}\n", rendered.trim_end()))
}

pub fn render_plan(task: &str) -> Result<String> {
    render("plan", context! { task => task.trim() })
}

pub fn render_spec(task: &str, plan: &str) -> Result<String> {
    render("spec", context! { task => task.trim(), plan => plan.trim() })
}

/// `validation_error` is set when retrying after an unusable backlog.
pub fn render_decompose(task: &str, spec: &str, validation_error: Option<&str>) -> Result<String> {
    render(
        "decompose",
        context! {
            task => task.trim(),
            spec => spec.trim(),
            validation_error => validation_error.map(str::trim),
        },
    )
}

/// Inputs shared by the implement and fix prompts.
#[derive(Debug, Clone)]
pub struct ItemPrompt<'a> {
    pub task: &'a str,
    pub spec: &'a str,
    pub item: &'a WorkItem,
    pub policy: &'a GuardrailPolicy,
    pub gates: &'a [&'a str],
}

impl ItemPrompt<'_> {
    fn gate_list(&self) -> String {
        if self.gates.is_empty() {
            "none".to_string()
        } else {
            self.gates.join(", ")
        }
    }
}

pub fn render_implement(input: &ItemPrompt<'_>) -> Result<String> {
    render(
        "implement",
        context! {
            task => input.task.trim(),
            spec => input.spec.trim(),
            item => input.item,
            guardrails => describe_policy(input.policy),
            gates => input.gate_list(),
        },
    )
}

/// Fix prompt carrying the rendered evidence of the previous attempt.
pub fn render_fix(
    input: &ItemPrompt<'_>,
    evidence_markdown: &str,
    attempt: u32,
    max_attempts: u32,
) -> Result<String> {
    render(
        "fix",
        context! {
            spec => input.spec.trim(),
            item => input.item,
            guardrails => describe_policy(input.policy),
            gates => input.gate_list(),
            evidence => evidence_markdown.trim(),
            attempt => attempt,
            max_attempts => max_attempts,
        },
    )
}

pub fn render_review(spec: &str, backlog_yaml: &str, diff: &str) -> Result<String> {
    render(
        "review",
        context! {
            spec => spec.trim(),
            backlog => backlog_yaml.trim_end(),
            diff => diff.trim_end(),
        },
    )
}

pub fn render_knowledge(pack: &EvidencePack) -> Result<String> {
    render(
        "knowledge",
        context! {
            spec => pack.spec.trim(),
            changed_files => &pack.changed_files,
            items => &pack.item_outcomes,
            review => pack.review.as_deref().map(str::trim),
            gate_logs => &pack.gate_logs,
        },
    )
}

/// Plain-language guardrail summary for agents.
pub fn describe_policy(policy: &GuardrailPolicy) -> String {
    if !policy.enabled {
        return "No file restrictions.".to_string();
    }
    let mut lines = Vec::new();
    if !policy.patterns.is_empty() {
        let patterns = policy.patterns.join(", ");
        lines.push(match policy.mode {
            GuardrailMode::Allowlist => format!("Only change files matching: {patterns}."),
            GuardrailMode::Denylist => format!("Never touch files matching: {patterns}."),
        });
    }
    if !policy.forbidden_new_files.is_empty() {
        lines.push(format!(
            "Do not create new files matching: {}.",
            policy.forbidden_new_files.join(", ")
        ));
    }
    lines.push(format!(
        "Change at most {} files in total.",
        policy.max_files_changed
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        let mut item = WorkItem::new("W001", "Add flag", "Add a --json flag");
        item.acceptance = vec!["prints JSON".to_string()];
        item
    }

    #[test]
    fn plan_prompt_contains_task() {
        let prompt = render_plan("  Add dark mode  ").expect("render");
        assert!(prompt.contains("## Task\n\nAdd dark mode\n"));
        assert!(prompt.contains("do not modify any file"));
    }

    #[test]
    fn decompose_retry_includes_validation_error() {
        let first = render_decompose("t", "s", None).expect("render");
        assert!(!first.contains("Previous attempt was rejected"));
        let retry = render_decompose("t", "s", Some("W002 depends on unknown W009")).expect("render");
        assert!(retry.contains("Previous attempt was rejected"));
        assert!(retry.contains("W002 depends on unknown W009"));
    }

    #[test]
    fn implement_prompt_lists_acceptance_and_constraints() {
        let policy = GuardrailPolicy {
            mode: GuardrailMode::Allowlist,
            patterns: vec!["src/**".to_string()],
            max_files_changed: 5,
            ..GuardrailPolicy::default()
        };
        let item = item();
        let prompt = render_implement(&ItemPrompt {
            task: "task",
            spec: "spec",
            item: &item,
            policy: &policy,
            gates: &["ruff", "pytest"],
        })
        .expect("render");
        assert!(prompt.contains("## Work item W001: Add flag"));
        assert!(prompt.contains("- prints JSON"));
        assert!(prompt.contains("Only change files matching: src/**."));
        assert!(prompt.contains("Change at most 5 files"));
        assert!(prompt.contains("ruff, pytest"));
    }

    #[test]
    fn fix_prompt_carries_evidence_and_attempt() {
        let item = item();
        let policy = GuardrailPolicy::default();
        let prompt = render_fix(
            &ItemPrompt {
                task: "task",
                spec: "spec",
                item: &item,
                policy: &policy,
                gates: &[],
            },
            "**NO CHANGES WERE MADE.**",
            2,
            3,
        )
        .expect("render");
        assert!(prompt.contains("attempt 2 of 3"));
        assert!(prompt.contains("**NO CHANGES WERE MADE.**"));
        assert!(prompt.contains("Quality gates run after you finish: none."));
    }
}
