//! Backlog model produced by decomposition and consumed by the implement loop.
//!
//! Items are addressed by sequential ids (`W001`, `W002`, ...) and may depend
//! on other items in the same backlog. Dependencies must form a DAG.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use jsonschema::Draft;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrxError;

const BACKLOG_SCHEMA: &str = include_str!("../../schemas/backlog.schema.json");

static ITEM_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^W\d{3}$").expect("item id regex is valid"));
static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n(.*?)```").expect("fence regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl WorkItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

/// A single unit of implementation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub files_hint: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: WorkItemStatus,
    #[serde(default)]
    pub attempts: u32,
    /// Feedback carried into the next fix attempt.
    #[serde(default)]
    pub notes: Option<String>,
}

impl WorkItem {
    pub fn new(id: &str, title: &str, objective: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            objective: objective.to_string(),
            acceptance: Vec::new(),
            files_hint: Vec::new(),
            depends_on: Vec::new(),
            status: WorkItemStatus::Todo,
            attempts: 0,
            notes: None,
        }
    }
}

/// Ordered, dependency-annotated set of work items.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Backlog {
    #[serde(default)]
    pub run_id: Option<String>,
    pub items: Vec<WorkItem>,
}

impl Backlog {
    pub fn item(&self, id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn item_mut(&mut self, id: &str) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    /// Next item to work on: an interrupted `in_progress` item first, then the
    /// first `todo` item whose dependencies are all `done`.
    pub fn next_ready(&self) -> Option<&WorkItem> {
        if let Some(item) = self
            .items
            .iter()
            .find(|item| item.status == WorkItemStatus::InProgress)
        {
            return Some(item);
        }
        self.items
            .iter()
            .find(|item| item.status == WorkItemStatus::Todo && self.deps_done(item))
    }

    /// True when `todo` items remain but none of them can start.
    pub fn is_blocked(&self) -> bool {
        self.next_ready().is_none()
            && self
                .items
                .iter()
                .any(|item| item.status == WorkItemStatus::Todo)
    }

    pub fn all_done(&self) -> bool {
        self.items
            .iter()
            .all(|item| item.status == WorkItemStatus::Done)
    }

    fn deps_done(&self, item: &WorkItem) -> bool {
        item.depends_on.iter().all(|dep| {
            self.item(dep)
                .is_some_and(|dep| dep.status == WorkItemStatus::Done)
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serialize backlog yaml")
    }

    /// Items ordered so every dependency precedes its dependents, keeping the
    /// original order among items that are ready together. `None` on a cycle.
    pub fn topological_order(&self) -> Option<Vec<&WorkItem>> {
        let known: HashSet<&str> = self.items.iter().map(|item| item.id.as_str()).collect();
        let mut placed: HashSet<&str> = HashSet::new();
        let mut ordered = Vec::with_capacity(self.items.len());
        while ordered.len() < self.items.len() {
            let next = self.items.iter().find(|item| {
                !placed.contains(item.id.as_str())
                    && item
                        .depends_on
                        .iter()
                        .all(|dep| !known.contains(dep.as_str()) || placed.contains(dep.as_str()))
            })?;
            placed.insert(next.id.as_str());
            ordered.push(next);
        }
        Some(ordered)
    }

    /// Merge items into at most `max_items` batches.
    ///
    /// Items are put in dependency order and consecutive runs are grouped, so
    /// every dependency between groups points at an earlier group. Intra-group
    /// dependencies are dropped and ids renumbered from `W001`. A backlog with
    /// a cycle is returned unchanged.
    pub fn coalesce(&self, max_items: usize) -> Backlog {
        if max_items == 0 || self.items.len() <= max_items {
            return self.clone();
        }
        let Some(ordered) = self.topological_order() else {
            return self.clone();
        };
        let group_size = ordered.len().div_ceil(max_items);
        let groups: Vec<&[&WorkItem]> = ordered.chunks(group_size).collect();

        let mut group_of: BTreeMap<&str, usize> = BTreeMap::new();
        for (idx, group) in groups.iter().enumerate() {
            for item in *group {
                group_of.insert(item.id.as_str(), idx);
            }
        }
        let group_id = |idx: usize| format!("W{:03}", idx + 1);

        let items = groups
            .iter()
            .enumerate()
            .map(|(idx, group)| {
                let first = &group[0];
                let merged = group.len() > 1;
                let title = if merged {
                    format!(
                        "Batch {}: {} + {} more",
                        idx + 1,
                        first.title,
                        group.len() - 1
                    )
                } else {
                    first.title.clone()
                };
                let objective = if merged {
                    group
                        .iter()
                        .map(|item| item.objective.as_str())
                        .collect::<Vec<_>>()
                        .join("; ")
                } else {
                    first.objective.clone()
                };
                let notes = if merged {
                    let ids: Vec<&str> = group.iter().map(|item| item.id.as_str()).collect();
                    Some(format!("Merged from {}", ids.join(", ")))
                } else {
                    first.notes.clone()
                };

                let mut acceptance = unique(group.iter().flat_map(|item| {
                    item.acceptance.iter().map(move |criterion| {
                        if merged {
                            format!("{}: {criterion}", item.id)
                        } else {
                            criterion.clone()
                        }
                    })
                }));
                if acceptance.is_empty() {
                    acceptance.push(format!("Complete {title}"));
                }
                let files_hint = unique(
                    group
                        .iter()
                        .flat_map(|item| item.files_hint.iter().cloned()),
                );
                let depends_on = unique(
                    group
                        .iter()
                        .flat_map(|item| item.depends_on.iter())
                        .filter_map(|dep| group_of.get(dep.as_str()).copied())
                        .filter(|dep_group| *dep_group != idx)
                        .map(group_id),
                );

                WorkItem {
                    id: group_id(idx),
                    title,
                    objective,
                    acceptance,
                    files_hint,
                    depends_on,
                    status: WorkItemStatus::Todo,
                    attempts: 0,
                    notes,
                }
            })
            .collect();

        Backlog {
            run_id: self.run_id.clone(),
            items,
        }
    }
}

fn unique(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values.filter(|value| seen.insert(value.clone())).collect()
}

/// Extract the body of the first fenced code block, or the whole text when unfenced.
pub fn strip_code_fences(raw: &str) -> &str {
    match FENCE_RE.captures(raw).and_then(|caps| caps.get(1)) {
        Some(body) => body.as_str(),
        None => raw,
    }
}

/// Parse agent-produced backlog YAML and validate it.
///
/// Fails with [`OrxError::InvalidBacklog`] listing every violation found.
pub fn parse_backlog(raw: &str) -> Result<Backlog> {
    let body = strip_code_fences(raw);
    let value: Value = serde_yaml::from_str(body)
        .map_err(|err| OrxError::InvalidBacklog(format!("yaml: {err}")))?;
    let schema_errors = validate_schema(&value)?;
    if !schema_errors.is_empty() {
        return Err(OrxError::InvalidBacklog(schema_errors.join("; ")).into());
    }
    let backlog: Backlog = serde_json::from_value(value)
        .map_err(|err| OrxError::InvalidBacklog(format!("structure: {err}")))?;
    let errors = validate_backlog(&backlog);
    if !errors.is_empty() {
        return Err(OrxError::InvalidBacklog(errors.join("; ")).into());
    }
    Ok(backlog)
}

fn validate_schema(instance: &Value) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(BACKLOG_SCHEMA).context("parse backlog schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile backlog schema")?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}

/// Check semantic rules not expressible in the schema:
/// - ids match `W###` and are unique
/// - every dependency exists and is not the item itself
/// - dependencies are acyclic
pub fn validate_backlog(backlog: &Backlog) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for item in &backlog.items {
        if !ITEM_ID_RE.is_match(&item.id) {
            errors.push(format!("invalid item id '{}' (expected W###)", item.id));
        }
        if !seen.insert(item.id.as_str()) {
            errors.push(format!("duplicate item id '{}'", item.id));
        }
    }
    for item in &backlog.items {
        for dep in &item.depends_on {
            if dep == &item.id {
                errors.push(format!("{} depends on itself", item.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!("{} depends on unknown item '{}'", item.id, dep));
            }
        }
    }
    if let Some(cycle) = find_cycle(backlog) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }
    errors
}

/// Return one dependency cycle as a closed path (first id repeated at the end).
pub fn find_cycle(backlog: &Backlog) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Active,
        Finished,
    }

    fn visit<'a>(
        id: &'a str,
        backlog: &'a Backlog,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(id, Mark::Active);
        stack.push(id);
        if let Some(item) = backlog.item(id) {
            for dep in &item.depends_on {
                match marks.get(dep.as_str()).copied() {
                    Some(Mark::Active) => {
                        let start = stack.iter().position(|s| *s == dep.as_str())?;
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Mark::Unvisited) => {
                        if let Some(cycle) = visit(dep, backlog, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    _ => {}
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Finished);
        None
    }

    let mut marks: BTreeMap<&str, Mark> = backlog
        .items
        .iter()
        .map(|item| (item.id.as_str(), Mark::Unvisited))
        .collect();
    for item in &backlog.items {
        if marks.get(item.id.as_str()) == Some(&Mark::Unvisited) {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(&item.id, backlog, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
