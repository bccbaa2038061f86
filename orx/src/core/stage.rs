//! Pipeline stages and their fixed order.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// One step of the fixed pipeline, plus the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Plan,
    Spec,
    Decompose,
    ImplementItem,
    Review,
    Ship,
    KnowledgeUpdate,
    Done,
    Failed,
}

/// Stages the runner executes, in order. `Init` is handled by run creation.
pub const PIPELINE: [Stage; 7] = [
    Stage::Plan,
    Stage::Spec,
    Stage::Decompose,
    Stage::ImplementItem,
    Stage::Review,
    Stage::Ship,
    Stage::KnowledgeUpdate,
];

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Plan => "plan",
            Stage::Spec => "spec",
            Stage::Decompose => "decompose",
            Stage::ImplementItem => "implement_item",
            Stage::Review => "review",
            Stage::Ship => "ship",
            Stage::KnowledgeUpdate => "knowledge_update",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// Stages that only read the workspace and produce a text artifact.
    pub fn is_text_stage(self) -> bool {
        matches!(
            self,
            Stage::Plan | Stage::Spec | Stage::Decompose | Stage::Review | Stage::KnowledgeUpdate
        )
    }

    /// Position in [`PIPELINE`]. `Init` sorts before and terminals after.
    fn position(self) -> usize {
        match self {
            Stage::Init => 0,
            Stage::Done | Stage::Failed => PIPELINE.len() + 1,
            other => PIPELINE.iter().position(|s| *s == other).map_or(0, |i| i + 1),
        }
    }
}

/// Stages still to run when resuming at `current`, in pipeline order.
///
/// `Init` means nothing has run yet. Terminal stages yield nothing.
pub fn remaining_stages(current: Stage) -> Vec<Stage> {
    let from = current.position().max(1);
    PIPELINE
        .iter()
        .copied()
        .filter(|stage| stage.position() >= from)
        .collect()
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let stage = match s {
            "init" => Stage::Init,
            "plan" => Stage::Plan,
            "spec" => Stage::Spec,
            "decompose" => Stage::Decompose,
            "implement_item" | "implement" => Stage::ImplementItem,
            "review" => Stage::Review,
            "ship" => Stage::Ship,
            "knowledge_update" | "knowledge" => Stage::KnowledgeUpdate,
            "done" => Stage::Done,
            "failed" => Stage::Failed,
            other => return Err(anyhow!("unknown stage '{other}'")),
        };
        Ok(stage)
    }
}

/// Key for per-stage executor routing (`[stages.<key>]`, executor profiles).
///
/// Every pipeline stage routes under its own name. Fix-loop retries route
/// under `fix` and fall back to the implement stage's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteKey {
    Stage(Stage),
    Fix,
}

impl RouteKey {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteKey::Stage(stage) => stage.as_str(),
            RouteKey::Fix => "fix",
        }
    }

    /// The pipeline stage the invocation belongs to.
    pub fn stage(self) -> Stage {
        match self {
            RouteKey::Stage(stage) => stage,
            RouteKey::Fix => Stage::ImplementItem,
        }
    }

    /// Keys consulted for this route, most specific first.
    pub fn lookup_order(self) -> Vec<RouteKey> {
        match self {
            RouteKey::Fix => vec![RouteKey::Fix, RouteKey::Stage(Stage::ImplementItem)],
            key => vec![key],
        }
    }
}

impl From<Stage> for RouteKey {
    fn from(stage: Stage) -> Self {
        RouteKey::Stage(stage)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl Serialize for RouteKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl FromStr for RouteKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "fix" {
            return Ok(RouteKey::Fix);
        }
        let stage: Stage = s.parse()?;
        if !PIPELINE.contains(&stage) {
            return Err(anyhow!("stage '{s}' does not invoke an executor"));
        }
        Ok(RouteKey::Stage(stage))
    }
}

/// Recorded outcome of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_from_init_is_full_pipeline() {
        assert_eq!(remaining_stages(Stage::Init), PIPELINE.to_vec());
    }

    #[test]
    fn remaining_from_review_skips_earlier_stages() {
        assert_eq!(
            remaining_stages(Stage::Review),
            vec![Stage::Review, Stage::Ship, Stage::KnowledgeUpdate]
        );
    }

    #[test]
    fn terminal_stages_have_nothing_left() {
        assert!(remaining_stages(Stage::Done).is_empty());
        assert!(remaining_stages(Stage::Failed).is_empty());
    }

    #[test]
    fn parses_aliases_and_round_trips_names() {
        for stage in PIPELINE {
            assert_eq!(stage.as_str().parse::<Stage>().expect("parse"), stage);
        }
        assert_eq!(
            "implement".parse::<Stage>().expect("parse"),
            Stage::ImplementItem
        );
        assert!("verify".parse::<Stage>().is_err());
    }

    #[test]
    fn route_keys_accept_aliases_and_fix() {
        assert_eq!(
            "implement".parse::<RouteKey>().expect("parse"),
            RouteKey::Stage(Stage::ImplementItem)
        );
        assert_eq!(
            "knowledge".parse::<RouteKey>().expect("parse"),
            RouteKey::Stage(Stage::KnowledgeUpdate)
        );
        assert_eq!("fix".parse::<RouteKey>().expect("parse"), RouteKey::Fix);
        assert_eq!(RouteKey::Fix.stage(), Stage::ImplementItem);
        assert!("done".parse::<RouteKey>().is_err());
        assert!("verify".parse::<RouteKey>().is_err());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&Stage::ImplementItem).expect("json");
        assert_eq!(json, "\"implement_item\"");
    }
}
