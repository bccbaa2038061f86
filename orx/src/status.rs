//! `orx status`: report persisted run checkpoints.

use anyhow::{Context, Result};

use crate::io::run_state::{RunState, StateManager};

/// One run by id, or the newest `limit` runs.
pub fn collect(states: &StateManager, run_id: Option<&str>, limit: usize) -> Result<Vec<RunState>> {
    match run_id {
        Some(id) => Ok(vec![states.load(id)?]),
        None => {
            let mut all = states.list()?;
            all.reverse();
            all.truncate(limit);
            Ok(all)
        }
    }
}

pub fn render_table(states: &[RunState]) -> String {
    if states.is_empty() {
        return "no runs\n".to_string();
    }
    let mut out = format!(
        "{:<26} {:<16} {:<6} {:<5} {}\n",
        "RUN", "STAGE", "ITEM", "ITER", "UPDATED"
    );
    for state in states {
        out.push_str(&format!(
            "{:<26} {:<16} {:<6} {:<5} {}\n",
            state.run_id,
            state.current_stage.as_str(),
            state.current_item_id.as_deref().unwrap_or("-"),
            state
                .current_iteration
                .map_or_else(|| "-".to_string(), |iter| iter.to_string()),
            state.updated_at,
        ));
        if let Some(reason) = &state.failure_reason {
            out.push_str(&format!("  reason: {reason}\n"));
        }
    }
    out
}

/// A single run prints as an object, several as an array.
pub fn render_json(states: &[RunState]) -> Result<String> {
    let json = match states {
        [state] => serde_json::to_string_pretty(state),
        _ => serde_json::to_string_pretty(states),
    }
    .context("serialize run state")?;
    Ok(format!("{json}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::Stage;
    use crate::io::paths::OrxPaths;

    fn saved(states: &StateManager, id: &str, stage: Stage) {
        let mut state = RunState::new(id);
        state.transition_to(stage);
        states.save(&state).expect("save");
    }

    #[test]
    fn lists_newest_first_with_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let states = StateManager::new(&OrxPaths::new(temp.path()));
        saved(&states, "20260101_000000_aaaaaaaa", Stage::Done);
        saved(&states, "20260102_000000_bbbbbbbb", Stage::Plan);
        saved(&states, "20260103_000000_cccccccc", Stage::Review);

        let runs = collect(&states, None, 2).expect("collect");
        let ids: Vec<&str> = runs.iter().map(|s| s.run_id.as_str()).collect();
        assert_eq!(ids, vec!["20260103_000000_cccccccc", "20260102_000000_bbbbbbbb"]);

        let table = render_table(&runs);
        assert!(table.starts_with("RUN"));
        assert!(table.contains("review"));
    }

    #[test]
    fn single_run_renders_as_object() {
        let temp = tempfile::tempdir().expect("tempdir");
        let states = StateManager::new(&OrxPaths::new(temp.path()));
        saved(&states, "20260101_000000_0000abcd", Stage::Spec);
        let runs = collect(&states, Some("20260101_000000_0000abcd"), 10).expect("collect");
        let json: serde_json::Value =
            serde_json::from_str(&render_json(&runs).expect("json")).expect("parse");
        assert_eq!(json["current_stage"], "spec");
        assert!(collect(&states, Some("missing"), 10).is_err());
    }
}
