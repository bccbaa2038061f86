//! `orx`: drive coding-agent CLIs through a checkpointed pipeline.
//!
//! Runs live under `.orx/` in the target repository; see [`orx::io::paths`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};

use orx::clean::{CleanTarget, clean};
use orx::exit_codes;
use orx::io::config::{DEFAULT_CONFIG_FILE, OrxConfig, load_config};
use orx::io::git::Git;
use orx::io::paths::OrxPaths;
use orx::io::run_state::StateManager;
use orx::logging;
use orx::runner::{RunOutcome, Runner};
use orx::status;

#[derive(Parser)]
#[command(
    name = "orx",
    version,
    about = "Plan, implement, verify and review a task with coding-agent CLIs"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Location {
    /// Repository directory.
    #[arg(long, default_value = ".")]
    dir: PathBuf,
    /// Config file (default: `<dir>/orx.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Location {
    fn load_config(&self) -> Result<OrxConfig> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(|| self.dir.join(DEFAULT_CONFIG_FILE));
        load_config(&path)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new run. `@path` reads the task from a file.
    Run {
        task: String,
        #[command(flatten)]
        location: Location,
        /// Executor for stages without an override.
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        base_branch: Option<String>,
        /// Check preconditions and print the routing plan without creating a run.
        #[arg(long)]
        dry_run: bool,
    },
    /// Continue an interrupted run.
    Resume {
        run_id: String,
        #[command(flatten)]
        location: Location,
    },
    /// Show one run, or the most recent runs.
    Status {
        run_id: Option<String>,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Print raw state JSON.
        #[arg(long)]
        json: bool,
    },
    /// Remove a run (or `all`) with its worktree.
    Clean {
        target: String,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Run {
            task,
            location,
            engine,
            base_branch,
            dry_run,
        } => cmd_run(&task, &location, engine.as_deref(), base_branch.as_deref(), dry_run),
        Command::Resume { run_id, location } => cmd_resume(&run_id, &location),
        Command::Status {
            run_id,
            dir,
            limit,
            json,
        } => cmd_status(run_id.as_deref(), &dir, limit, json),
        Command::Clean { target, dir } => cmd_clean(&target, &dir),
    }
}

fn cmd_run(
    task: &str,
    location: &Location,
    engine: Option<&str>,
    base_branch: Option<&str>,
    dry_run: bool,
) -> Result<i32> {
    let task = read_task(task)?;
    let mut config = location.load_config()?;
    config.apply_overrides(engine, base_branch);
    let runner = Runner::new(&location.dir, config)?;
    if dry_run {
        print!("{}", runner.dry_run()?);
        return Ok(exit_codes::OK);
    }
    let outcome = runner.run(&task)?;
    Ok(report(&outcome))
}

fn cmd_resume(run_id: &str, location: &Location) -> Result<i32> {
    let runner = Runner::new(&location.dir, location.load_config()?)?;
    let outcome = runner.resume(run_id)?;
    Ok(report(&outcome))
}

fn cmd_status(run_id: Option<&str>, dir: &Path, limit: usize, json: bool) -> Result<i32> {
    let states = StateManager::new(&repo_paths(dir));
    let runs = status::collect(&states, run_id, limit)?;
    if json {
        print!("{}", status::render_json(&runs)?);
    } else {
        print!("{}", status::render_table(&runs));
    }
    Ok(exit_codes::OK)
}

fn cmd_clean(target: &str, dir: &Path) -> Result<i32> {
    let target: CleanTarget = target.parse()?;
    let removed = clean(&repo_paths(dir), &target)?;
    for id in &removed {
        println!("removed {id}");
    }
    Ok(exit_codes::OK)
}

fn report(outcome: &RunOutcome) -> i32 {
    match (&outcome.failed_stage, &outcome.error) {
        _ if outcome.success => println!("run {}: done", outcome.run_id),
        (Some(stage), Some(error)) => {
            println!("run {}: failed at {stage}: {error}", outcome.run_id);
        }
        _ => println!("run {}: failed", outcome.run_id),
    }
    exit_codes::for_outcome(outcome)
}

/// `@path` loads the task from a file; anything else is the task itself.
fn read_task(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read task file {path}"))
        }
        None => Ok(arg.to_string()),
    }
}

fn repo_paths(dir: &Path) -> OrxPaths {
    OrxPaths::new(Git::new(dir).toplevel().unwrap_or_else(|_| dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "orx",
            "-vv",
            "run",
            "@task.md",
            "--dir",
            "repo",
            "--engine",
            "claude",
            "--base-branch",
            "develop",
            "--dry-run",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run {
                task,
                location,
                engine,
                base_branch,
                dry_run,
            } => {
                assert_eq!(task, "@task.md");
                assert_eq!(location.dir, PathBuf::from("repo"));
                assert_eq!(location.config, None);
                assert_eq!(engine.as_deref(), Some("claude"));
                assert_eq!(base_branch.as_deref(), Some("develop"));
                assert!(dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parse_status_defaults() {
        let cli = Cli::parse_from(["orx", "status"]);
        assert!(matches!(
            cli.command,
            Command::Status {
                run_id: None,
                limit: 10,
                json: false,
                ..
            }
        ));
    }

    #[test]
    fn parse_clean_all() {
        let cli = Cli::parse_from(["orx", "clean", "all", "--dir", "/tmp/x"]);
        assert!(matches!(cli.command, Command::Clean { ref target, .. } if target == "all"));
    }

    #[test]
    fn reads_task_from_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("task.md");
        fs::write(&path, "Add a health endpoint\n").expect("write");
        let task = read_task(&format!("@{}", path.display())).expect("read");
        assert_eq!(task, "Add a health endpoint\n");
        assert_eq!(read_task("inline").expect("inline"), "inline");
        assert!(read_task("@/definitely/missing.md").is_err());
    }
}
