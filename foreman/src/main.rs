//! Autonomous work-orchestration engine CLI.
//!
//! Drives a tracker backlog (`foreman run` / `foreman loop`), keeping all
//! durable engine state under `.foreman/` in the target repository.

use std::fs;
use std::path::Path;
use std::process::exit;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use foreman::exit_codes;
use foreman::io::agent::SubprocessAgent;
use foreman::io::config::EngineConfig;
use foreman::io::git::Git;
use foreman::io::ledger::{Ledger, write_ledger};
use foreman::io::paths::EnginePaths;
use foreman::io::tracker::{HttpTracker, Tracker};
use foreman::looping::{run_loop, run_pass};
use foreman::orchestrator::{Engine, ItemOutcome};

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Autonomous work-orchestration engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.foreman/` state directories and ledger if missing.
    Init {
        /// Overwrite existing state files.
        #[arg(short, long)]
        force: bool,
    },
    /// Process one idea (or every open idea) through the full pipeline.
    Run {
        /// Idea key; omitted means one pass over the open backlog.
        key: Option<String>,
        /// Timeout override in seconds for agent invocations.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Repeat passes over the backlog until stopped.
    Loop {
        /// Stop after this many passes.
        #[arg(long)]
        max_passes: Option<u32>,
        /// Sleep between idle passes.
        #[arg(long, default_value_t = 60)]
        idle_secs: u64,
    },
    /// Re-verify one item without running the agent.
    Verify {
        /// Story key.
        key: String,
    },
}

fn main() {
    foreman::logging::init();
    match run() {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Run { key, timeout_secs } => cmd_run(key, timeout_secs),
        Command::Loop {
            max_passes,
            idle_secs,
        } => cmd_loop(max_passes, idle_secs),
        Command::Verify { key } => cmd_verify(&key),
    }
}

const ENGINE_GITIGNORE: &str = "state/\ntranscripts/\nreports/\n";

fn cmd_init(force: bool) -> Result<i32> {
    let paths = EnginePaths::new(".");
    for dir in [
        &paths.state_dir,
        &paths.reports_dir,
        &paths.transcripts_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    write_if_missing_or_force(&paths.gitignore_path, ENGINE_GITIGNORE, force)?;
    if force || !paths.ledger_path.exists() {
        write_ledger(&paths.ledger_path, &Ledger::default())?;
    }
    Ok(exit_codes::OK)
}

fn cmd_run(key: Option<String>, timeout_secs: Option<u64>) -> Result<i32> {
    let config = EngineConfig::from_env()?;
    config.validate()?;
    let tracker = HttpTracker::new(
        &config.tracker_base_url,
        &config.tracker_user,
        &config.tracker_token,
    )?;
    let agent = SubprocessAgent {
        command: config.agent_command.clone(),
        scrub_values: config.secret_values(),
    };
    let engine = Engine {
        tracker: &tracker,
        agent: &agent,
        git: Git::new("."),
        paths: EnginePaths::new("."),
        config,
        timeout_override_secs: timeout_secs,
    };

    match key {
        Some(key) => {
            let idea = engine.tracker.get(&key)?;
            let outcome = engine.process_idea(&idea)?;
            Ok(exit_code_for(&outcome))
        }
        None => {
            let summary = run_pass(&engine, &AtomicBool::new(false))?;
            if summary.blocked > 0 {
                Ok(exit_codes::BLOCKED)
            } else if summary.human_attention > 0 {
                Ok(exit_codes::HUMAN_ATTENTION)
            } else {
                Ok(exit_codes::OK)
            }
        }
    }
}

fn cmd_loop(max_passes: Option<u32>, idle_secs: u64) -> Result<i32> {
    let config = EngineConfig::from_env()?;
    config.validate()?;
    let tracker = HttpTracker::new(
        &config.tracker_base_url,
        &config.tracker_user,
        &config.tracker_token,
    )?;
    let agent = SubprocessAgent {
        command: config.agent_command.clone(),
        scrub_values: config.secret_values(),
    };
    let engine = Engine {
        tracker: &tracker,
        agent: &agent,
        git: Git::new("."),
        paths: EnginePaths::new("."),
        config,
        timeout_override_secs: None,
    };

    let stop = AtomicBool::new(false);
    run_loop(&engine, &stop, max_passes, Duration::from_secs(idle_secs))?;
    Ok(exit_codes::OK)
}

fn cmd_verify(key: &str) -> Result<i32> {
    let config = EngineConfig::from_env()?;
    config.validate()?;
    let tracker = HttpTracker::new(
        &config.tracker_base_url,
        &config.tracker_user,
        &config.tracker_token,
    )?;
    let paths = EnginePaths::new(".");
    let git = Git::new(".");
    let mut ledger = foreman::io::ledger::load_ledger(&paths.ledger_path)?;
    let story = tracker.get(key)?;
    let decision = foreman::verify::verify_item(
        &tracker,
        &git,
        &paths,
        &config,
        &mut ledger,
        key,
        &story.summary,
    )?;
    write_ledger(&paths.ledger_path, &ledger)?;
    println!("{decision:?}");
    match decision {
        foreman::verify::VerifyDecision::Complete => Ok(exit_codes::OK),
        _ => Ok(exit_codes::INVALID),
    }
}

fn exit_code_for(outcome: &ItemOutcome) -> i32 {
    match outcome {
        ItemOutcome::Completed | ItemOutcome::VerifyPending => exit_codes::OK,
        ItemOutcome::Blocked { .. } => exit_codes::BLOCKED,
        ItemOutcome::HumanAttention { .. } => exit_codes::HUMAN_ATTENTION,
    }
}

fn write_if_missing_or_force(path: &Path, contents: &str, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Ok(());
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["foreman", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_run_with_key_and_timeout() {
        let cli = Cli::parse_from(["foreman", "run", "ID-7", "--timeout-secs", "120"]);
        match cli.command {
            Command::Run { key, timeout_secs } => {
                assert_eq!(key.as_deref(), Some("ID-7"));
                assert_eq!(timeout_secs, Some(120));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_loop_defaults() {
        let cli = Cli::parse_from(["foreman", "loop"]);
        match cli.command {
            Command::Loop {
                max_passes,
                idle_secs,
            } => {
                assert_eq!(max_passes, None);
                assert_eq!(idle_secs, 60);
            }
            _ => panic!("expected loop"),
        }
    }
}
