//! Pass and loop drivers over the tracker backlog.
//!
//! A pass picks up every open idea and runs the pipeline once per idea.
//! The loop repeats passes with an idle sleep, stopping cooperatively at
//! item boundaries so an in-flight agent run is never interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::orchestrator::{Engine, ItemOutcome};
use crate::io::tracker::{SearchQuery, Tracker};

/// Counters for one pass over the backlog.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub processed: usize,
    pub completed: usize,
    pub pending: usize,
    pub blocked: usize,
    pub human_attention: usize,
    pub errored: usize,
}

impl PassSummary {
    /// True when nothing remains actionable in this backlog snapshot.
    pub fn idle(&self) -> bool {
        self.completed == 0 && self.pending == 0 && self.errored == 0
    }
}

/// Process every open idea once.
///
/// A failing item is logged and counted but never aborts the pass; the
/// remaining backlog still gets its turn.
#[instrument(skip_all)]
pub fn run_pass(engine: &Engine<'_>, stop: &AtomicBool) -> Result<PassSummary> {
    let ideas = engine.tracker.search(&SearchQuery {
        issue_type: Some("Idea".to_string()),
        status_category: Some("To Do".to_string()),
        ..SearchQuery::default()
    })?;
    info!(count = ideas.len(), "open ideas in backlog");

    let mut summary = PassSummary::default();
    for idea in &ideas {
        if stop.load(Ordering::SeqCst) {
            info!("stop requested, ending pass at item boundary");
            break;
        }
        summary.processed += 1;
        match engine.process_idea(idea) {
            Ok(ItemOutcome::Completed) => summary.completed += 1,
            Ok(ItemOutcome::VerifyPending) => summary.pending += 1,
            Ok(ItemOutcome::Blocked { .. }) => summary.blocked += 1,
            Ok(ItemOutcome::HumanAttention { .. }) => summary.human_attention += 1,
            Err(err) => {
                warn!(idea = %idea.key, "item failed: {err:#}");
                summary.errored += 1;
            }
        }
    }
    info!(?summary, "pass finished");
    Ok(summary)
}

/// Repeat passes until stopped or `max_passes` is reached.
pub fn run_loop(
    engine: &Engine<'_>,
    stop: &AtomicBool,
    max_passes: Option<u32>,
    idle_sleep: Duration,
) -> Result<()> {
    let mut pass = 0u32;
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        pass += 1;
        info!(pass, "starting pass");
        let summary = run_pass(engine, stop)?;
        if let Some(max) = max_passes
            && pass >= max
        {
            return Ok(());
        }
        if summary.idle() && !stop.load(Ordering::SeqCst) {
            thread::sleep(idle_sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::EngineConfig;
    use crate::io::git::Git;
    use crate::io::paths::EnginePaths;
    use crate::test_support::{InMemoryTracker, ScriptedAgent, TestRepo, idea};

    #[test]
    fn pass_skips_done_ideas_and_counts_outcomes() {
        let repo = TestRepo::new().expect("repo");
        let tracker = InMemoryTracker::new();
        let mut done = idea("ID-9", "already finished");
        done.status_category = "Done".to_string();
        tracker.insert(done);
        let agent = ScriptedAgent::failing_with_output("nope");
        let engine = Engine {
            tracker: &tracker,
            agent: &agent,
            git: Git::new(repo.root()),
            paths: EnginePaths::new(repo.root()),
            config: EngineConfig::default(),
            timeout_override_secs: None,
        };

        let summary = run_pass(&engine, &AtomicBool::new(false)).expect("pass");
        assert_eq!(summary.processed, 0);
        assert_eq!(agent.runs(), 0);
    }

    #[test]
    fn stop_flag_ends_the_pass_before_the_next_item() {
        let repo = TestRepo::new().expect("repo");
        let tracker = InMemoryTracker::new();
        tracker.insert(idea("ID-1", "first"));
        tracker.insert(idea("ID-2", "second"));
        let agent = ScriptedAgent::failing_with_output("nope");
        let engine = Engine {
            tracker: &tracker,
            agent: &agent,
            git: Git::new(repo.root()),
            paths: EnginePaths::new(repo.root()),
            config: EngineConfig::default(),
            timeout_override_secs: None,
        };

        let stop = AtomicBool::new(true);
        let summary = run_pass(&engine, &stop).expect("pass");
        assert_eq!(summary.processed, 0);
    }

    #[test]
    fn loop_honors_max_passes() {
        let repo = TestRepo::new().expect("repo");
        let tracker = InMemoryTracker::new();
        let agent = ScriptedAgent::failing_with_output("nope");
        let engine = Engine {
            tracker: &tracker,
            agent: &agent,
            git: Git::new(repo.root()),
            paths: EnginePaths::new(repo.root()),
            config: EngineConfig::default(),
            timeout_override_secs: None,
        };

        run_loop(
            &engine,
            &AtomicBool::new(false),
            Some(2),
            Duration::from_millis(1),
        )
        .expect("loop");
    }
}
