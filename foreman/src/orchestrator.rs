//! The per-idea pipeline: intake, decompose, implement, verify, complete.
//!
//! Each phase is re-entrant. Lineage resolution and the ledger make a
//! crashed or interrupted run resumable: re-processing the same idea picks
//! up at the first phase whose evidence is missing, and never creates a
//! second epic or story for it.

use std::fs;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use tracing::{debug, error, info, instrument, warn};

use crate::core::fatal::classify_fatal;
use crate::core::fingerprint::{fingerprint, sha256_hex};
use crate::core::patch_spec::{PatchSpec, parse_patch_spec};
use crate::core::timeout::resolve_timeout;
use crate::core::types::{AttemptOutcome, EscalationClass, Phase};
use crate::guardrails::{self, GuardrailReport};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::config::EngineConfig;
use crate::io::escalation::{EscalationRecord, record_once};
use crate::io::git::Git;
use crate::io::ledger::{Ledger, LedgerEntry, load_ledger, now_rfc3339, write_ledger};
use crate::io::paths::{EnginePaths, STATE_PREFIX, is_engine_path};
use crate::io::report::ensure_report;
use crate::io::tracker::{Issue, Tracker, transition_to_category};
use crate::verify::{VerifyDecision, verify_item};

/// Label applied to items halted on a fatal signature.
pub const BLOCKED_LABEL: &str = "foreman-blocked";
/// Label applied when retries are exhausted.
pub const HUMAN_ATTENTION_LABEL: &str = "foreman-human-attention";

const IMPLEMENT_TEMPLATE: &str = include_str!("io/templates/implement.md");

/// Terminal outcome of one pass over an idea.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Story verified and transitioned to done.
    Completed,
    /// Committed (or previously committed) but verification has not
    /// passed yet; a later pass will re-verify.
    VerifyPending,
    /// Fatal signature matched; item labeled and halted.
    Blocked { reason: String },
    /// Retries exhausted or an unrecoverable precondition failed.
    HumanAttention { reason: String },
}

/// Orchestration engine wiring the tracker, git, and agent together.
pub struct Engine<'a> {
    pub tracker: &'a dyn Tracker,
    pub agent: &'a dyn Agent,
    pub git: Git,
    pub paths: EnginePaths,
    pub config: EngineConfig,
    /// CLI-level timeout override, highest priority.
    pub timeout_override_secs: Option<u64>,
}

impl Engine<'_> {
    /// Run the full pipeline for one idea.
    #[instrument(skip_all, fields(idea = %idea.key))]
    pub fn process_idea(&self, idea: &Issue) -> Result<ItemOutcome> {
        self.ensure_state_dirs()?;
        let mut ledger = load_ledger(&self.paths.ledger_path)?;

        let epic = crate::lineage::resolve_epic(self.tracker, &mut ledger, idea)?;
        let story = crate::lineage::resolve_story(self.tracker, &mut ledger, &epic.key, idea)?;
        write_ledger(&self.paths.ledger_path, &ledger)?;
        info!(phase = Phase::Decompose.as_str(), epic = %epic.key, story = %story.key, "lineage resolved");

        let story = self.tracker.get(&story.key)?;
        let spec = parse_patch_spec(&story.labels, &story.description);
        ensure_report(&self.paths.report_path(&story.key), &story.key, &story.summary)?;

        if story.labels.iter().any(|label| label == BLOCKED_LABEL) {
            debug!(story = %story.key, "story carries blocked label, skipping");
            return Ok(ItemOutcome::Blocked {
                reason: "previously blocked".to_string(),
            });
        }
        // Retry exhaustion is terminal for automation; only a human
        // removing the label re-enables attempts.
        if story.labels.iter().any(|label| label == HUMAN_ATTENTION_LABEL) {
            debug!(story = %story.key, "story awaits human attention, skipping");
            return Ok(ItemOutcome::HumanAttention {
                reason: "awaiting human attention".to_string(),
            });
        }

        // A prior pass may already have committed; skip straight to verify.
        if !ledger.items.contains_key(&story.key) {
            match self.implement_story(&mut ledger, &story, &spec)? {
                ImplementOutcome::Committed => {}
                ImplementOutcome::Blocked { reason } => {
                    return Ok(ItemOutcome::Blocked { reason });
                }
                ImplementOutcome::Exhausted { reason } => {
                    return Ok(ItemOutcome::HumanAttention { reason });
                }
            }
        }

        let decision = verify_item(
            self.tracker,
            &self.git,
            &self.paths,
            &self.config,
            &mut ledger,
            &story.key,
            &story.summary,
        )?;
        write_ledger(&self.paths.ledger_path, &ledger)?;

        match decision {
            VerifyDecision::Complete => {
                transition_to_category(self.tracker, &story.key, "Done")?;
                self.tracker
                    .add_comment(&story.key, "Verification passed; work item complete.")?;
                // Resolve the source idea too, so queue scans stop picking it up.
                transition_to_category(self.tracker, &idea.key, "Done")?;
                info!(phase = Phase::Complete.as_str(), story = %story.key, "item completed");
                Ok(ItemOutcome::Completed)
            }
            VerifyDecision::SkippedCooldown
            | VerifyDecision::Repaired
            | VerifyDecision::Failed { .. } => Ok(ItemOutcome::VerifyPending),
        }
    }

    /// Attempt loop for the implementation phase.
    fn implement_story(
        &self,
        ledger: &mut Ledger,
        story: &Issue,
        spec: &PatchSpec,
    ) -> Result<ImplementOutcome> {
        let timeout = resolve_timeout(
            self.timeout_override_secs,
            &story.description,
            self.config.env_timeout_secs,
            self.config.default_timeout_secs,
            self.config.timeout_ceiling_secs,
        );
        let prompt = self.render_prompt(story, spec)?;

        for attempt in 1..=self.config.max_attempts {
            info!(phase = Phase::Implement.as_str(), story = %story.key, attempt, max = self.config.max_attempts, "implementation attempt");
            guardrails::ensure_clean_worktree(&self.git)?;

            let request = AgentRequest {
                workdir: self.git.workdir().to_path_buf(),
                prompt: prompt.clone(),
                model: self.config.agent_model.clone(),
                timeout,
                output_limit_bytes: self.config.output_limit_bytes,
                heartbeat: self.config.heartbeat(),
                transcript_dir: self.paths.attempt_dir(&story.key, attempt),
            };
            let run = self.agent.run(&request)?;

            // Fatal signatures halt immediately, even on a nominally
            // successful exit, and always before any retry.
            if let Some(matcher) = classify_fatal(&run.output) {
                let reason = format!("fatal signature '{}' in agent output", matcher.name);
                error!(story = %story.key, signature = matcher.name, "fatal signature matched");
                self.discard_attempt()?;
                self.escalate(
                    EscalationClass::Fatal,
                    &story.key,
                    &reason,
                    &run.output,
                    &[run.transcript_path.display().to_string()],
                )?;
                self.tracker
                    .add_labels(&story.key, &[BLOCKED_LABEL.to_string()])?;
                return Ok(ImplementOutcome::Blocked { reason });
            }

            match run.outcome {
                AttemptOutcome::Timeout => {
                    warn!(story = %story.key, attempt, "agent timed out");
                    self.discard_attempt()?;
                    self.escalate(
                        EscalationClass::Recoverable,
                        &story.key,
                        &format!("agent timed out after {}s", timeout.as_secs()),
                        &run.output,
                        &[run.transcript_path.display().to_string()],
                    )?;
                    continue;
                }
                AttemptOutcome::Failure => {
                    warn!(story = %story.key, attempt, "agent exited non-zero");
                    self.discard_attempt()?;
                    self.escalate(
                        EscalationClass::Recoverable,
                        &story.key,
                        "agent exited non-zero",
                        &run.output,
                        &[run.transcript_path.display().to_string()],
                    )?;
                    continue;
                }
                AttemptOutcome::Success => {}
            }

            let report = guardrails::enforce(&self.git, &self.config, spec, &story.description)?;
            if !report.passed() {
                let describe = report.verdict.describe();
                warn!(story = %story.key, attempt, "guardrails rejected attempt:\n{describe}");
                self.discard_attempt()?;
                self.escalate(
                    EscalationClass::Recoverable,
                    &story.key,
                    &format!("guardrails rejected attempt {attempt}"),
                    &describe,
                    &[],
                )?;
                continue;
            }

            self.record_and_commit(ledger, story, spec, &report, attempt)?;
            return Ok(ImplementOutcome::Committed);
        }

        let reason = format!(
            "retries exhausted after {} attempts",
            self.config.max_attempts
        );
        self.escalate(
            EscalationClass::AttentionRequired,
            &story.key,
            &reason,
            &story.key,
            &[self.paths.report_path(&story.key).display().to_string()],
        )?;
        self.tracker
            .add_labels(&story.key, &[HUMAN_ATTENTION_LABEL.to_string()])?;
        self.tracker.add_comment(
            &story.key,
            &format!("Implementation halted: {reason}. Human attention required."),
        )?;
        Ok(ImplementOutcome::Exhausted { reason })
    }

    /// Durably record the accepted attempt, then commit it.
    ///
    /// Ledger-before-commit ordering: if the process dies between the two,
    /// the ledger already names the change set and verification will catch
    /// any divergence.
    fn record_and_commit(
        &self,
        ledger: &mut Ledger,
        story: &Issue,
        spec: &PatchSpec,
        report: &GuardrailReport,
        attempt: u32,
    ) -> Result<()> {
        let entry = LedgerEntry {
            base_commit: report.base_commit.clone(),
            changed_paths: report.diff.clone(),
            policy: spec.policy.clone(),
            budget_used: report.diff.len() as u32,
            guardrails_passed: true,
            report_path: self.paths.report_path(&story.key).display().to_string(),
            last_verify_failure: None,
            last_comment_fingerprint: None,
            repaired_hash: None,
            updated_at: now_rfc3339(),
        };
        ledger.items.insert(story.key.clone(), entry);
        write_ledger(&self.paths.ledger_path, ledger)?;

        self.git.stage_paths(&report.diff)?;
        self.ensure_engine_state_unstaged()?;
        let message = format!("chore(foreman): {} attempt {attempt}", story.key);
        let committed = self.git.commit_staged(&message)?;
        debug!(story = %story.key, committed, "commit step finished");

        if self.config.push_enabled {
            self.git.push(&self.config.integration_branch)?;
        }
        Ok(())
    }

    /// Engine state must never be committed. Stray staged engine paths are
    /// unstaged; the ledger or lock staged at all is a critical abort.
    fn ensure_engine_state_unstaged(&self) -> Result<()> {
        let staged = self.git.staged_paths()?;
        let engine_staged: Vec<String> = staged
            .into_iter()
            .filter(|path| is_engine_path(path))
            .collect();
        if engine_staged.is_empty() {
            return Ok(());
        }
        let never = self.paths.never_stage();
        if let Some(critical) = engine_staged.iter().find(|path| never.contains(path)) {
            bail!("refusing to commit: engine ledger state staged ({critical})");
        }
        warn!(paths = ?engine_staged, "unstaging engine state before commit");
        self.git.unstage_paths(&engine_staged)
    }

    fn discard_attempt(&self) -> Result<()> {
        self.git
            .discard_changes_except_prefixes(&[STATE_PREFIX])
            .context("discard attempt leftovers")
    }

    /// Record an escalation once per fingerprint; notify only on first sight.
    fn escalate(
        &self,
        class: EscalationClass,
        item_key: &str,
        reason: &str,
        content: &str,
        artifacts: &[String],
    ) -> Result<()> {
        let fp = fingerprint(class.as_str(), &sha256_hex(content));
        let record = EscalationRecord {
            fingerprint: fp,
            class,
            item_key: item_key.to_string(),
            reason: reason.to_string(),
            at: now_rfc3339(),
            artifacts: artifacts.to_vec(),
        };
        let recorded = record_once(&self.paths.escalations_path, record)?;
        if recorded {
            self.tracker
                .add_comment(item_key, &format!("Escalation: {reason}"))?;
        } else {
            debug!(item_key, reason, "escalation deduplicated");
        }
        Ok(())
    }

    fn render_prompt(&self, story: &Issue, spec: &PatchSpec) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("implement", IMPLEMENT_TEMPLATE)
            .context("implement template should be valid")?;
        let rendered = env.get_template("implement")?.render(context! {
            key => story.key,
            summary => story.summary,
            description => story.description,
            allowed_files => spec.allowed_files,
            allowed_new_globs => spec.allowed_new_globs,
            report_path => self.paths.report_path(&story.key).display().to_string(),
        })?;
        Ok(rendered)
    }

    fn ensure_state_dirs(&self) -> Result<()> {
        for dir in [
            &self.paths.state_dir,
            &self.paths.reports_dir,
            &self.paths.transcripts_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create engine dir {}", dir.display()))?;
        }
        Ok(())
    }
}

enum ImplementOutcome {
    Committed,
    Blocked { reason: String },
    Exhausted { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{InMemoryTracker, ScriptedAgent, TestRepo, idea};
    use std::fs;

    fn story_description(files: &[&str]) -> String {
        let mut body = String::from("Do the thing.\n\nPOLICY: frontend-only\n\nALLOWED FILES:\n");
        for file in files {
            body.push_str(&format!("- {file}\n"));
        }
        body
    }

    struct Setup {
        repo: TestRepo,
        tracker: InMemoryTracker,
        paths: EnginePaths,
        config: EngineConfig,
    }

    fn setup(files: &[&str]) -> Setup {
        let repo = TestRepo::new().expect("repo");
        let tracker = InMemoryTracker::new();
        tracker.insert(idea("ID-1", "Do the thing"));
        tracker.insert_story_with_description(
            "ST-1",
            "Do the thing",
            "EP-1",
            &story_description(files),
            &["story-source-ID-1"],
        );
        tracker.insert_epic("EP-1", "Do the thing", &["source-idea-ID-1"]);
        let paths = EnginePaths::new(repo.root());
        Setup {
            paths,
            tracker,
            config: EngineConfig::default(),
            repo,
        }
    }

    fn engine<'a>(s: &'a Setup, agent: &'a ScriptedAgent) -> Engine<'a> {
        Engine {
            tracker: &s.tracker,
            agent,
            git: Git::new(s.repo.root()),
            paths: s.paths.clone(),
            config: s.config.clone(),
            timeout_override_secs: None,
        }
    }

    #[test]
    fn successful_attempt_commits_and_records_ledger() {
        let s = setup(&["web/app.tsx"]);
        let agent = ScriptedAgent::success_editing(s.repo.root(), "web/app.tsx", "edited\n");

        let outcome = engine(&s, &agent)
            .process_idea(&s.tracker.get("ID-1").expect("idea"))
            .expect("process");
        // Committed and verified in the same pass.
        assert_eq!(outcome, ItemOutcome::Completed);

        let ledger = load_ledger(&s.paths.ledger_path).expect("ledger");
        let entry = &ledger.items["ST-1"];
        assert_eq!(entry.changed_paths, vec!["web/app.tsx".to_string()]);
        assert!(entry.guardrails_passed);
        assert_eq!(ledger.epics["ID-1"], "EP-1");
        assert_eq!(ledger.stories["EP-1"], "ST-1");
    }

    #[test]
    fn out_of_scope_edit_is_discarded_and_retried() {
        let s = setup(&["web/app.tsx"]);
        // First attempt edits a disallowed file, second attempt behaves.
        let agent = ScriptedAgent::sequence(
            s.repo.root(),
            vec![
                ("server/api.rs", "bad\n"),
                ("web/app.tsx", "good\n"),
            ],
        );

        let outcome = engine(&s, &agent)
            .process_idea(&s.tracker.get("ID-1").expect("idea"))
            .expect("process");
        assert_eq!(outcome, ItemOutcome::Completed);
        // The out-of-scope file did not survive into the worktree.
        assert!(!s.repo.root().join("server/api.rs").exists());
    }

    #[test]
    fn fatal_signature_blocks_before_retry() {
        let s = setup(&["web/app.tsx"]);
        let agent = ScriptedAgent::failing_with_output(
            "TypeError: Cannot read properties of undefined (reading 'x')",
        );

        let outcome = engine(&s, &agent)
            .process_idea(&s.tracker.get("ID-1").expect("idea"))
            .expect("process");
        assert!(matches!(outcome, ItemOutcome::Blocked { .. }));
        assert_eq!(agent.runs(), 1);
        let story = s.tracker.get("ST-1").expect("story");
        assert!(story.labels.iter().any(|l| l == BLOCKED_LABEL));
    }

    #[test]
    fn exhausted_retries_escalate_for_human_attention() {
        let s = setup(&["web/app.tsx"]);
        let agent = ScriptedAgent::failing_with_output("plain failure, nothing fatal");

        let outcome = engine(&s, &agent)
            .process_idea(&s.tracker.get("ID-1").expect("idea"))
            .expect("process");
        assert!(matches!(outcome, ItemOutcome::HumanAttention { .. }));
        assert_eq!(agent.runs(), s.config.max_attempts as usize);
        let story = s.tracker.get("ST-1").expect("story");
        assert!(story.labels.iter().any(|l| l == HUMAN_ATTENTION_LABEL));
        // Identical failures escalate once.
        let escalations =
            crate::io::escalation::load_escalations(&s.paths.escalations_path).expect("load");
        assert_eq!(
            escalations
                .iter()
                .filter(|e| e.class == EscalationClass::Recoverable)
                .count(),
            1
        );
    }

    #[test]
    fn human_attention_label_halts_further_attempts() {
        let s = setup(&["web/app.tsx"]);
        let agent = ScriptedAgent::failing_with_output("plain failure, nothing fatal");
        let eng = engine(&s, &agent);

        let first = eng
            .process_idea(&s.tracker.get("ID-1").expect("idea"))
            .expect("first");
        assert!(matches!(first, ItemOutcome::HumanAttention { .. }));
        assert_eq!(agent.runs(), s.config.max_attempts as usize);

        // The labeled story must not consume a fresh retry budget.
        let second = eng
            .process_idea(&s.tracker.get("ID-1").expect("idea"))
            .expect("second");
        assert!(matches!(second, ItemOutcome::HumanAttention { .. }));
        assert_eq!(agent.runs(), s.config.max_attempts as usize);
    }

    #[test]
    fn reprocessing_a_completed_commit_skips_the_agent() {
        let s = setup(&["web/app.tsx"]);
        let agent = ScriptedAgent::success_editing(s.repo.root(), "web/app.tsx", "edited\n");
        let eng = engine(&s, &agent);
        let idea_issue = s.tracker.get("ID-1").expect("idea");

        eng.process_idea(&idea_issue).expect("first pass");
        eng.process_idea(&idea_issue).expect("second pass");
        // The ledger entry short-circuits the implement phase.
        assert_eq!(agent.runs(), 1);
        // Only one epic and one story exist.
        assert_eq!(s.tracker.issues_of_type("Epic").len(), 1);
        assert_eq!(s.tracker.issues_of_type("Story").len(), 1);
    }

    #[test]
    fn engine_ledger_is_never_committed() {
        let s = setup(&["web/app.tsx"]);
        let agent = ScriptedAgent::success_editing(s.repo.root(), "web/app.tsx", "edited\n");

        engine(&s, &agent)
            .process_idea(&s.tracker.get("ID-1").expect("idea"))
            .expect("process");
        let git = Git::new(s.repo.root());
        let tracked = git_tracked(&git);
        assert!(tracked.iter().all(|p| !p.starts_with(".foreman/")));
        assert!(s.paths.ledger_path.exists());
    }

    fn git_tracked(git: &Git) -> Vec<String> {
        let out = std::process::Command::new("git")
            .args(["ls-files"])
            .current_dir(git.workdir())
            .output()
            .expect("git ls-files");
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn uses_marker_timeout_clamped_to_ceiling() {
        let s = setup(&["web/app.tsx"]);
        let mut story = s.tracker.get("ST-1").expect("story");
        story.description.push_str("\nAGENT-TIMEOUT-MINUTES: 100000\n");
        s.tracker.insert(story);
        let agent = ScriptedAgent::success_editing(s.repo.root(), "web/app.tsx", "edited\n");

        engine(&s, &agent)
            .process_idea(&s.tracker.get("ID-1").expect("idea"))
            .expect("process");
        assert_eq!(
            agent.last_timeout().expect("timeout"),
            std::time::Duration::from_secs(s.config.timeout_ceiling_secs)
        );
    }

    #[test]
    fn dirty_worktree_aborts_before_the_agent_runs() {
        let s = setup(&["web/app.tsx"]);
        fs::write(s.repo.root().join("unrelated.txt"), "debris").expect("write");
        let agent = ScriptedAgent::success_editing(s.repo.root(), "web/app.tsx", "edited\n");

        let err = engine(&s, &agent)
            .process_idea(&s.tracker.get("ID-1").expect("idea"))
            .expect_err("dirty tree");
        assert!(format!("{err:#}").contains("clean working tree"));
        assert_eq!(agent.runs(), 0);
    }
}
