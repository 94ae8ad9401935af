//! Verification and drift validation before an item may complete.
//!
//! An item transitions to its resolved state only when the full evidence
//! chain holds: the report exists, its checklist is structurally valid and
//! fully checked, the ledger's guardrails-passed flag is set, and the
//! recomputed authoritative diff exactly equals the diff recorded at
//! commit time. Any discrepancy is drift and blocks completion.
//!
//! Failures are cooldown-gated: re-evaluation happens only when the report
//! content hash has changed since the last failure AND the cooldown has
//! elapsed. Tracker comments are posted only when the (reason, hash) pair
//! differs from the last comment, so an unchanged failure never produces
//! duplicate notifications.

use std::fs;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::fingerprint::{fingerprint, sha256_hex};
use crate::core::types::Phase;
use crate::io::config::EngineConfig;
use crate::io::git::Git;
use crate::io::ledger::{Ledger, VerifyFailure, now_rfc3339};
use crate::io::paths::{EnginePaths, is_engine_path};
use crate::io::report::{ReportStructure, inspect_report, repair_report};
use crate::io::tracker::Tracker;

/// Outcome of a verification pass for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyDecision {
    /// Full evidence chain holds; the item may complete.
    Complete,
    /// Unchanged report within the cooldown window; not re-evaluated.
    SkippedCooldown,
    /// Structurally invalid report was repaired; re-verify after the agent
    /// re-checks the checklist.
    Repaired,
    /// Evidence chain broken for the given reason.
    Failed { reason: String },
}

/// Validate the evidence chain for one story.
///
/// Mutates the ledger entry's failure/comment state; the caller persists
/// the ledger.
#[instrument(skip_all, fields(key))]
pub fn verify_item<T: Tracker + ?Sized>(
    tracker: &T,
    git: &Git,
    paths: &EnginePaths,
    config: &EngineConfig,
    ledger: &mut Ledger,
    key: &str,
    story_summary: &str,
) -> Result<VerifyDecision> {
    let report_path = paths.report_path(key);

    let Some(entry) = ledger.items.get(key) else {
        // Legacy records predate the ledger mapping; a best-effort report
        // scan still cannot substitute for guardrail evidence.
        let reason = if report_path.exists() {
            "no ledger run-record for item (legacy report found, evidence incomplete)"
        } else {
            "no ledger run-record for item"
        };
        warn!(key, reason, "verification failed");
        return Ok(VerifyDecision::Failed {
            reason: reason.to_string(),
        });
    };

    if !report_path.exists() {
        let reason = "missing verification report".to_string();
        return fail(tracker, ledger, key, &reason, "", config);
    }
    let content = fs::read_to_string(&report_path)
        .with_context(|| format!("read report {}", report_path.display()))?;
    let content_hash = sha256_hex(&content);

    // Cooldown gate: an unchanged report within the window is skipped.
    if let Some(last) = &entry.last_verify_failure
        && last.content_hash == content_hash
        && !cooldown_elapsed(&last.at, config)
    {
        debug!(key, "verification skipped (cooldown active, hash unchanged)");
        return Ok(VerifyDecision::SkippedCooldown);
    }

    match inspect_report(&content) {
        ReportStructure::MissingChecklist | ReportStructure::MissingItems { .. } => {
            if entry.repaired_hash.as_deref() == Some(content_hash.as_str()) {
                // Already repaired this exact pre-repair state once.
                let reason = "report structurally invalid after repair".to_string();
                return fail(tracker, ledger, key, &reason, &content_hash, config);
            }
            repair_report(&report_path, key, story_summary)?;
            info!(key, "report repaired, cooldown set");
            let reason = "report missing required checklist (repaired)".to_string();
            if let Some(entry) = ledger.items.get_mut(key) {
                entry.repaired_hash = Some(content_hash.clone());
                record_failure(entry, &reason, &content_hash);
            }
            comment_once(tracker, ledger, key, &reason, &content_hash)?;
            return Ok(VerifyDecision::Repaired);
        }
        ReportStructure::Valid { all_checked: false } => {
            let reason = "checklist items not all checked".to_string();
            return fail(tracker, ledger, key, &reason, &content_hash, config);
        }
        ReportStructure::Valid { all_checked: true } => {}
    }

    if !entry.guardrails_passed {
        let reason = "ledger guardrails-passed flag is false".to_string();
        return fail(tracker, ledger, key, &reason, &content_hash, config);
    }

    // Drift check: recompute the authoritative diff fresh.
    git.fetch(&config.integration_branch)?;
    let current: Vec<String> = git
        .diff_paths_against_fetched()?
        .into_iter()
        .filter(|path| !is_engine_path(path))
        .collect();
    if current != entry.changed_paths {
        let reason = format!(
            "drift detected: recorded [{}] vs current [{}]",
            entry.changed_paths.join(", "),
            current.join(", ")
        );
        return fail(tracker, ledger, key, &reason, &content_hash, config);
    }

    if let Some(entry) = ledger.items.get_mut(key) {
        entry.last_verify_failure = None;
        entry.updated_at = now_rfc3339();
    }
    info!(phase = Phase::Verify.as_str(), key, "verification passed");
    Ok(VerifyDecision::Complete)
}

fn fail<T: Tracker + ?Sized>(
    tracker: &T,
    ledger: &mut Ledger,
    key: &str,
    reason: &str,
    content_hash: &str,
    _config: &EngineConfig,
) -> Result<VerifyDecision> {
    warn!(key, reason, "verification failed");
    if let Some(entry) = ledger.items.get_mut(key) {
        record_failure(entry, reason, content_hash);
    }
    comment_once(tracker, ledger, key, reason, content_hash)?;
    Ok(VerifyDecision::Failed {
        reason: reason.to_string(),
    })
}

fn record_failure(entry: &mut crate::io::ledger::LedgerEntry, reason: &str, content_hash: &str) {
    entry.last_verify_failure = Some(VerifyFailure {
        reason: reason.to_string(),
        content_hash: content_hash.to_string(),
        at: now_rfc3339(),
    });
    entry.updated_at = now_rfc3339();
}

/// Post a tracker comment unless the (reason, hash) fingerprint matches
/// the last comment posted for this item.
fn comment_once<T: Tracker + ?Sized>(
    tracker: &T,
    ledger: &mut Ledger,
    key: &str,
    reason: &str,
    content_hash: &str,
) -> Result<()> {
    let fp = fingerprint(reason, content_hash);
    let Some(entry) = ledger.items.get_mut(key) else {
        return Ok(());
    };
    if entry.last_comment_fingerprint.as_deref() == Some(fp.as_str()) {
        debug!(key, "comment suppressed (unchanged failure)");
        return Ok(());
    }
    tracker.add_comment(key, &format!("Verification failed: {reason}"))?;
    entry.last_comment_fingerprint = Some(fp);
    Ok(())
}

fn cooldown_elapsed(failed_at: &str, config: &EngineConfig) -> bool {
    let Ok(at) = DateTime::parse_from_rfc3339(failed_at) else {
        // Unparseable timestamp: treat the cooldown as elapsed.
        return true;
    };
    let elapsed = Utc::now().signed_duration_since(at.with_timezone(&Utc));
    elapsed.num_seconds() >= config.verify_cooldown().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::PolicyClass;
    use crate::io::ledger::LedgerEntry;
    use crate::io::report::{REQUIRED_ITEMS, ensure_report};
    use crate::test_support::{InMemoryTracker, TestRepo};
    use std::fs;

    fn checked_report(paths: &EnginePaths, key: &str) {
        ensure_report(&paths.report_path(key), key, "summary").expect("ensure");
        let mut content = fs::read_to_string(paths.report_path(key)).expect("read");
        for item in REQUIRED_ITEMS {
            content = content.replace(&format!("- [ ] {item}"), &format!("- [x] {item}"));
        }
        fs::write(paths.report_path(key), content).expect("write");
    }

    fn seeded_entry(base_commit: &str, changed: &[&str], guardrails_passed: bool) -> LedgerEntry {
        LedgerEntry {
            base_commit: base_commit.to_string(),
            changed_paths: changed.iter().map(|p| p.to_string()).collect(),
            policy: PolicyClass::FrontendOnly,
            budget_used: changed.len() as u32,
            guardrails_passed,
            report_path: String::new(),
            last_verify_failure: None,
            last_comment_fingerprint: None,
            repaired_hash: None,
            updated_at: now_rfc3339(),
        }
    }

    struct Setup {
        repo: TestRepo,
        tracker: InMemoryTracker,
        paths: EnginePaths,
        config: EngineConfig,
        ledger: Ledger,
    }

    fn setup() -> Setup {
        let repo = TestRepo::new().expect("repo");
        let paths = EnginePaths::new(repo.root());
        Setup {
            tracker: InMemoryTracker::new(),
            paths,
            config: EngineConfig::default(),
            ledger: Ledger::default(),
            repo,
        }
    }

    #[test]
    fn complete_requires_full_evidence_chain() {
        let mut s = setup();
        let git = Git::new(s.repo.root());
        // Committed in-scope change, recorded in the ledger.
        s.repo
            .commit_local("web/a.tsx", "content\n")
            .expect("commit");
        checked_report(&s.paths, "ST-1");
        s.ledger
            .items
            .insert("ST-1".to_string(), seeded_entry("base", &["web/a.tsx"], true));

        let decision = verify_item(
            &s.tracker,
            &git,
            &s.paths,
            &s.config,
            &mut s.ledger,
            "ST-1",
            "summary",
        )
        .expect("verify");
        assert_eq!(decision, VerifyDecision::Complete);
        assert!(s.ledger.items["ST-1"].last_verify_failure.is_none());
    }

    #[test]
    fn missing_ledger_entry_fails() {
        let mut s = setup();
        let git = Git::new(s.repo.root());
        let decision = verify_item(
            &s.tracker,
            &git,
            &s.paths,
            &s.config,
            &mut s.ledger,
            "ST-1",
            "summary",
        )
        .expect("verify");
        assert!(matches!(decision, VerifyDecision::Failed { reason } if reason.contains("ledger")));
    }

    #[test]
    fn drift_blocks_completion() {
        let mut s = setup();
        let git = Git::new(s.repo.root());
        s.repo
            .commit_local("web/a.tsx", "content\n")
            .expect("commit");
        // Untracked post-commit change not present in the recorded set.
        fs::write(s.repo.root().join("web/z.tsx"), "drift").expect("write");
        checked_report(&s.paths, "ST-1");
        s.ledger
            .items
            .insert("ST-1".to_string(), seeded_entry("base", &["web/a.tsx"], true));

        let decision = verify_item(
            &s.tracker,
            &git,
            &s.paths,
            &s.config,
            &mut s.ledger,
            "ST-1",
            "summary",
        )
        .expect("verify");
        assert!(matches!(decision, VerifyDecision::Failed { reason } if reason.contains("drift")));
        assert!(decision_reason(&s.ledger).contains("web/z.tsx"));
    }

    fn decision_reason(ledger: &Ledger) -> String {
        ledger.items["ST-1"]
            .last_verify_failure
            .as_ref()
            .map(|f| f.reason.clone())
            .unwrap_or_default()
    }

    #[test]
    fn guardrails_flag_false_fails() {
        let mut s = setup();
        let git = Git::new(s.repo.root());
        s.repo
            .commit_local("web/a.tsx", "content\n")
            .expect("commit");
        checked_report(&s.paths, "ST-1");
        s.ledger.items.insert(
            "ST-1".to_string(),
            seeded_entry("base", &["web/a.tsx"], false),
        );

        let decision = verify_item(
            &s.tracker,
            &git,
            &s.paths,
            &s.config,
            &mut s.ledger,
            "ST-1",
            "summary",
        )
        .expect("verify");
        assert!(
            matches!(decision, VerifyDecision::Failed { reason } if reason.contains("guardrails"))
        );
    }

    #[test]
    fn invalid_report_repaired_once_with_cooldown_and_single_comment() {
        let mut s = setup();
        let git = Git::new(s.repo.root());
        fs::create_dir_all(&s.paths.reports_dir).expect("mkdir");
        fs::write(s.paths.report_path("ST-1"), "free-form notes\n").expect("write");
        s.ledger
            .items
            .insert("ST-1".to_string(), seeded_entry("base", &[], true));

        let decision = verify_item(
            &s.tracker,
            &git,
            &s.paths,
            &s.config,
            &mut s.ledger,
            "ST-1",
            "summary",
        )
        .expect("verify");
        assert_eq!(decision, VerifyDecision::Repaired);

        let repaired = fs::read_to_string(s.paths.report_path("ST-1")).expect("read");
        assert!(repaired.contains("## Verification Checklist"));
        assert!(repaired.contains("free-form notes"));
        assert_eq!(s.tracker.comments("ST-1").len(), 1);
        assert!(s.ledger.items["ST-1"].last_verify_failure.is_some());
    }

    #[test]
    fn unchanged_hash_within_cooldown_is_skipped() {
        let mut s = setup();
        let git = Git::new(s.repo.root());
        checked_report(&s.paths, "ST-1");
        let content = fs::read_to_string(s.paths.report_path("ST-1")).expect("read");
        let mut entry = seeded_entry("base", &["web/a.tsx"], false);
        entry.last_verify_failure = Some(VerifyFailure {
            reason: "ledger guardrails-passed flag is false".to_string(),
            content_hash: sha256_hex(&content),
            at: now_rfc3339(),
        });
        s.ledger.items.insert("ST-1".to_string(), entry);

        let decision = verify_item(
            &s.tracker,
            &git,
            &s.paths,
            &s.config,
            &mut s.ledger,
            "ST-1",
            "summary",
        )
        .expect("verify");
        assert_eq!(decision, VerifyDecision::SkippedCooldown);
        assert!(s.tracker.comments("ST-1").is_empty());
    }

    #[test]
    fn elapsed_cooldown_allows_reevaluation() {
        let mut s = setup();
        let git = Git::new(s.repo.root());
        checked_report(&s.paths, "ST-1");
        let content = fs::read_to_string(s.paths.report_path("ST-1")).expect("read");
        let old = (Utc::now() - chrono::Duration::seconds(11 * 60)).to_rfc3339();
        let mut entry = seeded_entry("base", &["web/a.tsx"], false);
        entry.last_verify_failure = Some(VerifyFailure {
            reason: "ledger guardrails-passed flag is false".to_string(),
            content_hash: sha256_hex(&content),
            at: old,
        });
        s.ledger.items.insert("ST-1".to_string(), entry);

        let decision = verify_item(
            &s.tracker,
            &git,
            &s.paths,
            &s.config,
            &mut s.ledger,
            "ST-1",
            "summary",
        )
        .expect("verify");
        assert!(matches!(decision, VerifyDecision::Failed { .. }));
    }

    #[test]
    fn repeat_failure_with_same_hash_comments_once() {
        let mut s = setup();
        let git = Git::new(s.repo.root());
        checked_report(&s.paths, "ST-1");
        let mut entry = seeded_entry("base", &["web/a.tsx"], false);
        // Simulate an old failure with a different hash so re-evaluation runs.
        entry.last_verify_failure = Some(VerifyFailure {
            reason: "old".to_string(),
            content_hash: "different".to_string(),
            at: (Utc::now() - chrono::Duration::seconds(11 * 60)).to_rfc3339(),
        });
        s.ledger.items.insert("ST-1".to_string(), entry);

        for _ in 0..2 {
            // Reset the cooldown clock but keep the comment fingerprint.
            if let Some(entry) = s.ledger.items.get_mut("ST-1") {
                if let Some(failure) = entry.last_verify_failure.as_mut() {
                    failure.at = (Utc::now() - chrono::Duration::seconds(11 * 60)).to_rfc3339();
                    failure.content_hash = "stale".to_string();
                }
            }
            verify_item(
                &s.tracker,
                &git,
                &s.paths,
                &s.config,
                &mut s.ledger,
                "ST-1",
                "summary",
            )
            .expect("verify");
        }
        assert_eq!(s.tracker.comments("ST-1").len(), 1);
    }
}
