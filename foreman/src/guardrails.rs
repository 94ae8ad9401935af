//! Guardrails enforcement around the implementation step.
//!
//! Combines the pure scope evaluation in [`crate::core::scope`] with the
//! authoritative diff from git. The diff is computed only against a freshly
//! fetched remote integration branch; the local unfetched ref is never
//! trusted. All checks fail closed.

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::patch_spec::{PatchSpec, budget_approved};
use crate::core::scope::{ScopeInput, ScopeVerdict, evaluate};
use crate::io::config::EngineConfig;
use crate::io::git::Git;
use crate::io::paths::{STATE_PREFIX, is_engine_path};

/// Result of one guardrails evaluation.
#[derive(Debug, Clone)]
pub struct GuardrailReport {
    /// Authoritative diff paths (engine-owned state excluded, sorted).
    pub diff: Vec<String>,
    pub verdict: ScopeVerdict,
    /// Fetched remote tip the diff was computed against.
    pub base_commit: String,
}

impl GuardrailReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

/// Clean-working-tree precondition, excluding engine-owned state.
///
/// A dirty tree is a hard failure: the agent must never run on top of
/// unrelated changes, and a retry must never inherit a previous attempt's
/// leftovers.
pub fn ensure_clean_worktree(git: &Git) -> Result<()> {
    git.ensure_clean_except_prefixes(&[STATE_PREFIX])
        .context("clean working tree precondition")
}

/// Compute the authoritative diff and evaluate it against the story scope.
#[instrument(skip_all, fields(branch = %config.integration_branch))]
pub fn enforce(
    git: &Git,
    config: &EngineConfig,
    spec: &PatchSpec,
    story_description: &str,
) -> Result<GuardrailReport> {
    git.fetch(&config.integration_branch)?;
    let base_commit = git.fetch_head_sha()?;
    let diff: Vec<String> = git
        .diff_paths_against_fetched()?
        .into_iter()
        .filter(|path| !is_engine_path(path))
        .collect();
    debug!(files = diff.len(), base = %base_commit, "evaluating guardrails");

    let verdict = evaluate(&ScopeInput {
        diff_paths: &diff,
        spec,
        budget_ceiling: config.budget_ceiling,
        budget_approved: budget_approved(story_description),
    });
    if !verdict.passed() {
        warn!(violations = verdict.violations.len(), "guardrails failed");
    }

    Ok(GuardrailReport {
        diff,
        verdict,
        base_commit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::PolicyClass;
    use crate::test_support::TestRepo;
    use std::fs;

    fn frontend_spec(files: &[&str]) -> PatchSpec {
        PatchSpec {
            allowed_files: files.iter().map(|f| f.to_string()).collect(),
            allowed_new_globs: Vec::new(),
            diff_budget: None,
            policy: PolicyClass::FrontendOnly,
        }
    }

    #[test]
    fn clean_tree_passes_with_engine_state_present() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        fs::create_dir_all(repo.root().join(".foreman/state")).expect("mkdir");
        fs::write(repo.root().join(".foreman/state/ledger.json"), "{}").expect("write");

        ensure_clean_worktree(&git).expect("clean except engine state");
    }

    #[test]
    fn dirty_tree_is_a_hard_failure() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        fs::write(repo.root().join("stray.txt"), "x").expect("write");

        let err = ensure_clean_worktree(&git).unwrap_err();
        assert!(format!("{err:#}").contains("stray.txt"));
    }

    #[test]
    fn enforce_flags_out_of_scope_paths() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        fs::create_dir_all(repo.root().join("web")).expect("mkdir");
        fs::write(repo.root().join("web/a.tsx"), "a").expect("write");
        fs::write(repo.root().join("web/c.tsx"), "c").expect("write");

        let spec = frontend_spec(&["web/a.tsx", "web/b.tsx"]);
        let config = EngineConfig::default();
        let report = enforce(&git, &config, &spec, "").expect("enforce");
        assert!(!report.passed());
        assert!(report.verdict.describe().contains("web/c.tsx"));
        assert_eq!(report.diff, vec!["web/a.tsx", "web/c.tsx"]);
    }

    #[test]
    fn enforce_passes_in_scope_changes_and_excludes_engine_state() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        fs::create_dir_all(repo.root().join("web")).expect("mkdir");
        fs::write(repo.root().join("web/a.tsx"), "a").expect("write");
        fs::create_dir_all(repo.root().join(".foreman/state")).expect("mkdir");
        fs::write(repo.root().join(".foreman/state/ledger.json"), "{}").expect("write");

        let spec = frontend_spec(&["web/a.tsx"]);
        let config = EngineConfig::default();
        let report = enforce(&git, &config, &spec, "").expect("enforce");
        assert!(report.passed());
        assert_eq!(report.diff, vec!["web/a.tsx"]);
        assert!(!report.base_commit.is_empty());
    }

    #[test]
    fn remote_only_changes_never_count_against_scope() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_on_origin("docs/remote.md", "remote change\n")
            .expect("remote commit");
        let git = Git::new(repo.root());

        let spec = frontend_spec(&["web/a.tsx"]);
        let config = EngineConfig::default();
        let report = enforce(&git, &config, &spec, "").expect("enforce");
        // No local changes: empty diff, and the remote-side commit is ignored.
        assert!(report.diff.is_empty());
    }
}
