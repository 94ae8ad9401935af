//! Canonical paths under `.foreman/` for a repository root.
//!
//! The state directory is an exclusive engine resource: its contents are
//! never staged for commit, and the clean-worktree precondition excludes
//! it.

use std::path::{Path, PathBuf};

/// Repo-relative prefix every engine-owned file lives under.
pub const STATE_PREFIX: &str = ".foreman/";

/// All canonical engine paths for a repository root.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub root: PathBuf,
    pub engine_dir: PathBuf,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub lock_path: PathBuf,
    pub escalations_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl EnginePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let engine_dir = root.join(".foreman");
        let state_dir = engine_dir.join("state");
        let reports_dir = engine_dir.join("reports");
        let transcripts_dir = engine_dir.join("transcripts");
        Self {
            root,
            engine_dir: engine_dir.clone(),
            state_dir: state_dir.clone(),
            reports_dir,
            transcripts_dir,
            ledger_path: state_dir.join("ledger.json"),
            lock_path: state_dir.join("ledger.lock"),
            escalations_path: state_dir.join("escalations.json"),
            gitignore_path: engine_dir.join(".gitignore"),
        }
    }

    /// Canonical verification report path for a work item.
    pub fn report_path(&self, key: &str) -> PathBuf {
        self.reports_dir.join(format!("{key}.md"))
    }

    /// Artifact directory for one implementation attempt.
    pub fn attempt_dir(&self, key: &str, attempt: u32) -> PathBuf {
        self.transcripts_dir.join(key).join(attempt.to_string())
    }

    /// Repo-relative paths that must never be staged for commit.
    pub fn never_stage(&self) -> Vec<String> {
        vec![
            format!("{STATE_PREFIX}state/ledger.json"),
            format!("{STATE_PREFIX}state/ledger.lock"),
        ]
    }
}

/// True when a repo-relative path is engine-owned state.
pub fn is_engine_path(path: &str) -> bool {
    path.starts_with(STATE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let paths = EnginePaths::new("/tmp/repo");
        assert!(paths.ledger_path.ends_with(".foreman/state/ledger.json"));
        assert!(paths.report_path("ST-1").ends_with(".foreman/reports/ST-1.md"));
        assert!(
            paths
                .attempt_dir("ST-1", 2)
                .ends_with(".foreman/transcripts/ST-1/2")
        );
    }

    #[test]
    fn engine_paths_are_recognized() {
        assert!(is_engine_path(".foreman/state/ledger.json"));
        assert!(!is_engine_path("web/a.tsx"));
    }

    #[test]
    fn never_stage_covers_ledger_and_lock() {
        let paths = EnginePaths::new("/tmp/repo");
        let never = paths.never_stage();
        assert!(never.iter().any(|p| p.ends_with("ledger.json")));
        assert!(never.iter().any(|p| p.ends_with("ledger.lock")));
    }
}
