//! Git adapter for the orchestration engine.
//!
//! The engine enforces scope and commits deterministically, so we keep a
//! small, explicit wrapper around `git` subprocess calls. The authoritative
//! diff is always computed against a freshly fetched remote integration
//! branch, never the local unfetched ref.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current HEAD commit sha.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Fetch the integration branch from `origin`.
    #[instrument(skip_all, fields(branch))]
    pub fn fetch(&self, branch: &str) -> Result<()> {
        debug!(branch, "fetching integration branch");
        self.run_checked(&["fetch", "--quiet", "origin", branch])?;
        Ok(())
    }

    /// Sha of the most recently fetched remote tip.
    pub fn fetch_head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "FETCH_HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Authoritative path-only diff against the fetched remote tip.
    ///
    /// Three-dot-style semantics: paths changed on our side since the merge
    /// base with `FETCH_HEAD`, including uncommitted and untracked files.
    /// Remote-only changes never count. Call [`Git::fetch`] first.
    #[instrument(skip_all)]
    pub fn diff_paths_against_fetched(&self) -> Result<Vec<String>> {
        let base = self
            .run_capture(&["merge-base", "FETCH_HEAD", "HEAD"])?
            .trim()
            .to_string();
        let tracked = self.run_capture(&["diff", "--name-only", &base])?;
        let untracked = self.run_capture(&["ls-files", "--others", "--exclude-standard"])?;

        let mut paths = BTreeSet::new();
        for line in tracked.lines().chain(untracked.lines()) {
            let path = line.trim();
            if !path.is_empty() {
                paths.insert(path.to_string());
            }
        }
        let paths: Vec<String> = paths.into_iter().collect();
        debug!(count = paths.len(), "authoritative diff computed");
        Ok(paths)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if allowed_prefixes
                .iter()
                .any(|prefix| entry.path.starts_with(prefix))
            {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Stage the given repo-relative paths.
    pub fn stage_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Unstage the given repo-relative paths.
    pub fn unstage_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["reset", "-q", "HEAD", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Discard all uncommitted and untracked changes, keeping paths under
    /// the given prefixes. Used between attempts so a retry never inherits
    /// a previous attempt's leftovers.
    #[instrument(skip_all)]
    pub fn discard_changes_except_prefixes(&self, keep_prefixes: &[&str]) -> Result<()> {
        warn!("discarding uncommitted changes");
        self.run_checked(&["checkout", "--", "."])?;
        let mut args = vec!["clean", "-fdq"];
        for prefix in keep_prefixes {
            args.push("-e");
            args.push(prefix);
        }
        self.run_checked(&args)?;
        Ok(())
    }

    /// Paths currently staged for commit.
    pub fn staged_paths(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if self.staged_paths()?.is_empty() {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Push the current branch to `origin/<branch>` (feature-flag gated by callers).
    #[instrument(skip_all, fields(branch))]
    pub fn push(&self, branch: &str) -> Result<()> {
        debug!(branch, "pushing to origin");
        self.run_checked(&["push", "--quiet", "origin", &format!("HEAD:{branch}")])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }
}
