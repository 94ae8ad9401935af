//! Declared scope contract for a story and its description-block parser.
//!
//! A story's description carries two machine-readable blocks:
//!
//! ```text
//! ALLOWED FILES:
//! - web/components/Header.tsx
//! - web/pages/index.tsx
//!
//! ALLOWED NEW FILES:
//! - web/components/**/*.test.tsx
//! ```
//!
//! plus optional free-text markers (`DIFF BUDGET: n`,
//! `DIFF-BUDGET-APPROVED`). Existing files must match by exact path
//! equality; new files match against explicit glob patterns. Matching by
//! filename suffix alone is forbidden because it silently widens scope.

use anyhow::{Context, Result, anyhow};
use regex::Regex;

use crate::core::policy::{PolicyClass, classify};

/// Declared scope contract for a story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSpec {
    /// Exact repo-relative paths the story may modify.
    pub allowed_files: Vec<String>,
    /// Glob patterns for files the story may create.
    pub allowed_new_globs: Vec<String>,
    /// Declared diff budget (file count). `None` falls back to the ceiling.
    pub diff_budget: Option<u32>,
    /// Policy class derived from labels/markers.
    pub policy: PolicyClass,
}

impl PatchSpec {
    /// True when the story declares no scope at all.
    pub fn is_empty(&self) -> bool {
        self.allowed_files.is_empty() && self.allowed_new_globs.is_empty()
    }
}

/// Parse the scope declaration blocks and markers out of a description.
pub fn parse_patch_spec(labels: &[String], description: &str) -> PatchSpec {
    PatchSpec {
        allowed_files: parse_block(description, "ALLOWED FILES:"),
        allowed_new_globs: parse_block(description, "ALLOWED NEW FILES:"),
        diff_budget: parse_diff_budget(description),
        policy: classify(labels, description),
    }
}

/// True when the description carries an explicit human budget approval.
pub fn budget_approved(description: &str) -> bool {
    description
        .lines()
        .any(|line| line.trim() == "DIFF-BUDGET-APPROVED")
}

fn parse_block(description: &str, header: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut in_block = false;
    for line in description.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case(header) {
            in_block = true;
            continue;
        }
        if !in_block {
            continue;
        }
        if let Some(entry) = trimmed.strip_prefix("- ") {
            let entry = entry.trim();
            if !entry.is_empty() {
                entries.push(entry.to_string());
            }
            continue;
        }
        // Block ends at the first non-bullet line (blank line or next header).
        break;
    }
    entries
}

fn parse_diff_budget(description: &str) -> Option<u32> {
    for line in description.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("DIFF BUDGET:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

/// Compiled shell-glob pattern, anchored over the full repo-relative path.
///
/// `*` and `?` do not cross `/`; `**` does; `[...]` classes are supported.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    pattern: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn compile(pattern: &str) -> Result<Self> {
        let regex_src = glob_to_regex(pattern)
            .with_context(|| format!("invalid glob pattern '{pattern}'"))?;
        let regex = Regex::new(&regex_src)
            .with_context(|| format!("compile glob pattern '{pattern}'"))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

fn glob_to_regex(pattern: &str) -> Result<String> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` collapses to any (possibly empty) directory run.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:[^/]+/)*");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if matches!(inner, '\\' | '^') {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                if !closed {
                    return Err(anyhow!("unterminated character class"));
                }
                out.push(']');
            }
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    Ok(out)
}
