//! Verification report documents, one markdown file per work item.
//!
//! The skeleton is created once and never overwritten if already present.
//! A structurally invalid report (missing checklist heading or required
//! items) is repaired exactly once per pre-repair content state: the
//! canonical skeleton is prepended and the original content is preserved
//! intact under an appendix section. The pre-repair content hash is
//! recorded by the caller to prevent repeated rewrites of the same state.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{debug, info};

pub const CHECKLIST_HEADING: &str = "## Verification Checklist";
pub const APPENDIX_HEADING: &str = "## Original Content (pre-repair)";

/// Required checklist items, verbatim.
pub const REQUIRED_ITEMS: &[&str] = &[
    "Scope respected (only allowed files changed)",
    "Diff budget respected",
    "Implementation complete for the story goal",
    "Tests updated or added for the change",
];

const REPORT_TEMPLATE: &str = include_str!("templates/report.md");

/// Structural inspection result for a report document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportStructure {
    /// Checklist heading and all required items present.
    Valid { all_checked: bool },
    MissingChecklist,
    MissingItems { missing: Vec<String> },
}

/// Render the canonical skeleton for a work item.
pub fn report_skeleton(key: &str, summary: &str) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("report", REPORT_TEMPLATE)
        .context("report template should be valid")?;
    let template = env.get_template("report")?;
    let rendered = template.render(context! {
        key => key,
        summary => summary,
        items => REQUIRED_ITEMS,
    })?;
    Ok(rendered)
}

/// Create the report skeleton if missing. Returns true when created.
///
/// An existing report is never overwritten, regardless of its content.
pub fn ensure_report(path: &Path, key: &str, summary: &str) -> Result<bool> {
    if path.exists() {
        debug!(path = %path.display(), "report already exists");
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report dir {}", parent.display()))?;
    }
    let skeleton = report_skeleton(key, summary)?;
    fs::write(path, skeleton).with_context(|| format!("write report {}", path.display()))?;
    info!(path = %path.display(), "report skeleton created");
    Ok(true)
}

/// Inspect report content for the required checklist structure.
pub fn inspect_report(content: &str) -> ReportStructure {
    if !content
        .lines()
        .any(|line| line.trim() == CHECKLIST_HEADING)
    {
        return ReportStructure::MissingChecklist;
    }
    let mut missing = Vec::new();
    let mut all_checked = true;
    for item in REQUIRED_ITEMS {
        match item_state(content, item) {
            Some(checked) => {
                if !checked {
                    all_checked = false;
                }
            }
            None => missing.push((*item).to_string()),
        }
    }
    if !missing.is_empty() {
        return ReportStructure::MissingItems { missing };
    }
    ReportStructure::Valid { all_checked }
}

fn item_state(content: &str, item: &str) -> Option<bool> {
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("- [x] ").or_else(|| trimmed.strip_prefix("- [X] ")) {
            if rest.trim() == item {
                return Some(true);
            }
        }
        if let Some(rest) = trimmed.strip_prefix("- [ ] ") {
            if rest.trim() == item {
                return Some(false);
            }
        }
    }
    None
}

/// Repair a structurally invalid report in place.
///
/// Prepends the canonical skeleton and preserves the previous content
/// verbatim under the appendix heading. Returns the rewritten content.
pub fn repair_report(path: &Path, key: &str, summary: &str) -> Result<String> {
    let original =
        fs::read_to_string(path).with_context(|| format!("read report {}", path.display()))?;
    let skeleton = report_skeleton(key, summary)?;
    let repaired = format!("{skeleton}\n{APPENDIX_HEADING}\n\n{original}");
    fs::write(path, &repaired).with_context(|| format!("repair report {}", path.display()))?;
    info!(path = %path.display(), "report repaired with canonical skeleton");
    Ok(repaired)
}
