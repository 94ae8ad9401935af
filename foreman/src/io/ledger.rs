//! Durable per-work-item run-state ledger.
//!
//! Single canonical file at `.foreman/state/ledger.json`, versioned schema,
//! validated against the embedded JSON Schema on load. The ledger is the
//! sole source of truth for guardrail and verification outcomes; entries
//! are written immediately before any commit attempt and never
//! reconstructed from commits after the fact. All writes are atomic (temp
//! sibling file + rename); a failed write aborts the enclosing operation.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::policy::PolicyClass;

const LEDGER_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/ledger/v1.schema.json"
));

pub const LEDGER_VERSION: u32 = 1;

/// Cooldown state for the last verification failure of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyFailure {
    pub reason: String,
    pub content_hash: String,
    /// RFC 3339 timestamp of the failure.
    pub at: String,
}

/// Run record for one story, mutated across attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Fetched remote tip the diff was computed against.
    pub base_commit: String,
    /// Recorded set of changed file paths at commit time (sorted).
    pub changed_paths: Vec<String>,
    pub policy: PolicyClass,
    /// Number of files counted against the diff budget.
    pub budget_used: u32,
    pub guardrails_passed: bool,
    /// Repo-relative path of the verification report.
    pub report_path: String,
    #[serde(default)]
    pub last_verify_failure: Option<VerifyFailure>,
    /// Fingerprint of the last tracker comment posted for this item.
    #[serde(default)]
    pub last_comment_fingerprint: Option<String>,
    /// Pre-repair content hash of an already-repaired report.
    #[serde(default)]
    pub repaired_hash: Option<String>,
    pub updated_at: String,
}

/// Versioned ledger document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub version: u32,
    /// Idea key -> canonical Epic key.
    pub epics: BTreeMap<String, String>,
    /// Epic key -> canonical Story key.
    pub stories: BTreeMap<String, String>,
    /// Story key -> run record.
    pub items: BTreeMap<String, LedgerEntry>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            epics: BTreeMap::new(),
            stories: BTreeMap::new(),
            items: BTreeMap::new(),
        }
    }
}

impl Ledger {
    pub fn epic_for(&self, idea_key: &str) -> Option<&str> {
        self.epics.get(idea_key).map(String::as_str)
    }

    pub fn story_for(&self, epic_key: &str) -> Option<&str> {
        self.stories.get(epic_key).map(String::as_str)
    }
}

/// Load the ledger, returning the default document when the file is missing.
pub fn load_ledger(path: &Path) -> Result<Ledger> {
    if !path.exists() {
        debug!(path = %path.display(), "ledger missing, using default");
        return Ok(Ledger::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
    let instance: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse ledger {}", path.display()))?;
    validate_schema(&instance)?;
    let ledger: Ledger = serde_json::from_str(&contents)
        .with_context(|| format!("parse ledger {} as v1 struct", path.display()))?;
    if ledger.version != LEDGER_VERSION {
        bail!(
            "unsupported ledger version {} (expected {LEDGER_VERSION})",
            ledger.version
        );
    }
    debug!(items = ledger.items.len(), "ledger loaded");
    Ok(ledger)
}

/// Atomically write the ledger to disk (temp sibling + rename).
pub fn write_ledger(path: &Path, ledger: &Ledger) -> Result<()> {
    debug!(path = %path.display(), items = ledger.items.len(), "writing ledger");
    let mut buf = serde_json::to_string_pretty(ledger)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("ledger path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp ledger {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace ledger {}", path.display()))?;
    Ok(())
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(LEDGER_SCHEMA).context("parse ledger schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile ledger schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "ledger schema validation failed:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}

/// Current UTC timestamp in RFC 3339 format, for ledger records.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LedgerEntry {
        LedgerEntry {
            base_commit: "abc123".to_string(),
            changed_paths: vec!["web/a.tsx".to_string()],
            policy: PolicyClass::FrontendOnly,
            budget_used: 1,
            guardrails_passed: true,
            report_path: ".foreman/reports/ST-1.md".to_string(),
            last_verify_failure: None,
            last_comment_fingerprint: None,
            repaired_hash: None,
            updated_at: now_rfc3339(),
        }
    }

    #[test]
    fn missing_ledger_is_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = load_ledger(&temp.path().join("missing.json")).expect("load");
        assert_eq!(ledger, Ledger::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("ledger.json");

        let mut ledger = Ledger::default();
        ledger.epics.insert("X-18".to_string(), "Y-13".to_string());
        ledger.stories.insert("Y-13".to_string(), "ST-1".to_string());
        ledger.items.insert("ST-1".to_string(), entry());

        write_ledger(&path, &ledger).expect("write");
        let loaded = load_ledger(&path).expect("load");
        assert_eq!(loaded, ledger);
        assert_eq!(loaded.epic_for("X-18"), Some("Y-13"));
        assert_eq!(loaded.story_for("Y-13"), Some("ST-1"));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ledger.json");
        fs::write(
            &path,
            "{\"version\": 1, \"epics\": {}, \"stories\": {}, \"items\": {}}",
        )
        .expect("write");
        load_ledger(&path).expect("v1 loads");

        fs::write(&path, "{\"version\": 2, \"epics\": {}, \"stories\": {}}").expect("write");
        assert!(load_ledger(&path).is_err());
    }

    #[test]
    fn corrupt_ledger_fails_schema_validation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ledger.json");
        fs::write(&path, "{\"version\": 1, \"items\": []}").expect("write");
        let err = load_ledger(&path).unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn temp_file_never_replaces_canonical_on_its_own() {
        // A leftover temp file (crash between write and rename) must not
        // affect loads of the canonical path.
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ledger.json");
        let ledger = Ledger::default();
        write_ledger(&path, &ledger).expect("write");
        fs::write(path.with_extension("json.tmp"), "garbage").expect("write tmp");
        let loaded = load_ledger(&path).expect("load");
        assert_eq!(loaded, ledger);
    }
}
