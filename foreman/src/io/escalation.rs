//! Append-only, deduplicated escalation log.
//!
//! Escalations are keyed by a fingerprint of (failure class, content
//! signature). The same blocking condition never produces a second record,
//! which keeps human-facing noise proportional to distinct failures.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::types::EscalationClass;

/// One persisted escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// `<class>:<content hash>` dedup key.
    pub fingerprint: String,
    pub class: EscalationClass,
    /// Work item the escalation concerns.
    pub item_key: String,
    pub reason: String,
    /// RFC 3339 timestamp.
    pub at: String,
    /// Paths of related artifacts (transcript, report, ledger).
    pub artifacts: Vec<String>,
}

/// Load the escalation log (missing file is an empty log).
pub fn load_escalations(path: &Path) -> Result<Vec<EscalationRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read escalations {}", path.display()))?;
    let records: Vec<EscalationRecord> = serde_json::from_str(&contents)
        .with_context(|| format!("parse escalations {}", path.display()))?;
    Ok(records)
}

/// Append a record unless its fingerprint is already present.
///
/// Returns true when the record was appended (i.e. the condition is new).
pub fn record_once(path: &Path, record: EscalationRecord) -> Result<bool> {
    let mut records = load_escalations(path)?;
    if records
        .iter()
        .any(|existing| existing.fingerprint == record.fingerprint)
    {
        debug!(fingerprint = %record.fingerprint, "escalation already recorded");
        return Ok(false);
    }
    info!(
        fingerprint = %record.fingerprint,
        class = record.class.as_str(),
        item = %record.item_key,
        "recording escalation"
    );
    records.push(record);
    write_atomic(path, &records)?;
    Ok(true)
}

fn write_atomic(path: &Path, records: &[EscalationRecord]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("escalation path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(records)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp escalations {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace escalations {}", path.display()))?;
    Ok(())
}
