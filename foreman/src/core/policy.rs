//! Deterministic policy-class derivation for work items.
//!
//! The policy class constrains which root path prefixes a story's diff may
//! touch. Classification is a pure function over labels and description
//! text. When neither source yields an unambiguous class the result is
//! `Undetermined`, which enforcement treats as fail-closed: it is never
//! silently replaced with a default.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Permitted root path prefixes for a story's file changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "kebab-case")]
pub enum PolicyClass {
    FrontendOnly,
    ScriptsOnly,
    AgentOnly,
    BackendOnly { roots: Vec<String> },
    /// No unambiguous class could be derived. Terminal for enforcement.
    Undetermined,
}

impl PolicyClass {
    /// Root prefixes this class permits, or `None` for `Undetermined`.
    pub fn allowed_roots(&self) -> Option<Vec<String>> {
        match self {
            PolicyClass::FrontendOnly => Some(vec!["web/".to_string()]),
            PolicyClass::ScriptsOnly => Some(vec!["scripts/".to_string()]),
            PolicyClass::AgentOnly => Some(vec!["agent/".to_string()]),
            PolicyClass::BackendOnly { roots } => Some(roots.clone()),
            PolicyClass::Undetermined => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyClass::FrontendOnly => "frontend-only",
            PolicyClass::ScriptsOnly => "scripts-only",
            PolicyClass::AgentOnly => "agent-only",
            PolicyClass::BackendOnly { .. } => "backend-only",
            PolicyClass::Undetermined => "undetermined",
        }
    }
}

/// Label prefix carrying an explicit policy class, e.g. `policy:frontend-only`.
pub const POLICY_LABEL_PREFIX: &str = "policy:";

/// Derive the policy class from labels first, then description markers.
///
/// Labels win over description text. Conflicting labels, or a
/// `backend-only` claim without explicit roots, yield `Undetermined`.
pub fn classify(labels: &[String], description: &str) -> PolicyClass {
    let mut from_labels: Vec<&str> = labels
        .iter()
        .filter_map(|label| label.strip_prefix(POLICY_LABEL_PREFIX))
        .collect();
    from_labels.sort_unstable();
    from_labels.dedup();

    match from_labels.as_slice() {
        [] => {}
        [single] => return class_from_name(single, description),
        many => {
            debug!(count = many.len(), "conflicting policy labels");
            return PolicyClass::Undetermined;
        }
    }

    if let Some(marker) = policy_marker(description) {
        return class_from_name(&marker, description);
    }
    PolicyClass::Undetermined
}

/// Extract the `POLICY: <class>` marker line from the description, if any.
fn policy_marker(description: &str) -> Option<String> {
    for line in description.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("POLICY:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

fn class_from_name(name: &str, description: &str) -> PolicyClass {
    // `backend-only` may carry roots inline in the marker, e.g.
    // `POLICY: backend-only server/ db/`.
    let mut parts = name.split_whitespace();
    match parts.next() {
        Some("frontend-only") => PolicyClass::FrontendOnly,
        Some("scripts-only") => PolicyClass::ScriptsOnly,
        Some("agent-only") => PolicyClass::AgentOnly,
        Some("backend-only") => {
            let mut roots: Vec<String> = parts.map(str::to_string).collect();
            if roots.is_empty() {
                roots = backend_roots_marker(description);
            }
            if roots.is_empty() || roots.iter().any(|root| !root.ends_with('/')) {
                return PolicyClass::Undetermined;
            }
            PolicyClass::BackendOnly { roots }
        }
        _ => PolicyClass::Undetermined,
    }
}

/// Extract explicit backend roots from a `POLICY ROOTS:` marker line.
fn backend_roots_marker(description: &str) -> Vec<String> {
    for line in description.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("POLICY ROOTS:") {
            return rest.split_whitespace().map(str::to_string).collect();
        }
    }
    Vec::new()
}
