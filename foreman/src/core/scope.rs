//! Pure guardrail evaluation of an authoritative diff against a PatchSpec.
//!
//! Enforcement is fail-closed: an undetermined policy class, a missing
//! scope declaration, or any path outside the declared allow-list blocks
//! the commit. Violating paths are always named explicitly so escalations
//! can surface them verbatim.

use std::fmt;

use crate::core::patch_spec::{GlobPattern, PatchSpec};
use crate::core::policy::PolicyClass;

/// Inputs for a single scope evaluation.
#[derive(Debug, Clone)]
pub struct ScopeInput<'a> {
    /// Authoritative diff paths (repo-relative, sorted).
    pub diff_paths: &'a [String],
    pub spec: &'a PatchSpec,
    /// Default budget when the patch spec declares none.
    pub budget_ceiling: u32,
    /// Explicit human approval marker present on the work item.
    pub budget_approved: bool,
}

/// A single named guardrail violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeViolation {
    MissingScopeDeclaration,
    UndeterminedPolicy,
    InvalidGlob { pattern: String },
    OutOfScope { paths: Vec<String> },
    OutsidePolicyRoots { paths: Vec<String> },
    BudgetExceeded { changed: usize, budget: u32 },
}

impl fmt::Display for ScopeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeViolation::MissingScopeDeclaration => {
                write!(f, "missing ALLOWED FILES declaration")
            }
            ScopeViolation::UndeterminedPolicy => {
                write!(f, "policy class undetermined (fail-closed)")
            }
            ScopeViolation::InvalidGlob { pattern } => {
                write!(f, "invalid ALLOWED NEW FILES pattern: {pattern}")
            }
            ScopeViolation::OutOfScope { paths } => {
                write!(f, "paths outside declared scope: {}", paths.join(", "))
            }
            ScopeViolation::OutsidePolicyRoots { paths } => {
                write!(f, "paths outside policy roots: {}", paths.join(", "))
            }
            ScopeViolation::BudgetExceeded { changed, budget } => {
                write!(f, "budget exceeded: {changed} files changed, budget {budget}")
            }
        }
    }
}

/// Outcome of a scope evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeVerdict {
    pub violations: Vec<ScopeViolation>,
}

impl ScopeVerdict {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable violation summary, one line per violation.
    pub fn describe(&self) -> String {
        self.violations
            .iter()
            .map(ScopeViolation::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Evaluate the diff against the declared scope.
pub fn evaluate(input: &ScopeInput<'_>) -> ScopeVerdict {
    let mut violations = Vec::new();

    if input.spec.policy == PolicyClass::Undetermined {
        violations.push(ScopeViolation::UndeterminedPolicy);
    }
    if input.spec.is_empty() {
        violations.push(ScopeViolation::MissingScopeDeclaration);
        return ScopeVerdict { violations };
    }

    let mut globs = Vec::new();
    for pattern in &input.spec.allowed_new_globs {
        match GlobPattern::compile(pattern) {
            Ok(glob) => globs.push(glob),
            // A declared pattern the engine cannot honor blocks the
            // attempt; silently narrowing scope would hide the typo.
            Err(_) => violations.push(ScopeViolation::InvalidGlob {
                pattern: pattern.clone(),
            }),
        }
    }

    let mut out_of_scope = Vec::new();
    for path in input.diff_paths {
        let allowed = input.spec.allowed_files.iter().any(|file| file == path)
            || globs.iter().any(|glob| glob.matches(path));
        if !allowed {
            out_of_scope.push(path.clone());
        }
    }
    if !out_of_scope.is_empty() {
        violations.push(ScopeViolation::OutOfScope {
            paths: out_of_scope,
        });
    }

    if let Some(roots) = input.spec.policy.allowed_roots() {
        let outside: Vec<String> = input
            .diff_paths
            .iter()
            .filter(|path| !roots.iter().any(|root| path.starts_with(root.as_str())))
            .cloned()
            .collect();
        if !outside.is_empty() {
            violations.push(ScopeViolation::OutsidePolicyRoots { paths: outside });
        }
    }

    let budget = input
        .spec
        .diff_budget
        .unwrap_or(input.budget_ceiling)
        .min(input.budget_ceiling);
    if input.diff_paths.len() > budget as usize && !input.budget_approved {
        violations.push(ScopeViolation::BudgetExceeded {
            changed: input.diff_paths.len(),
            budget,
        });
    }

    ScopeVerdict { violations }
}
