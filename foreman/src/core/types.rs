//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// Lifecycle phase for a work item as the orchestrator drives it.
///
/// The forward path is `Intake -> Decompose -> Implement -> Verify ->
/// Complete`. `Blocked` and `HumanAttention` are terminal side states
/// reachable from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    Decompose,
    Implement,
    Verify,
    Complete,
    Blocked,
    HumanAttention,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::Decompose => "decompose",
            Phase::Implement => "implement",
            Phase::Verify => "verify",
            Phase::Complete => "complete",
            Phase::Blocked => "blocked",
            Phase::HumanAttention => "human_attention",
        }
    }
}

/// Terminal outcome of a single agent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Timeout => "timeout",
        }
    }
}

/// Escalation class, used for fingerprinting and dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationClass {
    /// Recoverable guardrail or verification failure. The item stays
    /// eligible for re-evaluation once the underlying cause changes.
    Recoverable,
    /// Known deterministic bug signature in agent output. Halts all further
    /// attempts for the item.
    Fatal,
    /// Retry or verify-cycle exhaustion. Automated remediation is no longer
    /// appropriate.
    AttentionRequired,
}

impl EscalationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationClass::Recoverable => "recoverable",
            EscalationClass::Fatal => "fatal",
            EscalationClass::AttentionRequired => "attention_required",
        }
    }
}
