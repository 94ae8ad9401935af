//! Autonomous work-orchestration engine.
//!
//! Foreman drives a tracker backlog end to end: each open Idea is
//! decomposed into a canonical Epic and Story, implemented by an external
//! code-generation agent inside hard scope guardrails, committed, then
//! verified against the durable run ledger before the item completes. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (policy classification, scope
//!   evaluation, patch-spec parsing, timeout resolution). No I/O, fully
//!   testable in isolation.
//! - **[`io`]**: Side-effecting operations (tracker HTTP, git, agent
//!   subprocess, ledger persistence). Isolated to enable mocking in tests.
//!
//! Orchestration modules ([`orchestrator`], [`looping`], [`lineage`],
//! [`guardrails`], [`verify`]) coordinate core logic with I/O to implement
//! CLI commands.

pub mod core;
pub mod exit_codes;
pub mod guardrails;
pub mod io;
pub mod lineage;
pub mod logging;
pub mod looping;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
