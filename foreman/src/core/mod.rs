//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod fatal;
pub mod fingerprint;
pub mod patch_spec;
pub mod policy;
pub mod scope;
pub mod timeout;
pub mod types;
