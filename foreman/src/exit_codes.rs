//! Stable exit codes for foreman CLI commands.

/// Command succeeded (items may still be verify-pending).
pub const OK: i32 = 0;
/// Command failed due to invalid config, tracker/git errors, or other errors.
pub const INVALID: i32 = 1;
/// A fatal signature blocked an item.
pub const BLOCKED: i32 = 2;
/// Retries exhausted; human attention required.
pub const HUMAN_ATTENTION: i32 = 3;
