//! Agent timeout resolution.
//!
//! Priority order: explicit per-invocation override, per-item
//! `AGENT-TIMEOUT-MINUTES: n` marker (clamped to the ceiling regardless of
//! its stated value), environment-level override, hard-coded default.

use std::time::Duration;

/// Hard-coded default when nothing else is configured.
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 60 * 60;

/// Ceiling applied to per-item markers.
pub const TIMEOUT_CEILING_SECS: u64 = 4 * 60 * 60;

const MARKER_PREFIX: &str = "AGENT-TIMEOUT-MINUTES:";

/// Resolve the effective timeout for one agent invocation.
pub fn resolve_timeout(
    override_secs: Option<u64>,
    description: &str,
    env_secs: Option<u64>,
    default_secs: u64,
    ceiling_secs: u64,
) -> Duration {
    if let Some(secs) = override_secs {
        return Duration::from_secs(secs);
    }
    if let Some(minutes) = timeout_marker_minutes(description) {
        let secs = minutes.saturating_mul(60).min(ceiling_secs);
        return Duration::from_secs(secs);
    }
    if let Some(secs) = env_secs {
        return Duration::from_secs(secs);
    }
    Duration::from_secs(default_secs)
}

fn timeout_marker_minutes(description: &str) -> Option<u64> {
    for line in description.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(MARKER_PREFIX) {
            return rest.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_beats_everything() {
        let got = resolve_timeout(
            Some(30),
            "AGENT-TIMEOUT-MINUTES: 10\n",
            Some(99),
            DEFAULT_AGENT_TIMEOUT_SECS,
            TIMEOUT_CEILING_SECS,
        );
        assert_eq!(got, Duration::from_secs(30));
    }

    #[test]
    fn marker_beats_env_and_default() {
        let got = resolve_timeout(
            None,
            "context\nAGENT-TIMEOUT-MINUTES: 10\n",
            Some(99),
            DEFAULT_AGENT_TIMEOUT_SECS,
            TIMEOUT_CEILING_SECS,
        );
        assert_eq!(got, Duration::from_secs(600));
    }

    #[test]
    fn marker_is_clamped_to_ceiling() {
        let got = resolve_timeout(
            None,
            "AGENT-TIMEOUT-MINUTES: 100000\n",
            None,
            DEFAULT_AGENT_TIMEOUT_SECS,
            TIMEOUT_CEILING_SECS,
        );
        assert_eq!(got, Duration::from_secs(TIMEOUT_CEILING_SECS));
    }

    #[test]
    fn env_beats_default() {
        let got = resolve_timeout(None, "", Some(120), DEFAULT_AGENT_TIMEOUT_SECS, TIMEOUT_CEILING_SECS);
        assert_eq!(got, Duration::from_secs(120));
    }

    #[test]
    fn falls_back_to_default() {
        let got = resolve_timeout(None, "", None, DEFAULT_AGENT_TIMEOUT_SECS, TIMEOUT_CEILING_SECS);
        assert_eq!(got, Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS));
    }

    #[test]
    fn malformed_marker_is_ignored() {
        let got = resolve_timeout(
            None,
            "AGENT-TIMEOUT-MINUTES: soon\n",
            None,
            DEFAULT_AGENT_TIMEOUT_SECS,
            TIMEOUT_CEILING_SECS,
        );
        assert_eq!(got, Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS));
    }
}
