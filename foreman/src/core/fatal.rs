//! Fatal deterministic-bug detection over captured agent output.
//!
//! A small, ordered list of known bug signatures. A match means the same
//! input will fail the same way on every retry, so the orchestrator halts
//! all further attempts for the item and escalates exactly once. The list
//! is evaluated before any generic retry/backoff decision.

/// A known deterministic failure signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalMatcher {
    /// Stable name used in escalation records and comments.
    pub name: &'static str,
    /// Substring matched against the captured output.
    pub needle: &'static str,
}

/// Ordered matchers; the first match wins.
pub const FATAL_MATCHERS: &[FatalMatcher] = &[
    FatalMatcher {
        name: "prompt-template-render",
        needle: "panicked while rendering prompt template",
    },
    FatalMatcher {
        name: "call-stack-overflow",
        needle: "RangeError: Maximum call stack size exceeded",
    },
    FatalMatcher {
        name: "undefined-property-read",
        needle: "TypeError: Cannot read properties of undefined",
    },
    FatalMatcher {
        name: "unknown-model-selector",
        needle: "unknown model selector",
    },
];

/// Classify captured output against the known fatal signatures.
pub fn classify_fatal(output: &str) -> Option<&'static FatalMatcher> {
    FATAL_MATCHERS
        .iter()
        .find(|matcher| output.contains(matcher.needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_signature() {
        let output = "tool log\nRangeError: Maximum call stack size exceeded\n";
        let matched = classify_fatal(output).expect("match");
        assert_eq!(matched.name, "call-stack-overflow");
    }

    #[test]
    fn first_matcher_wins_on_multiple_hits() {
        let output = "panicked while rendering prompt template\n\
                      unknown model selector\n";
        let matched = classify_fatal(output).expect("match");
        assert_eq!(matched.name, "prompt-template-render");
    }

    #[test]
    fn clean_output_matches_nothing() {
        assert!(classify_fatal("All checks passed.").is_none());
    }
}
