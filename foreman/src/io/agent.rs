//! Code-generation agent adapter.
//!
//! The [`Agent`] trait decouples orchestration from the agent backend so
//! tests can use scripted agents that edit files without spawning
//! processes. [`SubprocessAgent`] invokes the external CLI agent with a
//! model selector and a bounded timeout, streams its JSONL event stream to
//! a transcript, and maps the run to a single success/failure/timeout
//! outcome plus a redacted transcript artifact.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::AttemptOutcome;
use crate::io::ledger::now_rfc3339;
use crate::io::process::run_supervised;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text fed on stdin.
    pub prompt: String,
    /// Model selector forwarded to the agent.
    pub model: String,
    /// Resolved timeout for this invocation.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Liveness heartbeat interval during silent periods.
    pub heartbeat: Duration,
    /// Directory for transcript artifacts (stream + log).
    pub transcript_dir: PathBuf,
}

/// Result of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub outcome: AttemptOutcome,
    /// Redacted combined output for signature matching and escalation.
    pub output: String,
    /// Path of the persisted transcript log.
    pub transcript_path: PathBuf,
}

/// Abstraction over agent backends.
pub trait Agent {
    fn run(&self, request: &AgentRequest) -> Result<AgentRun>;
}

/// Attempt metadata persisted next to the transcript.
#[derive(Debug, Clone, Serialize)]
struct AttemptMeta<'a> {
    model: &'a str,
    timeout_secs: u64,
    outcome: AttemptOutcome,
    exit_code: Option<i32>,
    timed_out: bool,
    duration_ms: u64,
    stream_events: usize,
    recorded_at: String,
}

/// Agent backed by an external CLI subprocess (e.g. `codex exec`).
pub struct SubprocessAgent {
    /// Command tokens, e.g. `["codex", "exec"]`.
    pub command: Vec<String>,
    /// Credential values scrubbed from persisted transcripts.
    pub scrub_values: Vec<String>,
}

impl Agent for SubprocessAgent {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), model = %request.model))]
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("agent command must be non-empty"))?;
        info!(workdir = %request.workdir.display(), "starting agent subprocess");

        fs::create_dir_all(&request.transcript_dir).with_context(|| {
            format!("create transcript dir {}", request.transcript_dir.display())
        })?;
        let stream_path = request.transcript_dir.join("stream.jsonl");
        let log_path = request.transcript_dir.join("agent.log");
        let meta_path = request.transcript_dir.join("meta.json");
        let started = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..])
            .arg("--model")
            .arg(&request.model)
            .arg("--json")
            .arg("-")
            .current_dir(&request.workdir);

        let output = run_supervised(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            Some(&stream_path),
            Some(request.heartbeat),
        )
        .context("run agent subprocess")?;

        let text = scrub(&output.combined_text(), &self.scrub_values);
        fs::write(&log_path, &text)
            .with_context(|| format!("write agent log {}", log_path.display()))?;
        let stream_events = stream_event_count(&stream_path);
        info!(events = stream_events, "agent stream persisted");

        let outcome = if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            AttemptOutcome::Timeout
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent exited with failure");
            AttemptOutcome::Failure
        } else {
            debug!("agent completed successfully");
            AttemptOutcome::Success
        };

        let meta = AttemptMeta {
            model: &request.model,
            timeout_secs: request.timeout.as_secs(),
            outcome,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
            stream_events,
            recorded_at: now_rfc3339(),
        };
        let mut buf = serde_json::to_string_pretty(&meta).context("serialize attempt meta")?;
        buf.push('\n');
        fs::write(&meta_path, buf)
            .with_context(|| format!("write attempt meta {}", meta_path.display()))?;

        Ok(AgentRun {
            outcome,
            output: text,
            transcript_path: log_path,
        })
    }
}

/// Replace configured secret values with a redaction marker.
fn scrub(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            out = out.replace(secret.as_str(), "[redacted]");
        }
    }
    out
}

/// Count of structured events in a persisted stream, for liveness logging.
pub fn stream_event_count(stream_path: &Path) -> usize {
    fs::read_to_string(stream_path)
        .map(|contents| {
            contents
                .lines()
                .filter(|line| line.trim_start().starts_with('{'))
                .count()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_masks_all_occurrences() {
        let text = "token abc123 used twice: abc123";
        let scrubbed = scrub(text, &["abc123".to_string()]);
        assert_eq!(scrubbed, "token [redacted] used twice: [redacted]");
    }

    #[test]
    fn scrub_ignores_empty_secrets() {
        assert_eq!(scrub("text", &[String::new()]), "text");
    }

    #[test]
    fn stream_event_count_counts_json_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stream.jsonl");
        fs::write(&path, "{\"type\":\"init\"}\nnot json\n{\"type\":\"done\"}\n").expect("write");
        assert_eq!(stream_event_count(&path), 2);
    }

    #[test]
    fn missing_stream_counts_zero() {
        assert_eq!(stream_event_count(Path::new("/nonexistent/stream")), 0);
    }

    #[test]
    fn attempt_meta_is_written_next_to_transcript() {
        let agent = SubprocessAgent {
            command: vec!["sh".to_string(), "-c".to_string(), "echo done".to_string()],
            scrub_values: Vec::new(),
        };
        let temp = tempfile::tempdir().expect("tempdir");
        let request = AgentRequest {
            workdir: temp.path().to_path_buf(),
            prompt: "p".to_string(),
            model: "default".to_string(),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 4096,
            heartbeat: Duration::from_secs(60),
            transcript_dir: temp.path().join("t"),
        };
        let run = agent.run(&request).expect("run");
        assert_eq!(run.outcome, AttemptOutcome::Success);

        let raw = fs::read_to_string(temp.path().join("t").join("meta.json")).expect("meta");
        let meta: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(meta["outcome"], "success");
        assert_eq!(meta["model"], "default");
        assert_eq!(meta["timed_out"], false);
        assert_eq!(meta["exit_code"], 0);
    }

    #[test]
    fn subprocess_agent_requires_command() {
        let agent = SubprocessAgent {
            command: Vec::new(),
            scrub_values: Vec::new(),
        };
        let temp = tempfile::tempdir().expect("tempdir");
        let request = AgentRequest {
            workdir: temp.path().to_path_buf(),
            prompt: "p".to_string(),
            model: "default".to_string(),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 1024,
            heartbeat: Duration::from_secs(60),
            transcript_dir: temp.path().join("t"),
        };
        assert!(agent.run(&request).is_err());
    }
}
