//! Engine configuration from the environment.
//!
//! The whole configuration surface is environment variables so the engine
//! can run unattended in CI or a service unit. Missing values fall back to
//! conservative defaults; `validate()` rejects configurations the engine
//! cannot run safely with.

use std::env;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::timeout::{DEFAULT_AGENT_TIMEOUT_SECS, TIMEOUT_CEILING_SECS};

/// Executables the agent command may start with.
const AGENT_COMMAND_ALLOWLIST: &[&str] = &["codex", "claude", "opencode"];

/// Engine configuration (environment-driven).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Issue tracker REST endpoint, e.g. `https://example.atlassian.net`.
    pub tracker_base_url: String,
    pub tracker_user: String,
    pub tracker_token: String,
    /// Integration branch the authoritative diff is computed against.
    pub integration_branch: String,
    /// Agent subprocess command tokens, e.g. `["codex", "exec"]`.
    pub agent_command: Vec<String>,
    /// Model selector forwarded to the agent.
    pub agent_model: String,
    /// Hard-coded default agent timeout.
    pub default_timeout_secs: u64,
    /// Ceiling applied to per-item timeout markers.
    pub timeout_ceiling_secs: u64,
    /// Environment-level timeout override, if set.
    pub env_timeout_secs: Option<u64>,
    /// Maximum `IMPLEMENT` attempts per work item.
    pub max_attempts: u32,
    /// Default diff budget (file count) when a story declares none.
    pub budget_ceiling: u32,
    /// Interval for liveness heartbeat log events during agent runs.
    pub heartbeat_secs: u64,
    /// Truncate captured agent output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Cooldown between verification re-attempts for an unchanged report.
    pub verify_cooldown_secs: u64,
    /// Push commits to the remote after a successful commit.
    pub push_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tracker_base_url: String::new(),
            tracker_user: String::new(),
            tracker_token: String::new(),
            integration_branch: "main".to_string(),
            agent_command: vec!["codex".to_string(), "exec".to_string()],
            agent_model: "default".to_string(),
            default_timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
            timeout_ceiling_secs: TIMEOUT_CEILING_SECS,
            env_timeout_secs: None,
            max_attempts: 3,
            budget_ceiling: 15,
            heartbeat_secs: 60,
            output_limit_bytes: 1_000_000,
            verify_cooldown_secs: 10 * 60,
            push_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Read configuration from `FOREMAN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let cfg = Self {
            tracker_base_url: env_string("FOREMAN_TRACKER_URL", &defaults.tracker_base_url),
            tracker_user: env_string("FOREMAN_TRACKER_USER", &defaults.tracker_user),
            tracker_token: env_string("FOREMAN_TRACKER_TOKEN", &defaults.tracker_token),
            integration_branch: env_string("FOREMAN_BRANCH", &defaults.integration_branch),
            agent_command: env_command("FOREMAN_AGENT_CMD", &defaults.agent_command),
            agent_model: env_string("FOREMAN_MODEL", &defaults.agent_model),
            default_timeout_secs: env_parse(
                "FOREMAN_DEFAULT_TIMEOUT_SECS",
                defaults.default_timeout_secs,
            )?,
            timeout_ceiling_secs: env_parse(
                "FOREMAN_TIMEOUT_CEILING_SECS",
                defaults.timeout_ceiling_secs,
            )?,
            env_timeout_secs: env_parse_opt("FOREMAN_AGENT_TIMEOUT_SECS")?,
            max_attempts: env_parse("FOREMAN_MAX_ATTEMPTS", defaults.max_attempts)?,
            budget_ceiling: env_parse("FOREMAN_BUDGET_CEILING", defaults.budget_ceiling)?,
            heartbeat_secs: env_parse("FOREMAN_HEARTBEAT_SECS", defaults.heartbeat_secs)?,
            output_limit_bytes: env_parse(
                "FOREMAN_OUTPUT_LIMIT_BYTES",
                defaults.output_limit_bytes,
            )?,
            verify_cooldown_secs: env_parse(
                "FOREMAN_VERIFY_COOLDOWN_SECS",
                defaults.verify_cooldown_secs,
            )?,
            push_enabled: env::var("FOREMAN_PUSH").map(|v| v == "1").unwrap_or(false),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.budget_ceiling == 0 {
            return Err(anyhow!("budget_ceiling must be > 0"));
        }
        if self.default_timeout_secs == 0 || self.timeout_ceiling_secs == 0 {
            return Err(anyhow!("timeout seconds must be > 0"));
        }
        if self.heartbeat_secs == 0 {
            return Err(anyhow!("heartbeat_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        let Some(first) = self.agent_command.first() else {
            return Err(anyhow!("agent command must be non-empty"));
        };
        let program = first.rsplit('/').next().unwrap_or(first);
        if !AGENT_COMMAND_ALLOWLIST.contains(&program) {
            return Err(anyhow!(
                "agent command '{program}' not in allow-list {AGENT_COMMAND_ALLOWLIST:?}"
            ));
        }
        Ok(())
    }

    pub fn verify_cooldown(&self) -> Duration {
        Duration::from_secs(self.verify_cooldown_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Credential values scrubbed from persisted transcripts.
    pub fn secret_values(&self) -> Vec<String> {
        [&self.tracker_token, &self.tracker_user]
            .into_iter()
            .filter(|value| !value.is_empty())
            .cloned()
            .collect()
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_command(key: &str, default: &[String]) -> Vec<String> {
    match env::var(key) {
        Ok(value) => value.split_whitespace().map(str::to_string).collect(),
        Err(_) => default.to_vec(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid value for {key}: '{value}'")),
        Err(_) => Ok(default),
    }
}

fn env_parse_opt<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("invalid value for {key}: '{value}'")),
        Err(_) => Ok(None),
    }
}
