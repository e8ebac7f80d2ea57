//! Configuration types.
//!
//! Watchdog and queue thresholds are fixed constants (their `Default`
//! impls). Deployment paths and operator knobs come from the environment.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Health monitor thresholds.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between watchdog scans.
    pub check_interval: Duration,
    /// No executor activity for this long flags the session as silent.
    pub silence_threshold: Duration,
    /// Number of identical consecutive tool-call fingerprints that count as a loop.
    pub loop_threshold: usize,
    /// How many recent calls the error-cascade heuristic looks at.
    pub error_window: usize,
    /// Errors within `error_window` that count as a cascade.
    pub error_threshold: usize,
    /// Sessions running longer than this are flagged.
    pub duration_ceiling: Duration,
    /// Minimum gap between two alerts for the same session.
    pub alert_cooldown: Duration,
    /// A worker heartbeat older than this means no live loop owns the session.
    pub heartbeat_staleness: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),      // 5 minutes
            silence_threshold: Duration::from_secs(600),   // 10 minutes
            loop_threshold: 5,
            error_window: 20,
            error_threshold: 5,
            duration_ceiling: Duration::from_secs(7200),   // 2 hours
            alert_cooldown: Duration::from_secs(1800),     // 30 minutes
            heartbeat_staleness: Duration::from_secs(180), // 3 minutes
        }
    }
}

/// Worker loop and job store settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Sleep before the single re-poll when the queue looks empty.
    pub drain_guard_delay: Duration,
    /// How often the worker checks the steering mailbox while the executor is quiet.
    pub steering_poll_interval: Duration,
    /// How often the worker writes a liveness heartbeat for its session.
    pub heartbeat_interval: Duration,
    /// Timeout for standard jobs.
    pub standard_timeout: Duration,
    /// Timeout for long-running jobs.
    pub long_running_timeout: Duration,
    /// Resets to Pending allowed before a job is failed outright.
    pub max_attempts: u32,
    /// Attempts for a store call that keeps failing transiently.
    pub store_retry_attempts: u32,
    /// First backoff delay for store retries.
    pub store_retry_base: Duration,
    /// Upper bound on a single store retry delay.
    pub store_retry_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_guard_delay: Duration::from_millis(50),
            steering_poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            standard_timeout: Duration::from_secs(45 * 60),
            long_running_timeout: Duration::from_secs(4 * 3600),
            max_attempts: 3,
            store_retry_attempts: 4,
            store_retry_base: Duration::from_millis(50),
            store_retry_max: Duration::from_secs(2),
        }
    }
}

/// Deployment settings for the relay daemon.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// Repository that work-item workspaces are checked out from.
    pub repo_path: PathBuf,
    /// Directory holding per-work-item worktrees.
    pub worktrees_dir: PathBuf,
    /// Agent CLI invoked for each execution.
    pub agent_program: String,
    /// Arguments passed to the agent CLI on a fresh start.
    pub agent_args: Vec<String>,
    /// Arguments used when resuming an interrupted session. `{session_id}` is substituted.
    pub agent_resume_args: Vec<String>,
    /// Project keys whose workers start with the daemon.
    pub project_keys: Vec<String>,
    pub queue: QueueConfig,
    pub health: HealthConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let repo_path = PathBuf::from(".");
        Self {
            db_path: PathBuf::from("./data/agent-relay.db"),
            log_dir: PathBuf::from("./logs"),
            worktrees_dir: repo_path.join(".worktrees"),
            repo_path,
            agent_program: "claude".to_string(),
            agent_args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            agent_resume_args: vec!["--resume".to_string(), "{session_id}".to_string()],
            project_keys: Vec::new(),
            queue: QueueConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Build from `AGENT_RELAY_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("AGENT_RELAY_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("AGENT_RELAY_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Ok(repo) = std::env::var("AGENT_RELAY_REPO") {
            config.repo_path = PathBuf::from(repo);
            config.worktrees_dir = config.repo_path.join(".worktrees");
        }
        if let Ok(dir) = std::env::var("AGENT_RELAY_WORKTREES") {
            config.worktrees_dir = PathBuf::from(dir);
        }
        if let Ok(program) = std::env::var("AGENT_RELAY_AGENT_CMD") {
            config.agent_program = program;
        }
        if let Ok(args) = std::env::var("AGENT_RELAY_AGENT_ARGS") {
            config.agent_args = args.split_whitespace().map(String::from).collect();
        }
        if let Ok(keys) = std::env::var("AGENT_RELAY_PROJECTS") {
            config.project_keys = split_list(&keys);
        }

        config
    }

    /// Directory holding the database, lock files and crash history.
    pub fn data_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Settings for the external supervisor (`agent-relay supervise`).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Pid file written by the daemon.
    pub pid_file: PathBuf,
    /// Directory of the daemon's rolling log.
    pub log_dir: PathBuf,
    /// Log output older than this counts as a hung process.
    pub log_staleness: Duration,
    /// Directory scanned for leftover `*.lock` files.
    pub lock_dir: PathBuf,
    /// Crash history file appended on every observed death.
    pub crash_history: PathBuf,
    /// Window in which repeated crashes form a crash pattern.
    pub crash_window: Duration,
    /// Crashes within `crash_window` needed for a crash pattern.
    pub crash_count: usize,
    /// A commit younger than this counts as a recent change.
    pub recent_change_window: Duration,
    /// Revert the latest commit on a crash pattern. Off unless opted in.
    pub auto_revert: bool,
    /// TTL of the recovery-in-progress marker.
    pub lock_ttl: Duration,
    /// Interval between supervisor checks.
    pub check_interval: Duration,
    /// Minimum gap between two escalation alerts.
    pub escalation_cooldown: Duration,
    /// Timestamp of the last escalation alert, shared by every supervisor run.
    pub escalation_marker: PathBuf,
    /// Repository to inspect (and revert in) for recent changes.
    pub repo_path: PathBuf,
}

impl SupervisorConfig {
    /// Derive supervisor settings from the relay config plus `AGENT_RELAY_*` overrides.
    pub fn from_relay(relay: &RelayConfig) -> Self {
        let data_dir = relay.data_dir();
        let auto_revert = std::env::var("AGENT_RELAY_AUTO_REVERT")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let log_staleness_secs = std::env::var("AGENT_RELAY_LOG_STALENESS_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(600);

        Self {
            pid_file: data_dir.join("agent-relay.pid"),
            log_dir: relay.log_dir.clone(),
            log_staleness: Duration::from_secs(log_staleness_secs),
            lock_dir: data_dir.clone(),
            crash_history: data_dir.join("crash_history.jsonl"),
            crash_window: Duration::from_secs(600),
            crash_count: 3,
            recent_change_window: Duration::from_secs(1800),
            auto_revert,
            lock_ttl: Duration::from_secs(120),
            check_interval: Duration::from_secs(60),
            escalation_cooldown: Duration::from_secs(600),
            escalation_marker: data_dir.join("last_escalation"),
            repo_path: relay.repo_path.clone(),
        }
    }
}

/// Telegram alert destination.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
}

impl TelegramConfig {
    /// Returns `None` when no bot token is configured.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") else {
            return Ok(None);
        };
        let chat_id = std::env::var("TELEGRAM_ALERT_CHAT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("TELEGRAM_ALERT_CHAT_ID".to_string()))?;
        if chat_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "TELEGRAM_ALERT_CHAT_ID".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(Some(Self {
            bot_token: SecretString::from(token),
            chat_id,
        }))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_defaults_match_watchdog_contract() {
        let cfg = HealthConfig::default();
        assert_eq!(cfg.silence_threshold, Duration::from_secs(600));
        assert_eq!(cfg.loop_threshold, 5);
        assert_eq!(cfg.error_window, 20);
        assert_eq!(cfg.error_threshold, 5);
        assert_eq!(cfg.duration_ceiling, Duration::from_secs(7200));
        assert_eq!(cfg.alert_cooldown, Duration::from_secs(1800));
    }

    #[test]
    fn drain_guard_is_tens_of_millis() {
        let cfg = QueueConfig::default();
        assert!(cfg.drain_guard_delay < Duration::from_millis(100));
        assert!(cfg.long_running_timeout > cfg.standard_timeout);
    }

    #[test]
    fn split_list_trims_and_drops_empty() {
        assert_eq!(split_list(" a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn data_dir_is_db_parent() {
        let cfg = RelayConfig {
            db_path: PathBuf::from("/var/lib/relay/relay.db"),
            ..RelayConfig::default()
        };
        assert_eq!(cfg.data_dir(), PathBuf::from("/var/lib/relay"));
    }
}
