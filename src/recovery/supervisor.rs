//! External supervisor — watches the daemon from outside and escalates.
//!
//! Each check inspects the process, its log, leftover lock files, the crash
//! history and the repository, then walks an ordered policy table and
//! applies the first matching remediation. A TTL marker in the store keeps
//! two supervisors from remediating at the same time.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::SupervisorConfig;
use crate::error::RecoveryError;
use crate::git::GitRunner;
use crate::notify::{Alert, AlertLevel, Notifier};
use crate::store::Database;

/// Prefix of the daemon's rolling log files.
pub const LOG_FILE_PREFIX: &str = "agent-relay.log";

/// What the supervisor observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Observation {
    /// Pid recorded in the pid file, if any.
    pub pid: Option<u32>,
    pub process_running: bool,
    /// Time since the newest log write.
    pub log_age: Option<Duration>,
    /// Lock files whose owner is gone.
    pub stale_locks: Vec<PathBuf>,
    /// Deaths recorded within the crash window.
    pub recent_crashes: usize,
    /// Time since the repository's last commit.
    pub last_change_age: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    Restart,
    KillAndRestart,
    ClearLocksAndRestart,
    RevertAndRestart,
    Escalate,
}

/// One row of the escalation policy.
pub struct PolicyRule {
    pub name: &'static str,
    pub applies: fn(&Observation, &SupervisorConfig) -> bool,
    pub remediation: Remediation,
}

fn crash_pattern(p: &Observation, c: &SupervisorConfig) -> bool {
    p.recent_crashes >= c.crash_count
}

fn recent_change(p: &Observation, c: &SupervisorConfig) -> bool {
    p.last_change_age
        .is_some_and(|age| age <= c.recent_change_window)
}

fn log_stale(p: &Observation, c: &SupervisorConfig) -> bool {
    p.log_age.is_some_and(|age| age > c.log_staleness)
}

/// Evaluated top to bottom; the first match wins. A crash pattern outranks
/// a plain restart because plain restarts are what produced it.
pub fn default_policy() -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            name: "revert-recent-change",
            applies: |p, c| {
                !p.process_running && crash_pattern(p, c) && recent_change(p, c) && c.auto_revert
            },
            remediation: Remediation::RevertAndRestart,
        },
        PolicyRule {
            name: "crash-pattern",
            applies: |p, c| !p.process_running && crash_pattern(p, c),
            remediation: Remediation::Escalate,
        },
        PolicyRule {
            name: "stale-locks",
            applies: |p, _| !p.process_running && !p.stale_locks.is_empty(),
            remediation: Remediation::ClearLocksAndRestart,
        },
        PolicyRule {
            name: "not-running",
            applies: |p, _| !p.process_running,
            remediation: Remediation::Restart,
        },
        PolicyRule {
            name: "hung",
            applies: |p, c| p.process_running && log_stale(p, c),
            remediation: Remediation::KillAndRestart,
        },
    ]
}

/// First matching rule, or `None` when the daemon looks healthy.
pub fn decide<'a>(
    rules: &'a [PolicyRule],
    observed: &Observation,
    config: &SupervisorConfig,
) -> Option<&'a PolicyRule> {
    rules.iter().find(|rule| (rule.applies)(observed, config))
}

/// Process operations the supervisor needs.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn is_alive(&self, pid: u32) -> bool;

    /// Start the daemon and return its pid.
    async fn start(&self) -> Result<u32, RecoveryError>;

    async fn terminate(&self, pid: u32) -> Result<(), RecoveryError>;
}

/// Controls the real daemon through the `kill` utility and re-exec.
pub struct DaemonControl {
    program: PathBuf,
    args: Vec<String>,
}

impl DaemonControl {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-run this binary with `run`.
    pub fn current_exe() -> Result<Self, RecoveryError> {
        Ok(Self::new(std::env::current_exe()?, vec!["run".to_string()]))
    }

    async fn signal(&self, pid: u32, signal: &str) -> bool {
        Command::new("kill")
            .args([signal, &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success())
    }
}

#[async_trait]
impl ProcessControl for DaemonControl {
    async fn is_alive(&self, pid: u32) -> bool {
        self.signal(pid, "-0").await
    }

    async fn start(&self) -> Result<u32, RecoveryError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RecoveryError::Remediation {
                action: "start".to_string(),
                reason: format!("{}: {e}", self.program.display()),
            })?;
        child.id().ok_or_else(|| RecoveryError::Remediation {
            action: "start".to_string(),
            reason: "daemon exited immediately".to_string(),
        })
    }

    async fn terminate(&self, pid: u32) -> Result<(), RecoveryError> {
        self.signal(pid, "-TERM").await;
        for _ in 0..20 {
            if !self.is_alive(pid).await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        tracing::warn!(pid, "Daemon ignored SIGTERM, killing");
        if self.signal(pid, "-KILL").await {
            Ok(())
        } else {
            Err(RecoveryError::Remediation {
                action: "kill".to_string(),
                reason: format!("could not kill pid {pid}"),
            })
        }
    }
}

/// One observed death of the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub at: DateTime<Utc>,
    pub pid: u32,
}

/// Result of one supervisor pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub observed: Observation,
    pub rule: Option<&'static str>,
    pub remediation: Option<Remediation>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    control: Arc<dyn ProcessControl>,
    notifier: Arc<dyn Notifier>,
    db: Arc<dyn Database>,
    rules: Vec<PolicyRule>,
    holder: String,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        control: Arc<dyn ProcessControl>,
        notifier: Arc<dyn Notifier>,
        db: Arc<dyn Database>,
    ) -> Self {
        Self {
            config,
            control,
            notifier,
            db,
            rules: default_policy(),
            holder: format!("supervisor-{}", std::process::id()),
        }
    }

    /// Check forever on the configured interval.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        loop {
            ticker.tick().await;
            match self.check_once().await {
                Ok(CheckOutcome {
                    rule: Some(rule), ..
                }) => tracing::info!(rule, "Supervisor remediation applied"),
                Ok(_) => tracing::debug!("Daemon healthy"),
                Err(RecoveryError::LockHeld { holder, .. }) => {
                    tracing::info!(holder = %holder, "Recovery already in progress, skipping");
                }
                Err(e) => tracing::error!(error = %e, "Supervisor check failed"),
            }
        }
    }

    pub async fn check_once(&self) -> Result<CheckOutcome, RecoveryError> {
        if !self
            .db
            .try_acquire_recovery_lock(&self.holder, self.config.lock_ttl)
            .await?
        {
            let (holder, expires_at) = self
                .db
                .recovery_lock_holder()
                .await?
                .unwrap_or_else(|| ("unknown".to_string(), Utc::now()));
            return Err(RecoveryError::LockHeld {
                holder,
                expires_at: expires_at.to_rfc3339(),
            });
        }

        let result = self.check_locked().await;
        if let Err(e) = self.db.release_recovery_lock(&self.holder).await {
            tracing::warn!(error = %e, "Failed to release recovery lock");
        }
        result
    }

    async fn check_locked(&self) -> Result<CheckOutcome, RecoveryError> {
        let observed = self.observe().await?;
        let Some(rule) = decide(&self.rules, &observed, &self.config) else {
            return Ok(CheckOutcome {
                observed,
                rule: None,
                remediation: None,
            });
        };

        tracing::warn!(
            rule = rule.name,
            remediation = ?rule.remediation,
            ?observed,
            "Daemon unhealthy"
        );
        let applied = match self.apply(rule.remediation, &observed).await {
            Ok(()) => rule.remediation,
            Err(e) => {
                tracing::error!(rule = rule.name, error = %e, "Remediation failed, escalating");
                self.escalate(&observed, &format!("{} failed: {e}", rule.name))
                    .await?;
                Remediation::Escalate
            }
        };

        Ok(CheckOutcome {
            observed,
            rule: Some(rule.name),
            remediation: Some(applied),
        })
    }

    /// Observe the daemon. Records a crash when the pid file names a dead
    /// process, then removes the pid file so the death is counted once.
    pub async fn observe(&self) -> Result<Observation, RecoveryError> {
        let now = Utc::now();
        let mut observed = Observation {
            pid: read_pid(&self.config.pid_file).await,
            ..Observation::default()
        };

        if let Some(pid) = observed.pid {
            observed.process_running = self.control.is_alive(pid).await;
            if !observed.process_running {
                tracing::warn!(pid, "Daemon is gone, recording crash");
                append_crash(&self.config.crash_history, &CrashRecord { at: now, pid }).await?;
                remove_if_exists(&self.config.pid_file).await?;
            }
        }

        observed.log_age = newest_log_age(&self.config.log_dir).await;
        observed.stale_locks = self.stale_locks().await?;
        observed.recent_crashes = read_crashes(&self.config.crash_history)
            .await?
            .iter()
            .filter(|c| {
                now.signed_duration_since(c.at)
                    .to_std()
                    .is_ok_and(|age| age <= self.config.crash_window)
            })
            .count();
        observed.last_change_age = match GitRunner::new(&self.config.repo_path)
            .last_commit_time()
            .await
        {
            Ok(Some(at)) => now.signed_duration_since(at).to_std().ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Could not read last commit time");
                None
            }
        };

        Ok(observed)
    }

    async fn stale_locks(&self) -> Result<Vec<PathBuf>, RecoveryError> {
        let mut stale = Vec::new();
        let mut dir = match fs::read_dir(&self.config.lock_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stale),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "lock") {
                continue;
            }
            let owner = read_pid(&path).await;
            let alive = match owner {
                Some(pid) => self.control.is_alive(pid).await,
                None => false,
            };
            if !alive {
                stale.push(path);
            }
        }
        stale.sort();
        Ok(stale)
    }

    async fn apply(
        &self,
        remediation: Remediation,
        observed: &Observation,
    ) -> Result<(), RecoveryError> {
        match remediation {
            Remediation::Restart => self.restart().await,
            Remediation::KillAndRestart => {
                if let Some(pid) = observed.pid {
                    self.control.terminate(pid).await?;
                }
                remove_if_exists(&self.config.pid_file).await?;
                self.restart().await
            }
            Remediation::ClearLocksAndRestart => {
                for lock in &observed.stale_locks {
                    tracing::warn!(path = %lock.display(), "Removing stale lock file");
                    remove_if_exists(lock).await?;
                }
                self.restart().await
            }
            Remediation::RevertAndRestart => {
                GitRunner::new(&self.config.repo_path)
                    .revert_head()
                    .await
                    .map_err(|e| RecoveryError::Remediation {
                        action: "revert".to_string(),
                        reason: e.to_string(),
                    })?;
                tracing::warn!(repo = %self.config.repo_path.display(), "Reverted most recent commit");
                self.restart().await
            }
            Remediation::Escalate => {
                self.escalate(observed, "repeated crashes, automatic recovery exhausted")
                    .await
            }
        }
    }

    async fn restart(&self) -> Result<(), RecoveryError> {
        let pid = self.control.start().await?;
        write_pid(&self.config.pid_file, pid).await?;
        tracing::info!(pid, "Daemon started");
        Ok(())
    }

    async fn escalate(&self, observed: &Observation, reason: &str) -> Result<(), RecoveryError> {
        let now = Utc::now();
        if let Some(last) = read_marker(&self.config.escalation_marker).await {
            let quiet = now
                .signed_duration_since(last)
                .to_std()
                .is_ok_and(|gap| gap >= self.config.escalation_cooldown);
            if !quiet {
                tracing::info!(last = %last.to_rfc3339(), reason, "Escalation suppressed by cooldown");
                return Ok(());
            }
        }

        let body = format!(
            "{reason}\nrunning: {}\ncrashes in window: {}\nstale locks: {}\nlast log write: {}",
            observed.process_running,
            observed.recent_crashes,
            observed.stale_locks.len(),
            observed
                .log_age
                .map(|a| format!("{}s ago", a.as_secs()))
                .unwrap_or_else(|| "never".to_string()),
        );
        let alert = Alert::new(AlertLevel::Critical, "agent-relay needs attention", body);
        self.notifier
            .notify(&alert)
            .await
            .map_err(|e| RecoveryError::Remediation {
                action: "escalate".to_string(),
                reason: e.to_string(),
            })?;
        write_marker(&self.config.escalation_marker, now).await
    }
}

async fn read_marker(path: &Path) -> Option<DateTime<Utc>> {
    let raw = fs::read_to_string(path).await.ok()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

async fn write_marker(path: &Path, at: DateTime<Utc>) -> Result<(), RecoveryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, format!("{}\n", at.to_rfc3339())).await?;
    Ok(())
}

async fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).await.ok()?.trim().parse().ok()
}

pub async fn write_pid(path: &Path, pid: u32) -> Result<(), RecoveryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, format!("{pid}\n")).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), RecoveryError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn newest_log_age(log_dir: &Path) -> Option<Duration> {
    let mut dir = fs::read_dir(log_dir).await.ok()?;
    let mut newest: Option<SystemTime> = None;
    while let Ok(Some(entry)) = dir.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
            continue;
        };
        newest = Some(newest.map_or(modified, |n| n.max(modified)));
    }
    newest.map(|t| SystemTime::now().duration_since(t).unwrap_or(Duration::ZERO))
}

async fn append_crash(path: &Path, record: &CrashRecord) -> Result<(), RecoveryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(record).map_err(|e| RecoveryError::Observation {
        what: "crash_history".to_string(),
        reason: e.to_string(),
    })?;
    line.push('\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

pub async fn read_crashes(path: &Path) -> Result<Vec<CrashRecord>, RecoveryError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str(l) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed crash history line");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::RelayConfig;
    use crate::notify::ChannelNotifier;
    use crate::store::LibSqlBackend;

    #[derive(Default)]
    struct FakeState {
        alive: HashSet<u32>,
        started: Vec<u32>,
        terminated: Vec<u32>,
        next_pid: u32,
    }

    #[derive(Default)]
    struct FakeControl {
        state: Mutex<FakeState>,
    }

    impl FakeControl {
        fn with_alive(pids: &[u32]) -> Self {
            let control = Self::default();
            control.state.lock().unwrap().alive.extend(pids);
            control
        }
    }

    #[async_trait]
    impl ProcessControl for FakeControl {
        async fn is_alive(&self, pid: u32) -> bool {
            self.state.lock().unwrap().alive.contains(&pid)
        }

        async fn start(&self) -> Result<u32, RecoveryError> {
            let mut state = self.state.lock().unwrap();
            state.next_pid += 1;
            let pid = 5000 + state.next_pid;
            state.alive.insert(pid);
            state.started.push(pid);
            Ok(pid)
        }

        async fn terminate(&self, pid: u32) -> Result<(), RecoveryError> {
            let mut state = self.state.lock().unwrap();
            state.alive.remove(&pid);
            state.terminated.push(pid);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: SupervisorConfig,
        control: Arc<FakeControl>,
        db: Arc<dyn Database>,
        supervisor: Supervisor,
        alerts: mpsc::UnboundedReceiver<Alert>,
    }

    async fn fixture(control: FakeControl, tweak: impl FnOnce(&mut SupervisorConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let relay = RelayConfig {
            db_path: dir.path().join("data/relay.db"),
            log_dir: dir.path().join("logs"),
            repo_path: dir.path().join("no-repo"),
            ..RelayConfig::default()
        };
        let mut config = SupervisorConfig::from_relay(&relay);
        config.auto_revert = false;
        tweak(&mut config);

        let control = Arc::new(control);
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (notifier, alerts) = ChannelNotifier::new();
        let supervisor = Supervisor::new(
            config.clone(),
            control.clone(),
            Arc::new(notifier),
            db.clone(),
        );
        Fixture {
            _dir: dir,
            config,
            control,
            db,
            supervisor,
            alerts,
        }
    }

    fn status(running: bool) -> Observation {
        Observation {
            pid: Some(1),
            process_running: running,
            ..Observation::default()
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig::from_relay(&RelayConfig::default())
    }

    fn decided(p: &Observation, c: &SupervisorConfig) -> Option<Remediation> {
        decide(&default_policy(), p, c).map(|r| r.remediation)
    }

    #[test]
    fn policy_order() {
        let mut c = config();
        c.auto_revert = false;

        assert_eq!(decided(&status(true), &c), None);
        assert_eq!(decided(&status(false), &c), Some(Remediation::Restart));

        let hung = Observation {
            log_age: Some(c.log_staleness + Duration::from_secs(1)),
            ..status(true)
        };
        assert_eq!(decided(&hung, &c), Some(Remediation::KillAndRestart));

        let locked = Observation {
            stale_locks: vec![PathBuf::from("/tmp/x.lock")],
            ..status(false)
        };
        assert_eq!(decided(&locked, &c), Some(Remediation::ClearLocksAndRestart));

        let crashing = Observation {
            recent_crashes: c.crash_count,
            last_change_age: Some(Duration::from_secs(60)),
            ..locked.clone()
        };
        assert_eq!(decided(&crashing, &c), Some(Remediation::Escalate));

        c.auto_revert = true;
        assert_eq!(decided(&crashing, &c), Some(Remediation::RevertAndRestart));

        // An old commit is not a suspect
        let old_change = Observation {
            last_change_age: Some(c.recent_change_window + Duration::from_secs(1)),
            ..crashing
        };
        assert_eq!(decided(&old_change, &c), Some(Remediation::Escalate));
    }

    #[tokio::test]
    async fn first_start_is_a_plain_restart() {
        let fx = fixture(FakeControl::default(), |_| {}).await;
        let outcome = fx.supervisor.check_once().await.unwrap();
        assert_eq!(outcome.remediation, Some(Remediation::Restart));
        assert_eq!(outcome.observed.recent_crashes, 0);

        let started = fx.control.state.lock().unwrap().started.clone();
        assert_eq!(started.len(), 1);
        assert_eq!(read_pid(&fx.config.pid_file).await, Some(started[0]));

        // Now it is running and healthy
        let outcome = fx.supervisor.check_once().await.unwrap();
        assert_eq!(outcome.remediation, None);
    }

    #[tokio::test]
    async fn repeated_deaths_escalate() {
        let mut fx = fixture(FakeControl::default(), |c| c.crash_count = 3).await;

        for _ in 0..3 {
            let outcome = fx.supervisor.check_once().await.unwrap();
            assert_ne!(outcome.remediation, Some(Remediation::Escalate));
            // The daemon dies right after every start
            let pid = read_pid(&fx.config.pid_file).await.unwrap();
            fx.control.state.lock().unwrap().alive.remove(&pid);
        }
        let outcome = fx.supervisor.check_once().await.unwrap();
        assert_eq!(outcome.observed.recent_crashes, 3);
        assert_eq!(outcome.remediation, Some(Remediation::Escalate));

        let alert = fx.alerts.try_recv().unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
        assert_eq!(read_crashes(&fx.config.crash_history).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn escalation_is_not_repeated_within_cooldown() {
        let mut fx = fixture(FakeControl::default(), |c| c.crash_count = 1).await;
        let now = Utc::now();
        for pid in [11, 12] {
            append_crash(&fx.config.crash_history, &CrashRecord { at: now, pid })
                .await
                .unwrap();
        }

        let first = fx.supervisor.check_once().await.unwrap();
        assert_eq!(first.remediation, Some(Remediation::Escalate));
        assert!(fx.alerts.try_recv().is_ok());

        let second = fx.supervisor.check_once().await.unwrap();
        assert_eq!(second.remediation, Some(Remediation::Escalate));
        assert!(fx.alerts.try_recv().is_err());

        // A fresh supervisor process sees the same marker
        let (notifier, mut alerts) = ChannelNotifier::new();
        let other = Supervisor::new(
            fx.config.clone(),
            fx.control.clone(),
            Arc::new(notifier),
            fx.db.clone(),
        );
        other.check_once().await.unwrap();
        assert!(alerts.try_recv().is_err());

        // Once the cooldown has passed it alerts again
        write_marker(&fx.config.escalation_marker, now - chrono::Duration::hours(1))
            .await
            .unwrap();
        fx.supervisor.check_once().await.unwrap();
        assert!(fx.alerts.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stale_lock_is_cleared_before_restart() {
        let fx = fixture(FakeControl::with_alive(&[42]), |_| {}).await;
        fs::create_dir_all(&fx.config.lock_dir).await.unwrap();
        let stale = fx.config.lock_dir.join("agent-relay.lock");
        let live = fx.config.lock_dir.join("other.lock");
        fs::write(&stale, "999999\n").await.unwrap();
        fs::write(&live, "42\n").await.unwrap();

        let outcome = fx.supervisor.check_once().await.unwrap();
        assert_eq!(outcome.remediation, Some(Remediation::ClearLocksAndRestart));
        assert!(!stale.exists());
        assert!(live.exists());
    }

    #[tokio::test]
    async fn silent_daemon_is_killed_and_restarted() {
        let fx = fixture(FakeControl::with_alive(&[42]), |c| {
            c.log_staleness = Duration::ZERO;
        })
        .await;
        write_pid(&fx.config.pid_file, 42).await.unwrap();
        fs::create_dir_all(&fx.config.log_dir).await.unwrap();
        fs::write(fx.config.log_dir.join("agent-relay.log.2026-01-01"), "old\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = fx.supervisor.check_once().await.unwrap();
        assert_eq!(outcome.remediation, Some(Remediation::KillAndRestart));
        let state = fx.control.state.lock().unwrap();
        assert_eq!(state.terminated, vec![42]);
        assert_eq!(state.started.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_recovery_is_refused() {
        let fx = fixture(FakeControl::default(), |_| {}).await;
        assert!(
            fx.db
                .try_acquire_recovery_lock("someone-else", Duration::from_secs(60))
                .await
                .unwrap()
        );
        assert!(matches!(
            fx.supervisor.check_once().await,
            Err(RecoveryError::LockHeld { .. })
        ));
        assert!(fx.control.state.lock().unwrap().started.is_empty());
    }

    #[tokio::test]
    async fn expired_marker_does_not_block() {
        let fx = fixture(FakeControl::default(), |_| {}).await;
        assert!(
            fx.db
                .try_acquire_recovery_lock("someone-else", Duration::ZERO)
                .await
                .unwrap()
        );
        assert!(fx.supervisor.check_once().await.is_ok());
    }
}
