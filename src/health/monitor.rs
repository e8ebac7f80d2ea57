//! Watchdog loop over Active sessions.
//!
//! Per session: Healthy → Flagged(severity) → Alerted (cooldown-gated) →
//! Healthy again once activity recovers, or Recovered after an automatic fix.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::HealthConfig;
use crate::error::Error;
use crate::health::heuristics::{self, Severity};
use crate::notify::{Alert, AlertLevel, Notifier};
use crate::queue::{JobQueue, JobStatus, ResetOutcome};
use crate::session::{
    AgentSession, EventKind, SessionEvent, SessionRegistry, SessionStatus, SessionTracker,
};
use crate::worker::Scheduler;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Healthy,
    Flagged(Severity),
    Alerted(Severity),
    Recovered,
}

#[derive(Debug, Clone)]
struct Watch {
    state: WatchState,
    last_alert: Option<DateTime<Utc>>,
}

impl Default for Watch {
    fn default() -> Self {
        Self {
            state: WatchState::Healthy,
            last_alert: None,
        }
    }
}

/// What one scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub checked: usize,
    pub flagged: usize,
    pub alerts_sent: usize,
    pub suppressed: usize,
    pub remediated: Vec<String>,
}

pub struct HealthMonitor {
    queue: JobQueue,
    tracker: SessionTracker,
    registry: Arc<SessionRegistry>,
    scheduler: Option<Arc<Scheduler>>,
    notifier: Arc<dyn Notifier>,
    config: HealthConfig,
    watches: Mutex<HashMap<String, Watch>>,
}

impl HealthMonitor {
    pub fn new(
        queue: JobQueue,
        tracker: SessionTracker,
        registry: Arc<SessionRegistry>,
        notifier: Arc<dyn Notifier>,
        config: HealthConfig,
    ) -> Self {
        Self {
            queue,
            tracker,
            registry,
            scheduler: None,
            notifier,
            config,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Restart workers for jobs the watchdog puts back in the queue.
    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub async fn state_of(&self, session_id: &str) -> Option<WatchState> {
        self.watches.lock().await.get(session_id).map(|w| w.state)
    }

    pub async fn check_once(&self) -> Result<CheckReport, Error> {
        self.check_at(Utc::now()).await
    }

    /// One scan with an explicit clock.
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<CheckReport, Error> {
        let sessions = self.tracker.list(SessionStatus::Active).await?;
        let running = self.queue.list_by_status(JobStatus::Running).await?;
        let mut report = CheckReport::default();

        let mut watches = self.watches.lock().await;
        watches.retain(|sid, _| sessions.iter().any(|s| &s.session_id == sid));

        for session in &sessions {
            report.checked += 1;
            let watch = watches.entry(session.session_id.clone()).or_default();

            let running_job = running.iter().find(|j| j.session_id == session.session_id);
            let owned = self.registry.contains(&session.session_id);
            let worker_gone = !owned && self.heartbeat_stale(session, now);

            if worker_gone {
                let fixed = match running_job {
                    None => self.fail_ownerless(session).await,
                    Some(job) => self.requeue_orphan(session, job.id).await,
                };
                match fixed {
                    Ok(()) => {
                        watch.state = WatchState::Recovered;
                        report.remediated.push(session.session_id.clone());
                    }
                    Err(e) => tracing::error!(
                        session_id = %session.session_id,
                        error = %e,
                        "Watchdog remediation failed"
                    ),
                }
                continue;
            }

            let events = self.trace_tail(&session.session_id).await?;
            let assessment = heuristics::assess(session, &events, &self.config, now);

            let Some(severity) = assessment.severity() else {
                if matches!(watch.state, WatchState::Flagged(_) | WatchState::Alerted(_)) {
                    tracing::info!(session_id = %session.session_id, "Session recovered");
                }
                watch.state = WatchState::Healthy;
                continue;
            };

            report.flagged += 1;
            watch.state = WatchState::Flagged(severity);
            tracing::warn!(
                session_id = %session.session_id,
                severity = ?severity,
                issues = %assessment.summary().replace('\n', " "),
                "Session flagged"
            );

            if !self.cooldown_elapsed(watch.last_alert, now) {
                report.suppressed += 1;
                tracing::debug!(session_id = %session.session_id, "Alert suppressed by cooldown");
                continue;
            }

            let alert = Alert::new(
                match severity {
                    Severity::Warning => AlertLevel::Warning,
                    Severity::Critical => AlertLevel::Critical,
                },
                format!("Session {} may be stuck", session.session_id),
                format!(
                    "project {}\n{}",
                    session.project_key,
                    assessment.summary()
                ),
            )
            .for_session(&session.session_id);

            match self.notifier.notify(&alert).await {
                Ok(()) => {
                    watch.state = WatchState::Alerted(severity);
                    watch.last_alert = Some(now);
                    report.alerts_sent += 1;
                }
                Err(e) => tracing::error!(
                    session_id = %session.session_id,
                    notifier = self.notifier.name(),
                    error = %e,
                    "Failed to deliver alert"
                ),
            }
        }

        Ok(report)
    }

    fn heartbeat_stale(&self, session: &AgentSession, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(session.last_heartbeat)
            .to_std()
            .is_ok_and(|age| age > self.config.heartbeat_staleness)
    }

    /// Enough tool calls for the loop check and enough tool results for the
    /// cascade check, however much other output sits between them.
    async fn trace_tail(&self, session_id: &str) -> Result<Vec<SessionEvent>, Error> {
        let mut events = self
            .tracker
            .recent_events_of_kind(session_id, EventKind::ToolCall, self.config.loop_threshold * 2)
            .await?;
        events.extend(
            self.tracker
                .recent_events_of_kind(session_id, EventKind::ToolResult, self.config.error_window)
                .await?,
        );
        Ok(events)
    }

    fn cooldown_elapsed(&self, last_alert: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_alert {
            None => true,
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .is_ok_and(|gap| gap >= self.config.alert_cooldown),
        }
    }

    /// Active with nothing running it: the job already finished but the
    /// session was never closed.
    async fn fail_ownerless(&self, session: &AgentSession) -> Result<(), Error> {
        tracing::warn!(session_id = %session.session_id, "Active session has no running job, marking failed");
        self.tracker
            .set_status(&session.session_id, SessionStatus::Failed)
            .await?;
        Ok(())
    }

    /// A Running job whose worker is gone goes back in the queue.
    async fn requeue_orphan(&self, session: &AgentSession, job_id: uuid::Uuid) -> Result<(), Error> {
        let outcome = self.queue.reset_to_pending(job_id, "worker lost").await?;
        let status = match outcome {
            ResetOutcome::Requeued(_) => SessionStatus::Dormant,
            ResetOutcome::Exhausted(_) => SessionStatus::Failed,
        };
        self.tracker.set_status(&session.session_id, status).await?;

        if let (ResetOutcome::Requeued(job), Some(scheduler)) = (&outcome, &self.scheduler) {
            scheduler.ensure_worker(&job.project_key).await;
        }
        Ok(())
    }
}

/// Spawn the watchdog background task.
pub fn spawn_health_monitor(
    monitor: Arc<HealthMonitor>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match monitor.check_once().await {
                Ok(report) if report.flagged > 0 || !report.remediated.is_empty() => {
                    tracing::info!(
                        checked = report.checked,
                        flagged = report.flagged,
                        alerts = report.alerts_sent,
                        remediated = report.remediated.len(),
                        "Health check finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Health check failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::QueueConfig;
    use crate::notify::ChannelNotifier;
    use crate::queue::{Job, JobPayload};
    use crate::store::{Database, LibSqlBackend};

    struct Fixture {
        monitor: HealthMonitor,
        db: Arc<dyn Database>,
        queue: JobQueue,
        tracker: SessionTracker,
        registry: Arc<SessionRegistry>,
        alerts: mpsc::UnboundedReceiver<Alert>,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = QueueConfig::default();
        let queue = JobQueue::new(db.clone(), &config);
        let tracker = SessionTracker::new(db.clone(), &config);
        let registry = Arc::new(SessionRegistry::new());
        let (notifier, alerts) = ChannelNotifier::new();
        let monitor = HealthMonitor::new(
            queue.clone(),
            tracker.clone(),
            registry.clone(),
            Arc::new(notifier),
            HealthConfig::default(),
        );
        Fixture {
            monitor,
            db,
            queue,
            tracker,
            registry,
            alerts,
        }
    }

    /// A Running job with an Active, registered session.
    async fn running_session(fx: &Fixture, session_id: &str) -> Job {
        let job = fx
            .queue
            .enqueue(Job::new("proj", session_id, JobPayload::text("work")))
            .await
            .unwrap();
        let job = fx.queue.mark_running(job.id).await.unwrap();
        fx.tracker.activate(&job).await.unwrap();
        job
    }

    async fn age_activity(fx: &Fixture, session_id: &str, by: ChronoDuration) {
        let mut session = fx.tracker.get(session_id).await.unwrap().unwrap();
        session.last_activity = Utc::now() - by;
        fx.db.upsert_session(&session).await.unwrap();
    }

    #[tokio::test]
    async fn healthy_session_stays_quiet() {
        let mut fx = fixture().await;
        let job = running_session(&fx, "s1").await;
        let _reg = fx.registry.register("s1", job.id, "proj");

        let report = fx.monitor.check_once().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.flagged, 0);
        assert_eq!(fx.monitor.state_of("s1").await, Some(WatchState::Healthy));
        assert!(fx.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_detection_alerts_once_within_cooldown() {
        let mut fx = fixture().await;
        let job = running_session(&fx, "s1").await;
        let _reg = fx.registry.register("s1", job.id, "proj");
        age_activity(&fx, "s1", ChronoDuration::minutes(15)).await;

        let now = Utc::now();
        let first = fx.monitor.check_at(now).await.unwrap();
        let second = fx
            .monitor
            .check_at(now + ChronoDuration::minutes(5))
            .await
            .unwrap();

        assert_eq!(first.alerts_sent, 1);
        assert_eq!(second.alerts_sent, 0);
        assert_eq!(second.suppressed, 1);

        let alert = fx.alerts.try_recv().unwrap();
        assert_eq!(alert.level, AlertLevel::Warning);
        assert_eq!(alert.session_id.as_deref(), Some("s1"));
        assert!(fx.alerts.try_recv().is_err());
        assert_eq!(
            fx.monitor.state_of("s1").await,
            Some(WatchState::Flagged(Severity::Warning))
        );

        // Past the cooldown the same issue alerts again
        let third = fx
            .monitor
            .check_at(now + ChronoDuration::minutes(31))
            .await
            .unwrap();
        assert_eq!(third.alerts_sent, 1);
    }

    #[tokio::test]
    async fn error_cascade_is_seen_through_chatty_output() {
        let mut fx = fixture().await;
        let job = running_session(&fx, "s1").await;
        let _reg = fx.registry.register("s1", job.id, "proj");

        // Errors sit in the oldest results, each result buried under output
        for i in 0..20 {
            fx.tracker
                .record(SessionEvent::tool_call("s1", "bash", serde_json::json!({"step": i})))
                .await
                .unwrap();
            fx.tracker
                .record(SessionEvent::tool_result("s1", "bash", "ran", i < 6))
                .await
                .unwrap();
            for line in 0..5 {
                fx.tracker
                    .record(SessionEvent::output("s1", format!("log line {line}")))
                    .await
                    .unwrap();
            }
        }

        let report = fx.monitor.check_once().await.unwrap();
        assert_eq!(report.flagged, 1);
        let alert = fx.alerts.try_recv().unwrap();
        assert_eq!(alert.level, AlertLevel::Warning);
        assert!(alert.body.contains("6 errors in the last 20 tool results"), "{}", alert.body);
    }

    #[tokio::test]
    async fn two_issues_are_critical() {
        let mut fx = fixture().await;
        let job = running_session(&fx, "s1").await;
        let _reg = fx.registry.register("s1", job.id, "proj");
        let mut session = fx.tracker.get("s1").await.unwrap().unwrap();
        session.last_activity = Utc::now() - ChronoDuration::minutes(20);
        session.started_at = Utc::now() - ChronoDuration::hours(3);
        fx.db.upsert_session(&session).await.unwrap();

        fx.monitor.check_once().await.unwrap();
        assert_eq!(fx.alerts.try_recv().unwrap().level, AlertLevel::Critical);
        assert_eq!(
            fx.monitor.state_of("s1").await,
            Some(WatchState::Alerted(Severity::Critical))
        );
    }

    #[tokio::test]
    async fn orphaned_running_job_is_requeued() {
        let mut fx = fixture().await;
        let job = running_session(&fx, "s1").await;
        // No registry entry and a heartbeat from long ago: nobody owns it
        let mut session = fx.tracker.get("s1").await.unwrap().unwrap();
        session.last_heartbeat = Utc::now() - ChronoDuration::minutes(10);
        fx.db.upsert_session(&session).await.unwrap();

        let report = fx.monitor.check_once().await.unwrap();
        assert_eq!(report.remediated, vec!["s1".to_string()]);

        let job = fx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        let session = fx.tracker.get("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Dormant);
        assert!(fx.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn ownerless_active_session_is_failed() {
        let fx = fixture().await;
        let job = running_session(&fx, "s1").await;
        fx.queue
            .mark_terminal(job.id, JobStatus::Completed, Some("done".into()), None)
            .await
            .unwrap();
        let mut session = fx.tracker.get("s1").await.unwrap().unwrap();
        session.last_heartbeat = Utc::now() - ChronoDuration::minutes(10);
        fx.db.upsert_session(&session).await.unwrap();

        fx.monitor.check_once().await.unwrap();
        let session = fx.tracker.get("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn fresh_heartbeat_protects_unregistered_session() {
        let fx = fixture().await;
        let job = running_session(&fx, "s1").await;

        let report = fx.monitor.check_once().await.unwrap();
        assert!(report.remediated.is_empty());
        assert_eq!(
            fx.queue.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }
}
