//! In-process crash recovery.
//!
//! At boot the session registry is empty, so any Running job was abandoned
//! by a previous process. Startup recovery repairs the status index, puts
//! those jobs back in the queue and parks their sessions. Running it twice
//! on the same store is a no-op the second time.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::HealthConfig;
use crate::error::{Error, JobError, RecoveryError};
use crate::queue::{Job, JobQueue, JobStatus, ResetOutcome};
use crate::session::{SessionStatus, SessionTracker};

/// TTL of the recovery marker taken while startup recovery runs.
const STARTUP_LOCK_TTL: Duration = Duration::from_secs(120);

/// What startup recovery changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Index rows pointing at a missing job or the wrong status.
    pub ghosts_removed: usize,
    /// Unfinished jobs missing from the index, reinserted as Pending.
    pub orphans_reinserted: Vec<Uuid>,
    /// Finished jobs missing from the index, given their row back.
    pub reindexed: usize,
    /// Running jobs put back in the queue.
    pub requeued: Vec<Uuid>,
    /// Running jobs that had used up their attempts.
    pub failed: Vec<Uuid>,
    /// Active sessions parked as Dormant.
    pub sessions_parked: usize,
}

impl RecoveryReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of force-recovering one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    Requeued { job_id: Uuid, attempts: u32 },
    Failed { job_id: Uuid, reason: String },
    AlreadyPending { job_id: Uuid },
    /// Left alone: its worker heartbeat is still fresh.
    Alive { job_id: Uuid, heartbeat_age_secs: u64 },
}

pub struct CrashRecovery {
    queue: JobQueue,
    tracker: SessionTracker,
    health: HealthConfig,
    holder: String,
}

impl CrashRecovery {
    pub fn new(queue: JobQueue, tracker: SessionTracker, health: HealthConfig) -> Self {
        Self {
            queue,
            tracker,
            health,
            holder: format!("startup-{}", std::process::id()),
        }
    }

    /// Repair the index and requeue everything that was Running.
    pub async fn run_startup(&self) -> Result<RecoveryReport, Error> {
        let db = self.queue.db();
        if !db.try_acquire_recovery_lock(&self.holder, STARTUP_LOCK_TTL).await? {
            let (holder, expires_at) = db
                .recovery_lock_holder()
                .await?
                .unwrap_or_else(|| ("unknown".to_string(), Utc::now()));
            return Err(RecoveryError::LockHeld {
                holder,
                expires_at: expires_at.to_rfc3339(),
            }
            .into());
        }

        let result = self.recover().await;

        if let Err(e) = db.release_recovery_lock(&self.holder).await {
            tracing::warn!(error = %e, "Failed to release recovery lock");
        }

        let report = result?;
        if report.is_noop() {
            tracing::info!("Startup recovery: store consistent, nothing to do");
        } else {
            tracing::warn!(
                ghosts = report.ghosts_removed,
                orphans = report.orphans_reinserted.len(),
                reindexed = report.reindexed,
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                sessions = report.sessions_parked,
                "Startup recovery repaired the store"
            );
        }
        Ok(report)
    }

    async fn recover(&self) -> Result<RecoveryReport, Error> {
        let mut report = RecoveryReport::default();
        self.repair_index(&mut report).await?;
        self.requeue_running(&mut report).await?;

        for session in self.tracker.list(SessionStatus::Active).await? {
            self.tracker
                .set_status(&session.session_id, SessionStatus::Dormant)
                .await?;
            report.sessions_parked += 1;
        }
        Ok(report)
    }

    async fn repair_index(&self, report: &mut RecoveryReport) -> Result<(), Error> {
        let db = self.queue.db();
        let jobs: HashMap<Uuid, Job> = db
            .list_all_jobs()
            .await?
            .into_iter()
            .map(|job| (job.id, job))
            .collect();

        let mut indexed: HashSet<Uuid> = HashSet::new();
        for entry in db.list_index_entries().await? {
            let matches = jobs
                .get(&entry.job_id)
                .is_some_and(|job| job.status == entry.status);
            if matches {
                indexed.insert(entry.job_id);
            } else {
                tracing::warn!(job_id = %entry.job_id, status = %entry.status, "Removing ghost index entry");
                if db.remove_index_entry(entry.job_id, entry.status).await? {
                    report.ghosts_removed += 1;
                }
            }
        }

        let mut orphans: Vec<&Job> = jobs.values().filter(|j| !indexed.contains(&j.id)).collect();
        orphans.sort_by_key(|j| j.seq);
        for job in orphans {
            if job.status.is_terminal() {
                self.queue.reindex(job).await?;
                report.reindexed += 1;
            } else {
                self.queue.reinsert_orphan(job).await?;
                report.orphans_reinserted.push(job.id);
            }
        }
        Ok(())
    }

    async fn requeue_running(&self, report: &mut RecoveryReport) -> Result<(), Error> {
        for job in self.queue.list_by_status(JobStatus::Running).await? {
            match self.reset(&job, "interrupted by restart").await? {
                FlushOutcome::Requeued { job_id, .. } => report.requeued.push(job_id),
                FlushOutcome::Failed { job_id, .. } => report.failed.push(job_id),
                FlushOutcome::AlreadyPending { .. } | FlushOutcome::Alive { .. } => {}
            }
        }
        Ok(())
    }

    /// Force-recover every Running job whose worker stopped heartbeating.
    ///
    /// A quiet executor under a live worker is the health monitor's
    /// business, not ours: resetting it here would start a second run while
    /// the first is still going.
    pub async fn flush_stuck(&self) -> Result<Vec<FlushOutcome>, Error> {
        self.flush_stuck_at(Utc::now()).await
    }

    pub async fn flush_stuck_at(&self, now: DateTime<Utc>) -> Result<Vec<FlushOutcome>, Error> {
        let mut outcomes = Vec::new();
        for job in self.queue.list_by_status(JobStatus::Running).await? {
            if self.heartbeat_age(&job, now).await?.is_none() {
                outcomes.push(self.reset(&job, "flushed as stuck").await?);
            }
        }
        if outcomes.is_empty() {
            tracing::info!("No stuck jobs found");
        }
        Ok(outcomes)
    }

    /// Force-recover one job. A Running job whose worker is still
    /// heartbeating is reported as [`FlushOutcome::Alive`] and left alone.
    pub async fn flush_job(&self, job_id: Uuid) -> Result<FlushOutcome, Error> {
        self.flush_job_at(job_id, Utc::now()).await
    }

    pub async fn flush_job_at(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FlushOutcome, Error> {
        let job = self
            .queue
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;

        match job.status {
            JobStatus::Running => match self.heartbeat_age(&job, now).await? {
                Some(age) => {
                    tracing::info!(job_id = %job_id, age_secs = age.as_secs(), "Worker still alive, not flushing");
                    Ok(FlushOutcome::Alive {
                        job_id,
                        heartbeat_age_secs: age.as_secs(),
                    })
                }
                None => self.reset(&job, "flushed by operator").await,
            },
            JobStatus::Pending => Ok(FlushOutcome::AlreadyPending { job_id }),
            status => Err(JobError::InvalidTransition {
                id: job_id,
                state: status.to_string(),
                target: JobStatus::Pending.to_string(),
            }
            .into()),
        }
    }

    /// Age of the job's worker heartbeat while it is within the staleness
    /// limit; `None` when stale or the session record is gone.
    async fn heartbeat_age(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, Error> {
        let Some(session) = self.tracker.get(&job.session_id).await? else {
            return Ok(None);
        };
        if older_than(session.last_heartbeat, now, self.health.heartbeat_staleness) {
            return Ok(None);
        }
        Ok(Some(
            now.signed_duration_since(session.last_heartbeat)
                .to_std()
                .unwrap_or_default(),
        ))
    }

    async fn reset(&self, job: &Job, reason: &str) -> Result<FlushOutcome, Error> {
        let outcome = self.queue.reset_to_pending(job.id, reason).await?;
        let (session_status, flushed) = match &outcome {
            ResetOutcome::Requeued(job) => (
                SessionStatus::Dormant,
                FlushOutcome::Requeued {
                    job_id: job.id,
                    attempts: job.attempts,
                },
            ),
            ResetOutcome::Exhausted(job) => (
                SessionStatus::Failed,
                FlushOutcome::Failed {
                    job_id: job.id,
                    reason: job.error.clone().unwrap_or_default(),
                },
            ),
        };
        self.tracker.set_status(&job.session_id, session_status).await?;
        Ok(flushed)
    }
}

fn older_than(at: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    now.signed_duration_since(at)
        .to_std()
        .is_ok_and(|age| age > limit)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::{JobPayload, Priority};
    use crate::store::{Database, LibSqlBackend};

    struct Fixture {
        db: Arc<dyn Database>,
        queue: JobQueue,
        tracker: SessionTracker,
        recovery: CrashRecovery,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = QueueConfig::default();
        let queue = JobQueue::new(db.clone(), &config);
        let tracker = SessionTracker::new(db.clone(), &config);
        let recovery = CrashRecovery::new(queue.clone(), tracker.clone(), HealthConfig::default());
        Fixture {
            db,
            queue,
            tracker,
            recovery,
        }
    }

    async fn running(fx: &Fixture, session: &str) -> Job {
        let job = fx
            .queue
            .enqueue(Job::new("proj", session, JobPayload::text("work")))
            .await
            .unwrap();
        let job = fx.queue.mark_running(job.id).await.unwrap();
        fx.tracker.activate(&job).await.unwrap();
        job
    }

    async fn pending_ids(fx: &Fixture) -> Vec<Uuid> {
        fx.queue
            .list_by_status(JobStatus::Pending)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect()
    }

    #[tokio::test]
    async fn restart_requeues_running_job_exactly_once() {
        let fx = fixture().await;
        let job = running(&fx, "s1").await;

        let first = fx.recovery.run_startup().await.unwrap();
        assert_eq!(first.requeued, vec![job.id]);
        assert_eq!(first.sessions_parked, 1);

        let recovered = fx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Pending);
        assert_eq!(recovered.attempts, 1);
        assert_eq!(recovered.seq, job.seq);
        let session = fx.tracker.get("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Dormant);

        let pending_after_first = pending_ids(&fx).await;
        let second = fx.recovery.run_startup().await.unwrap();
        assert!(second.is_noop(), "{second:?}");
        assert_eq!(pending_ids(&fx).await, pending_after_first);
        assert_eq!(fx.queue.get(job.id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn index_orphan_is_reinserted_with_high_priority() {
        let fx = fixture().await;
        let job = fx
            .queue
            .enqueue(Job::new("proj", "s1", JobPayload::text("lost")))
            .await
            .unwrap();
        fx.db.remove_index_entry(job.id, JobStatus::Pending).await.unwrap();
        assert!(fx.queue.pop_next("proj").await.unwrap().is_none());

        let report = fx.recovery.run_startup().await.unwrap();
        assert_eq!(report.orphans_reinserted, vec![job.id]);

        let next = fx.queue.pop_next("proj").await.unwrap().unwrap();
        assert_eq!(next.id, job.id);
        assert_eq!(next.priority, Priority::High);
        assert_eq!(fx.db.index_statuses(job.id).await.unwrap(), vec![JobStatus::Pending]);

        assert!(fx.recovery.run_startup().await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn finished_orphan_keeps_its_status() {
        let fx = fixture().await;
        let job = running(&fx, "s1").await;
        fx.queue
            .mark_terminal(job.id, JobStatus::Completed, Some("ok".into()), None)
            .await
            .unwrap();
        fx.tracker.set_status("s1", SessionStatus::Complete).await.unwrap();
        fx.db.remove_index_entry(job.id, JobStatus::Completed).await.unwrap();

        let report = fx.recovery.run_startup().await.unwrap();
        assert_eq!(report.reindexed, 1);
        assert!(report.orphans_reinserted.is_empty());
        assert_eq!(
            fx.db.index_statuses(job.id).await.unwrap(),
            vec![JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn crash_looping_job_is_failed_after_max_attempts() {
        let fx = fixture().await;
        let job = running(&fx, "s1").await;
        for _ in 0..3 {
            fx.recovery.run_startup().await.unwrap();
            fx.queue.mark_running(job.id).await.unwrap();
        }
        let report = fx.recovery.run_startup().await.unwrap();
        assert_eq!(report.failed, vec![job.id]);
        let job = fx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("gave up after 3 attempts"));
    }

    #[tokio::test]
    async fn held_lock_blocks_startup_recovery() {
        let fx = fixture().await;
        assert!(
            fx.db
                .try_acquire_recovery_lock("supervisor", Duration::from_secs(60))
                .await
                .unwrap()
        );
        let err = fx.recovery.run_startup().await.unwrap_err();
        assert!(matches!(err, Error::Recovery(RecoveryError::LockHeld { .. })));
    }

    #[tokio::test]
    async fn flush_stuck_only_touches_stale_jobs() {
        let fx = fixture().await;
        let fresh = running(&fx, "fresh").await;
        let stale = fx
            .queue
            .enqueue(Job::new("other", "stale", JobPayload::text("work")))
            .await
            .unwrap();
        let stale = fx.queue.mark_running(stale.id).await.unwrap();
        fx.tracker.activate(&stale).await.unwrap();
        stale_heartbeat(&fx, "stale").await;

        let outcomes = fx.recovery.flush_stuck().await.unwrap();
        assert_eq!(
            outcomes,
            vec![FlushOutcome::Requeued {
                job_id: stale.id,
                attempts: 1
            }]
        );
        assert_eq!(
            fx.queue.get(fresh.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    async fn stale_heartbeat(fx: &Fixture, session_id: &str) {
        let mut session = fx.tracker.get(session_id).await.unwrap().unwrap();
        session.last_heartbeat = Utc::now() - ChronoDuration::minutes(5);
        fx.db.upsert_session(&session).await.unwrap();
    }

    #[tokio::test]
    async fn silent_executor_under_live_worker_is_not_flushed() {
        let fx = fixture().await;
        let job = running(&fx, "quiet").await;
        let mut session = fx.tracker.get("quiet").await.unwrap().unwrap();
        session.last_activity = Utc::now() - ChronoDuration::hours(2);
        fx.db.upsert_session(&session).await.unwrap();

        assert!(fx.recovery.flush_stuck().await.unwrap().is_empty());
        let kept = fx.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(kept.status, JobStatus::Running);
        assert_eq!(kept.attempts, 0);
    }

    #[tokio::test]
    async fn flush_job_leaves_live_worker_alone() {
        let fx = fixture().await;
        let job = running(&fx, "s1").await;

        let outcome = fx.recovery.flush_job(job.id).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Alive { job_id, .. } if job_id == job.id));
        assert_eq!(
            fx.queue.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
        assert_eq!(
            fx.tracker.get("s1").await.unwrap().unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn flush_job_by_status() {
        let fx = fixture().await;
        let job = running(&fx, "s1").await;
        stale_heartbeat(&fx, "s1").await;
        assert!(matches!(
            fx.recovery.flush_job(job.id).await.unwrap(),
            FlushOutcome::Requeued { .. }
        ));
        assert_eq!(
            fx.recovery.flush_job(job.id).await.unwrap(),
            FlushOutcome::AlreadyPending { job_id: job.id }
        );
        assert!(matches!(
            fx.recovery.flush_job(Uuid::new_v4()).await,
            Err(Error::Job(JobError::NotFound { .. }))
        ));
    }
}
