//! Durable job store — status transitions over the `Database` trait.
//!
//! Every status change reads the current record, checks the transition, and
//! hands the updated copy to [`Database::recreate_job`], which swaps the old
//! record and index row for the new ones in one transaction. Nothing here
//! updates a job in place.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::JobError;
use crate::queue::model::{Job, JobStatus, Priority};
use crate::store::{Database, KeyCounts, RetryPolicy, with_retry};

/// Outcome of putting an interrupted job back in the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ResetOutcome {
    /// The job is Pending again.
    Requeued(Job),
    /// The job ran out of attempts and was failed instead.
    Exhausted(Job),
}

impl ResetOutcome {
    pub fn job(&self) -> &Job {
        match self {
            Self::Requeued(job) | Self::Exhausted(job) => job,
        }
    }
}

/// Queue operations shared by intake, workers, the watchdog and recovery.
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<dyn Database>,
    retry: RetryPolicy,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(db: Arc<dyn Database>, config: &QueueConfig) -> Self {
        Self {
            db,
            retry: RetryPolicy::from_config(config),
            max_attempts: config.max_attempts,
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Append a new Pending job. Returns the stored job with its sequence number.
    pub async fn enqueue(&self, job: Job) -> Result<Job, JobError> {
        if job.status != JobStatus::Pending {
            return Err(JobError::InvalidTransition {
                id: job.id,
                state: job.status.to_string(),
                target: JobStatus::Pending.to_string(),
            });
        }
        let stored = with_retry(&self.retry, "insert_job", || self.db.insert_job(&job)).await?;
        tracing::info!(
            job_id = %stored.id,
            project_key = %stored.project_key,
            session_id = %stored.session_id,
            priority = ?stored.priority,
            "Job enqueued"
        );
        Ok(stored)
    }

    /// Highest-priority, oldest Pending job for `project_key`. Does not claim it.
    pub async fn pop_next(&self, project_key: &str) -> Result<Option<Job>, JobError> {
        Ok(with_retry(&self.retry, "next_pending_job", || {
            self.db.next_pending_job(project_key)
        })
        .await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        Ok(with_retry(&self.retry, "get_job", || self.db.get_job(id)).await?)
    }

    /// Claim a Pending job. Fails with `InvalidTransition` if someone else
    /// moved it first.
    pub async fn mark_running(&self, job_id: Uuid) -> Result<Job, JobError> {
        self.transition(job_id, JobStatus::Running, |job| {
            job.started_at = Some(Utc::now());
            job.finished_at = None;
        })
        .await
    }

    /// Finish a Running job as Completed or Failed.
    pub async fn mark_terminal(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<Job, JobError> {
        if !status.is_terminal() {
            return Err(JobError::InvalidTransition {
                id: job_id,
                state: "any".to_string(),
                target: status.to_string(),
            });
        }
        self.transition_from(job_id, Some(JobStatus::Running), status, move |job| {
            job.finished_at = Some(Utc::now());
            job.result = result.clone();
            job.error = error.clone();
        })
        .await
    }

    /// Put a Running job back in the queue, or fail it once it has used up
    /// its attempts.
    pub async fn reset_to_pending(&self, job_id: Uuid, reason: &str) -> Result<ResetOutcome, JobError> {
        let current = self
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;

        if current.attempts >= self.max_attempts {
            let reason = format!(
                "{reason}; gave up after {} attempts",
                current.attempts
            );
            let failed = self
                .transition(job_id, JobStatus::Failed, move |job| {
                    job.finished_at = Some(Utc::now());
                    job.error = Some(reason.clone());
                })
                .await?;
            tracing::warn!(
                job_id = %job_id,
                attempts = failed.attempts,
                "Job exhausted its attempts, marked failed"
            );
            return Ok(ResetOutcome::Exhausted(failed));
        }

        let requeued = self
            .transition(job_id, JobStatus::Pending, |job| {
                job.attempts += 1;
                job.started_at = None;
            })
            .await?;
        tracing::info!(
            job_id = %job_id,
            project_key = %requeued.project_key,
            attempts = requeued.attempts,
            reason,
            "Job reset to pending"
        );
        Ok(ResetOutcome::Requeued(requeued))
    }

    /// Reinsert a job that is in the primary set but missing from the status
    /// index. It comes back Pending with High priority.
    pub async fn reinsert_orphan(&self, job: &Job) -> Result<Job, JobError> {
        let mut updated = job.clone();
        updated.status = JobStatus::Pending;
        updated.priority = Priority::High;
        updated.started_at = None;
        updated.finished_at = None;

        let swapped = with_retry(&self.retry, "reinsert_orphan", || {
            self.db.recreate_job(job.status, &updated)
        })
        .await?;
        if !swapped {
            return Err(JobError::InvalidTransition {
                id: job.id,
                state: "changed concurrently".to_string(),
                target: JobStatus::Pending.to_string(),
            });
        }
        tracing::warn!(job_id = %job.id, previous = %job.status, "Orphaned job reinserted as pending");
        Ok(updated)
    }

    /// Rewrite a finished job's record so it gets its status index row back.
    /// Its status and fields are unchanged.
    pub async fn reindex(&self, job: &Job) -> Result<(), JobError> {
        let swapped = with_retry(&self.retry, "reindex", || self.db.recreate_job(job.status, job)).await?;
        if !swapped {
            return Err(JobError::InvalidTransition {
                id: job.id,
                state: "changed concurrently".to_string(),
                target: job.status.to_string(),
            });
        }
        tracing::warn!(job_id = %job.id, status = %job.status, "Restored missing index entry");
        Ok(())
    }

    /// Jobs currently listed under `status`, in pop order.
    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobError> {
        Ok(with_retry(&self.retry, "list_jobs_by_status", || {
            self.db.list_jobs_by_status(status, None)
        })
        .await?)
    }

    pub async fn list_by_status_for_key(
        &self,
        status: JobStatus,
        project_key: &str,
    ) -> Result<Vec<Job>, JobError> {
        Ok(with_retry(&self.retry, "list_jobs_by_status", || {
            self.db.list_jobs_by_status(status, Some(project_key))
        })
        .await?)
    }

    /// Pending/running counts per project key.
    pub async fn counts_by_key(&self) -> Result<Vec<KeyCounts>, JobError> {
        Ok(with_retry(&self.retry, "count_jobs_by_key", || self.db.count_jobs_by_key()).await?)
    }

    /// Drop terminal jobs and stale activity traces older than `keep_days`.
    /// Returns (jobs removed, events removed).
    pub async fn prune_finished(&self, keep_days: u32) -> Result<(usize, usize), JobError> {
        let jobs = self.db.prune_finished_jobs(keep_days).await?;
        let events = self.db.prune_session_events(keep_days).await?;
        if jobs > 0 || events > 0 {
            tracing::info!(jobs, events, keep_days, "Pruned finished work");
        }
        Ok((jobs, events))
    }

    async fn transition<F>(&self, job_id: Uuid, target: JobStatus, apply: F) -> Result<Job, JobError>
    where
        F: Fn(&mut Job),
    {
        self.transition_from(job_id, None, target, apply).await
    }

    /// Like `transition`, but only out of `from` when given.
    async fn transition_from<F>(
        &self,
        job_id: Uuid,
        from: Option<JobStatus>,
        target: JobStatus,
        apply: F,
    ) -> Result<Job, JobError>
    where
        F: Fn(&mut Job),
    {
        let current = self
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;

        let expected = from.is_none_or(|from| from == current.status);
        if !expected || !current.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: job_id,
                state: current.status.to_string(),
                target: target.to_string(),
            });
        }

        let mut updated = current.clone();
        updated.status = target;
        apply(&mut updated);

        let swapped = with_retry(&self.retry, "recreate_job", || {
            self.db.recreate_job(current.status, &updated)
        })
        .await?;
        if !swapped {
            // Someone else moved it between our read and the swap
            return Err(JobError::InvalidTransition {
                id: job_id,
                state: "changed concurrently".to_string(),
                target: target.to_string(),
            });
        }

        tracing::debug!(job_id = %job_id, from = %current.status, to = %target, "Job transitioned");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::JobPayload;
    use crate::store::LibSqlBackend;

    async fn test_queue() -> JobQueue {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        JobQueue::new(db, &QueueConfig::default())
    }

    fn job(key: &str, text: &str) -> Job {
        Job::new(key, "s1", JobPayload::text(text))
    }

    async fn assert_single_index(queue: &JobQueue, id: Uuid, status: JobStatus) {
        assert_eq!(queue.db().index_statuses(id).await.unwrap(), vec![status]);
    }

    #[tokio::test]
    async fn high_priority_pops_before_normal() {
        let queue = test_queue().await;
        let a = queue
            .enqueue(job("proj1", "A").with_priority(Priority::High))
            .await
            .unwrap();
        let b = queue.enqueue(job("proj1", "B")).await.unwrap();

        let first = queue.pop_next("proj1").await.unwrap().unwrap();
        assert_eq!(first.id, a.id);
        queue.mark_running(first.id).await.unwrap();
        queue
            .mark_terminal(first.id, JobStatus::Completed, Some("ok".into()), None)
            .await
            .unwrap();

        let second = queue.pop_next("proj1").await.unwrap().unwrap();
        assert_eq!(second.id, b.id);
    }

    #[tokio::test]
    async fn fifo_within_a_tier() {
        let queue = test_queue().await;
        let mut ids = Vec::new();
        for text in ["1", "2", "3"] {
            ids.push(queue.enqueue(job("p", text)).await.unwrap().id);
        }
        let listed: Vec<Uuid> = queue
            .list_by_status(JobStatus::Pending)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn every_transition_leaves_exactly_one_index_entry() {
        let queue = test_queue().await;
        let stored = queue.enqueue(job("p", "x")).await.unwrap();
        assert_single_index(&queue, stored.id, JobStatus::Pending).await;

        queue.mark_running(stored.id).await.unwrap();
        assert_single_index(&queue, stored.id, JobStatus::Running).await;

        queue.reset_to_pending(stored.id, "test").await.unwrap();
        assert_single_index(&queue, stored.id, JobStatus::Pending).await;

        queue.mark_running(stored.id).await.unwrap();
        queue
            .mark_terminal(stored.id, JobStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();
        assert_single_index(&queue, stored.id, JobStatus::Failed).await;

        assert!(queue.list_by_status(JobStatus::Pending).await.unwrap().is_empty());
        assert!(queue.list_by_status(JobStatus::Running).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claiming_twice_is_rejected() {
        let queue = test_queue().await;
        let stored = queue.enqueue(job("p", "x")).await.unwrap();
        queue.mark_running(stored.id).await.unwrap();
        let err = queue.mark_running(stored.id).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn terminal_requires_running() {
        let queue = test_queue().await;
        let stored = queue.enqueue(job("p", "x")).await.unwrap();
        let err = queue
            .mark_terminal(stored.id, JobStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));

        let err = queue
            .mark_terminal(stored.id, JobStatus::Running, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn requeued_job_cannot_be_finished_by_its_old_run() {
        let queue = test_queue().await;
        let stored = queue.enqueue(job("p", "x")).await.unwrap();
        queue.mark_running(stored.id).await.unwrap();
        queue.reset_to_pending(stored.id, "flushed").await.unwrap();

        let err = queue
            .mark_terminal(stored.id, JobStatus::Failed, None, Some("interrupted".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert_single_index(&queue, stored.id, JobStatus::Pending).await;
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let queue = test_queue().await;
        let err = queue.mark_running(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));
    }

    #[tokio::test]
    async fn reset_counts_attempts_then_gives_up() {
        let queue = test_queue().await;
        let stored = queue.enqueue(job("p", "x")).await.unwrap();

        for expected in 1..=3 {
            queue.mark_running(stored.id).await.unwrap();
            let outcome = queue.reset_to_pending(stored.id, "restart").await.unwrap();
            match outcome {
                ResetOutcome::Requeued(job) => assert_eq!(job.attempts, expected),
                other => panic!("expected requeue, got {other:?}"),
            }
        }

        queue.mark_running(stored.id).await.unwrap();
        let outcome = queue.reset_to_pending(stored.id, "restart").await.unwrap();
        assert!(matches!(outcome, ResetOutcome::Exhausted(_)));
        assert_eq!(outcome.job().status, JobStatus::Failed);
        assert!(outcome.job().error.as_deref().unwrap().contains("gave up"));
        assert_single_index(&queue, stored.id, JobStatus::Failed).await;
    }

    #[tokio::test]
    async fn orphan_is_reinserted_with_high_priority() {
        let queue = test_queue().await;
        let normal = queue.enqueue(job("p", "first")).await.unwrap();
        let orphan = queue.enqueue(job("p", "orphan")).await.unwrap();
        queue
            .db()
            .remove_index_entry(orphan.id, JobStatus::Pending)
            .await
            .unwrap();
        assert!(queue.db().index_statuses(orphan.id).await.unwrap().is_empty());

        let restored = queue.reinsert_orphan(&orphan).await.unwrap();
        assert_eq!(restored.priority, Priority::High);
        assert_single_index(&queue, orphan.id, JobStatus::Pending).await;

        let next = queue.pop_next("p").await.unwrap().unwrap();
        assert_eq!(next.id, orphan.id);
        assert_ne!(next.id, normal.id);
    }

    #[tokio::test]
    async fn enqueue_rejects_non_pending() {
        let queue = test_queue().await;
        let mut running = job("p", "x");
        running.status = JobStatus::Running;
        assert!(queue.enqueue(running).await.is_err());
    }
}
