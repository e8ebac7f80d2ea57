//! `Database` trait — single async interface for all persistence.
//!
//! Jobs live in a primary set plus a secondary status index. The index is
//! append-only: a row is written when a job record is inserted and removed
//! only when the record is deleted. Status changes therefore go through
//! [`Database::recreate_job`], which deletes the record (and its index rows)
//! and inserts the updated one as a single transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{Job, JobStatus};
use crate::session::model::{
    AgentSession, EventKind, SessionEvent, SessionStatus, SteeringMessage,
};

/// A row of the secondary status index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Pending/running counts for one project key.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct KeyCounts {
    pub project_key: String,
    pub pending: i64,
    pub running: i64,
}

/// Backend-agnostic database trait covering jobs, sessions, steering and locks.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job record and its status index row. Assigns `seq` when
    /// the job has none yet and returns the stored job.
    async fn insert_job(&self, job: &Job) -> Result<Job, DatabaseError>;

    /// Get a job from the primary set.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Delete-and-recreate: if the stored record still has status `expected`,
    /// delete it from the primary set and every index, then insert `updated`.
    /// Returns `false` (and changes nothing) when the record is missing or its
    /// status no longer matches.
    async fn recreate_job(&self, expected: JobStatus, updated: &Job) -> Result<bool, DatabaseError>;

    /// Delete a job and its index rows. Returns whether a record existed.
    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Highest-priority, oldest pending job for a key, resolved through the index.
    async fn next_pending_job(&self, project_key: &str) -> Result<Option<Job>, DatabaseError>;

    /// Jobs listed under `status` in the index, optionally for one key,
    /// in pop order.
    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        project_key: Option<&str>,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Every record in the primary set.
    async fn list_all_jobs(&self) -> Result<Vec<Job>, DatabaseError>;

    /// Jobs attached to a session, oldest first.
    async fn list_jobs_for_session(&self, session_id: &str) -> Result<Vec<Job>, DatabaseError>;

    /// Every row of the status index.
    async fn list_index_entries(&self) -> Result<Vec<IndexEntry>, DatabaseError>;

    /// Index statuses a given job is currently listed under.
    async fn index_statuses(&self, job_id: Uuid) -> Result<Vec<JobStatus>, DatabaseError>;

    /// Remove one index row. Used by recovery to drop ghost entries.
    async fn remove_index_entry(&self, job_id: Uuid, status: JobStatus)
    -> Result<bool, DatabaseError>;

    /// Pending/running counts per project key.
    async fn count_jobs_by_key(&self) -> Result<Vec<KeyCounts>, DatabaseError>;

    /// Delete terminal jobs that finished more than `keep_days` ago.
    async fn prune_finished_jobs(&self, keep_days: u32) -> Result<usize, DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Insert or fully replace a session record.
    async fn upsert_session(&self, session: &AgentSession) -> Result<(), DatabaseError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<AgentSession>, DatabaseError>;

    /// Set a session's status. Returns whether the session exists.
    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<bool, DatabaseError>;

    /// Record executor progress.
    async fn touch_session_activity(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Record a worker liveness beat.
    async fn touch_session_heartbeat(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn list_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<AgentSession>, DatabaseError>;

    /// Append to a session's activity trace.
    async fn append_session_event(&self, event: &SessionEvent) -> Result<(), DatabaseError>;

    /// The last `limit` events of a session, oldest first, optionally only
    /// those of one kind.
    async fn recent_session_events(
        &self,
        session_id: &str,
        kind: Option<EventKind>,
        limit: usize,
    ) -> Result<Vec<SessionEvent>, DatabaseError>;

    /// Delete activity trace entries of non-active sessions older than `keep_days`.
    async fn prune_session_events(&self, keep_days: u32) -> Result<usize, DatabaseError>;

    // ── Steering ────────────────────────────────────────────────────

    /// Append a message to a session's mailbox, but only while the session is
    /// Active. Returns its sequence number, or `None` when nothing was stored.
    async fn push_steering(&self, message: &SteeringMessage)
    -> Result<Option<i64>, DatabaseError>;

    /// Atomically remove and return the oldest message for a session.
    async fn pop_steering(&self, session_id: &str)
    -> Result<Option<SteeringMessage>, DatabaseError>;

    /// Remove every message for a session. Returns how many were removed.
    async fn clear_steering(&self, session_id: &str) -> Result<usize, DatabaseError>;

    async fn count_steering(&self, session_id: &str) -> Result<usize, DatabaseError>;

    // ── Recovery lock ───────────────────────────────────────────────

    /// Take the recovery-in-progress marker unless another holder owns an
    /// unexpired one. Expired markers are replaced.
    async fn try_acquire_recovery_lock(
        &self,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Release the marker if `holder` owns it.
    async fn release_recovery_lock(&self, holder: &str) -> Result<(), DatabaseError>;

    /// Current unexpired holder and expiry, if any.
    async fn recovery_lock_holder(&self)
    -> Result<Option<(String, DateTime<Utc>)>, DatabaseError>;
}
