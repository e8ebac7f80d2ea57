//! Session lifecycle and activity trace bookkeeping.

use std::sync::Arc;

use chrono::Utc;

use crate::config::QueueConfig;
use crate::error::DatabaseError;
use crate::queue::model::Job;
use crate::session::model::{AgentSession, EventKind, SessionEvent, SessionStatus};
use crate::store::{Database, RetryPolicy, with_retry};

/// Longest output snippet kept per trace entry.
const MAX_OUTPUT_CHARS: usize = 2000;

/// Reads and writes session records on behalf of workers and the watchdog.
#[derive(Clone)]
pub struct SessionTracker {
    db: Arc<dyn Database>,
    retry: RetryPolicy,
}

impl SessionTracker {
    pub fn new(db: Arc<dyn Database>, config: &QueueConfig) -> Self {
        Self {
            db,
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Make the job's session Active, creating it on first use.
    pub async fn activate(&self, job: &Job) -> Result<AgentSession, DatabaseError> {
        let now = Utc::now();
        let existing = with_retry(&self.retry, "get_session", || {
            self.db.get_session(&job.session_id)
        })
        .await?;

        let session = match existing {
            Some(mut session) => {
                session.status = SessionStatus::Active;
                session.project_key = job.project_key.clone();
                if job.work_item_slug.is_some() {
                    session.work_item_slug = job.work_item_slug.clone();
                }
                session.started_at = now;
                session.last_activity = now;
                session.last_heartbeat = now;
                session.updated_at = now;
                session
            }
            None => {
                let mut session = AgentSession::new(&job.session_id, &job.project_key);
                session.work_item_slug = job.work_item_slug.clone();
                session
            }
        };

        with_retry(&self.retry, "upsert_session", || self.db.upsert_session(&session)).await?;
        tracing::debug!(session_id = %session.session_id, job_id = %job.id, "Session active");
        Ok(session)
    }

    /// Create the session record if it does not exist yet. Intake uses this
    /// so steering can find sessions whose first job has not started.
    pub async fn ensure_exists(
        &self,
        session_id: &str,
        project_key: &str,
        work_item_slug: Option<&str>,
    ) -> Result<AgentSession, DatabaseError> {
        if let Some(session) = self.get(session_id).await? {
            return Ok(session);
        }
        let mut session = AgentSession::new(session_id, project_key);
        session.status = SessionStatus::Dormant;
        session.work_item_slug = work_item_slug.map(String::from);
        with_retry(&self.retry, "upsert_session", || self.db.upsert_session(&session)).await?;
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<AgentSession>, DatabaseError> {
        with_retry(&self.retry, "get_session", || self.db.get_session(session_id)).await
    }

    pub async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), DatabaseError> {
        let found = with_retry(&self.retry, "update_session_status", || {
            self.db.update_session_status(session_id, status)
        })
        .await?;
        if found {
            tracing::info!(session_id, status = %status, "Session status changed");
        } else {
            tracing::warn!(session_id, status = %status, "Status change for unknown session");
        }
        Ok(())
    }

    /// Append to the trace and count it as executor activity.
    pub async fn record(&self, mut event: SessionEvent) -> Result<(), DatabaseError> {
        if let Some(output) = event.output.as_mut() {
            truncate_chars(output, MAX_OUTPUT_CHARS);
        }
        with_retry(&self.retry, "append_session_event", || {
            self.db.append_session_event(&event)
        })
        .await?;
        self.db
            .touch_session_activity(&event.session_id, event.created_at)
            .await
    }

    /// Worker liveness beat.
    pub async fn heartbeat(&self, session_id: &str) -> Result<(), DatabaseError> {
        self.db.touch_session_heartbeat(session_id, Utc::now()).await
    }

    pub async fn recent_events(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<SessionEvent>, DatabaseError> {
        self.db.recent_session_events(session_id, None, limit).await
    }

    /// The last `limit` events of one kind, oldest first.
    pub async fn recent_events_of_kind(
        &self,
        session_id: &str,
        kind: EventKind,
        limit: usize,
    ) -> Result<Vec<SessionEvent>, DatabaseError> {
        self.db.recent_session_events(session_id, Some(kind), limit).await
    }

    pub async fn list(&self, status: SessionStatus) -> Result<Vec<AgentSession>, DatabaseError> {
        with_retry(&self.retry, "list_sessions_by_status", || {
            self.db.list_sessions_by_status(status)
        })
        .await
    }
}

fn truncate_chars(s: &mut String, max: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
        s.push_str("…");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::JobPayload;
    use crate::store::LibSqlBackend;

    async fn tracker() -> SessionTracker {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        SessionTracker::new(db, &QueueConfig::default())
    }

    #[tokio::test]
    async fn activate_creates_then_reactivates() {
        let tracker = tracker().await;
        let job = Job::new("proj", "s1", JobPayload::text("hi")).with_work_item("feat");

        let session = tracker.activate(&job).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.work_item_slug.as_deref(), Some("feat"));

        tracker.set_status("s1", SessionStatus::Complete).await.unwrap();
        let next = Job::new("proj", "s1", JobPayload::text("again"));
        let session = tracker.activate(&next).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        // Slug survives a job that does not carry one
        assert_eq!(session.work_item_slug.as_deref(), Some("feat"));
    }

    #[tokio::test]
    async fn ensure_exists_creates_dormant_once() {
        let tracker = tracker().await;
        let created = tracker.ensure_exists("s1", "proj", None).await.unwrap();
        assert_eq!(created.status, SessionStatus::Dormant);

        tracker.set_status("s1", SessionStatus::Active).await.unwrap();
        let again = tracker.ensure_exists("s1", "proj", None).await.unwrap();
        assert_eq!(again.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn record_truncates_long_output() {
        let tracker = tracker().await;
        let job = Job::new("proj", "s1", JobPayload::text("hi"));
        tracker.activate(&job).await.unwrap();

        let long = "x".repeat(MAX_OUTPUT_CHARS + 50);
        tracker
            .record(SessionEvent::output("s1", long))
            .await
            .unwrap();
        let events = tracker.recent_events("s1", 10).await.unwrap();
        let stored = events[0].output.as_ref().unwrap();
        assert_eq!(stored.chars().count(), MAX_OUTPUT_CHARS + 1);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let mut s = "héllo wörld".to_string();
        truncate_chars(&mut s, 3);
        assert_eq!(s, "hél…");
    }
}
