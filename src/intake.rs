//! Inbound/outbound boundary with the chat transport.
//!
//! Inbound messages either become new jobs or steering for a session that is
//! already running. Outbound, the engine only ever emits the three
//! [`OutboundSignal`] variants; rendering them is the transport's business.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, SteeringError};
use crate::queue::{Job, JobPayload, JobQueue, Priority};
use crate::session::{SessionStatus, SessionTracker, SteeringChannel};
use crate::worker::Scheduler;

/// Status signal for the transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum OutboundSignal {
    /// The job was accepted into the queue.
    Acknowledged { job_id: Uuid, session_id: String },
    /// The job finished successfully.
    Completed {
        job_id: Uuid,
        session_id: String,
        result: String,
    },
    /// The job failed, timed out, or was aborted.
    Error {
        job_id: Uuid,
        session_id: String,
        reason: String,
    },
}

impl OutboundSignal {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Acknowledged { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Error { job_id, .. } => *job_id,
        }
    }
}

/// Where an inbound message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Queued as steering for the Active session.
    Steered { seq: i64 },
    /// Turned into a new job.
    Enqueued { job_id: Uuid },
}

#[derive(Clone)]
pub struct Intake {
    queue: JobQueue,
    tracker: SessionTracker,
    steering: SteeringChannel,
    /// Absent in one-shot CLI processes; the daemon's sweeper starts the worker.
    scheduler: Option<Arc<Scheduler>>,
    outbound: mpsc::UnboundedSender<OutboundSignal>,
}

impl Intake {
    pub fn new(
        queue: JobQueue,
        tracker: SessionTracker,
        steering: SteeringChannel,
        scheduler: Option<Arc<Scheduler>>,
        outbound: mpsc::UnboundedSender<OutboundSignal>,
    ) -> Self {
        Self {
            queue,
            tracker,
            steering,
            scheduler,
            outbound,
        }
    }

    /// Accept a new job and make sure a worker exists for its key.
    pub async fn submit(
        &self,
        project_key: &str,
        session_id: &str,
        payload: JobPayload,
        priority: Priority,
        work_item_slug: Option<&str>,
    ) -> Result<Uuid, Error> {
        let mut job = Job::new(project_key, session_id, payload).with_priority(priority);
        if let Some(slug) = work_item_slug {
            job = job.with_work_item(slug);
        }
        self.submit_job(job).await
    }

    /// Like [`Intake::submit`] for a fully built job (e.g. a long-running one).
    pub async fn submit_job(&self, job: Job) -> Result<Uuid, Error> {
        if let Some(slug) = job.work_item_slug.as_deref() {
            crate::workspace::validate_slug(slug)?;
        }
        self.tracker
            .ensure_exists(&job.session_id, &job.project_key, job.work_item_slug.as_deref())
            .await?;

        let stored = self.queue.enqueue(job).await?;
        if let Some(scheduler) = &self.scheduler {
            scheduler.ensure_worker(&stored.project_key).await;
        }

        self.emit(OutboundSignal::Acknowledged {
            job_id: stored.id,
            session_id: stored.session_id.clone(),
        });
        Ok(stored.id)
    }

    /// Steer the session if it is running, otherwise start a new job for it.
    ///
    /// A push can lose the race with the session finishing; the rejected
    /// message then becomes the next job instead of being dropped. Aborts
    /// for a session that is not running have nothing to stop and are
    /// returned as errors.
    pub async fn route_message(
        &self,
        project_key: &str,
        session_id: &str,
        payload: JobPayload,
        is_abort: bool,
    ) -> Result<Routed, Error> {
        let sender = payload.sender.clone().unwrap_or_else(|| "user".to_string());

        let active = self
            .tracker
            .get(session_id)
            .await?
            .is_some_and(|s| s.status == SessionStatus::Active);

        if active {
            match self
                .steering
                .push(session_id, &payload.text, &sender, is_abort)
                .await
            {
                Ok(seq) => return Ok(Routed::Steered { seq }),
                Err(
                    e @ (SteeringError::SessionNotActive { .. }
                    | SteeringError::SessionNotFound { .. }),
                ) => {
                    if is_abort {
                        return Err(e.into());
                    }
                    tracing::info!(session_id, error = %e, "Session left Active, enqueueing instead");
                }
                Err(e) => return Err(e.into()),
            }
        } else if is_abort {
            return Err(SteeringError::SessionNotActive {
                session_id: session_id.to_string(),
                status: "not running".to_string(),
            }
            .into());
        }

        let job_id = self
            .submit(project_key, session_id, payload, Priority::Normal, None)
            .await?;
        Ok(Routed::Enqueued { job_id })
    }

    fn emit(&self, signal: OutboundSignal) {
        if self.outbound.send(signal).is_err() {
            tracing::debug!("Outbound receiver dropped, signal discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::JobStatus;
    use crate::session::SessionRegistry;
    use crate::store::{Database, LibSqlBackend};

    struct Fixture {
        intake: Intake,
        queue: JobQueue,
        tracker: SessionTracker,
        steering: SteeringChannel,
        outbound: mpsc::UnboundedReceiver<OutboundSignal>,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = QueueConfig::default();
        let queue = JobQueue::new(db.clone(), &config);
        let tracker = SessionTracker::new(db.clone(), &config);
        let steering = SteeringChannel::new(db, Arc::new(SessionRegistry::new()), &config);
        let (tx, rx) = mpsc::unbounded_channel();
        Fixture {
            intake: Intake::new(queue.clone(), tracker.clone(), steering.clone(), None, tx),
            queue,
            tracker,
            steering,
            outbound: rx,
        }
    }

    #[tokio::test]
    async fn submit_enqueues_and_acknowledges() {
        let mut fx = fixture().await;
        let job_id = fx
            .intake
            .submit("proj", "s1", JobPayload::text("hi"), Priority::High, Some("feat"))
            .await
            .unwrap();

        let job = fx.queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.work_item_slug.as_deref(), Some("feat"));

        let session = fx.tracker.get("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Dormant);

        assert_eq!(
            fx.outbound.recv().await.unwrap(),
            OutboundSignal::Acknowledged {
                job_id,
                session_id: "s1".into()
            }
        );
    }

    #[tokio::test]
    async fn submit_rejects_bad_slug() {
        let fx = fixture().await;
        let err = fx
            .intake
            .submit("proj", "s1", JobPayload::text("hi"), Priority::Normal, Some("../x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Workspace(_)));
    }

    #[tokio::test]
    async fn active_session_gets_steered() {
        let fx = fixture().await;
        let job = Job::new("proj", "s1", JobPayload::text("start"));
        fx.tracker.activate(&job).await.unwrap();

        let routed = fx
            .intake
            .route_message("proj", "s1", JobPayload::text("use tabs").with_sender("bob"), false)
            .await
            .unwrap();
        assert!(matches!(routed, Routed::Steered { .. }));
        let msg = fx.steering.pop("s1").await.unwrap().unwrap();
        assert_eq!(msg.text, "use tabs");
        assert_eq!(msg.sender, "bob");
    }

    #[tokio::test]
    async fn finished_session_gets_a_new_job() {
        let fx = fixture().await;
        let job = Job::new("proj", "s1", JobPayload::text("start"));
        fx.tracker.activate(&job).await.unwrap();
        fx.tracker.set_status("s1", SessionStatus::Complete).await.unwrap();

        let routed = fx
            .intake
            .route_message("proj", "s1", JobPayload::text("one more thing"), false)
            .await
            .unwrap();
        let Routed::Enqueued { job_id } = routed else {
            panic!("expected a new job, got {routed:?}");
        };
        let job = fx.queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.payload.text, "one more thing");
        assert_eq!(fx.steering.pending("s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn abort_for_idle_session_is_rejected() {
        let fx = fixture().await;
        let err = fx
            .intake
            .route_message("proj", "s1", JobPayload::text("stop"), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Steering(SteeringError::SessionNotActive { .. })
        ));
        assert!(fx.queue.list_by_status(JobStatus::Pending).await.unwrap().is_empty());
    }
}
