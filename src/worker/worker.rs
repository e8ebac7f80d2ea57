//! Worker loop — drives the jobs of one project key, one at a time.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::JobError;
use crate::executor::{Execution, ExecutionEvent, ExecutionRequest, Executor};
use crate::intake::OutboundSignal;
use crate::queue::{Job, JobKind, JobPayload, JobQueue, JobStatus};
use crate::session::{
    Registration, SessionEvent, SessionRegistry, SessionStatus, SessionTracker, SteeringBatch,
    SteeringChannel,
};
use crate::workspace::WorkspaceManager;

/// Sender recorded on jobs created from steering that arrived too late.
pub const FOLLOWUP_SENDER: &str = "steering-followup";

/// Shared dependencies for every worker loop.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: JobQueue,
    pub tracker: SessionTracker,
    pub steering: SteeringChannel,
    pub registry: Arc<SessionRegistry>,
    pub executor: Arc<dyn Executor>,
    pub workspaces: Option<Arc<WorkspaceManager>>,
    pub outbound: mpsc::UnboundedSender<OutboundSignal>,
    pub config: QueueConfig,
}

/// How one execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(String),
    Crashed(String),
    TimedOut(Duration),
    Aborted { sender: String, reason: String },
    Interrupted(String),
}

impl Outcome {
    fn job_status(&self) -> JobStatus {
        match self {
            Self::Completed(_) => JobStatus::Completed,
            _ => JobStatus::Failed,
        }
    }

    fn session_status(&self) -> SessionStatus {
        match self {
            Self::Completed(_) => SessionStatus::Complete,
            Self::Aborted { .. } => SessionStatus::Abandoned,
            _ => SessionStatus::Failed,
        }
    }

    fn error_text(&self) -> Option<String> {
        match self {
            Self::Completed(_) => None,
            Self::Crashed(reason) => Some(format!("executor crashed: {reason}")),
            Self::TimedOut(after) => Some(format!("timed out after {}s", after.as_secs())),
            Self::Aborted { sender, reason } if reason.is_empty() => {
                Some(format!("aborted by {sender}"))
            }
            Self::Aborted { sender, reason } => Some(format!("aborted by {sender}: {reason}")),
            Self::Interrupted(reason) => Some(format!("interrupted: {reason}")),
        }
    }
}

/// The single consumer of one project key's queue.
pub struct WorkerLoop {
    project_key: String,
    deps: WorkerDeps,
}

impl WorkerLoop {
    pub fn new(project_key: impl Into<String>, deps: WorkerDeps) -> Self {
        Self {
            project_key: project_key.into(),
            deps,
        }
    }

    pub fn project_key(&self) -> &str {
        &self.project_key
    }

    /// Process jobs until the queue for this key is empty. Returns how many
    /// jobs were handled.
    pub async fn run_until_idle(&self) -> usize {
        tracing::debug!(project_key = %self.project_key, "Worker loop polling");
        let mut handled = 0;
        while let Some(job) = self.next_job().await {
            self.process(job).await;
            handled += 1;
        }
        tracing::debug!(project_key = %self.project_key, handled, "Worker loop idle");
        handled
    }

    /// Whether the queue for this key has a pending job right now.
    pub async fn has_pending(&self) -> bool {
        self.poll().await.is_some()
    }

    /// Next pending job, re-polling once after the drain guard so a job whose
    /// index row is still being written is not missed.
    async fn next_job(&self) -> Option<Job> {
        if let Some(job) = self.poll().await {
            return Some(job);
        }
        tokio::time::sleep(self.deps.config.drain_guard_delay).await;
        self.poll().await
    }

    async fn poll(&self) -> Option<Job> {
        match self.deps.queue.pop_next(&self.project_key).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(project_key = %self.project_key, error = %e, "Failed to poll queue");
                None
            }
        }
    }

    async fn process(&self, job: Job) {
        let job = match self.deps.queue.mark_running(job.id).await {
            Ok(job) => job,
            Err(JobError::InvalidTransition { .. }) => {
                tracing::debug!(job_id = %job.id, "Job claimed elsewhere, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to claim job");
                // Leave it Pending; back off so a dead store does not spin us
                tokio::time::sleep(self.deps.config.steering_poll_interval).await;
                return;
            }
        };

        tracing::info!(
            job_id = %job.id,
            project_key = %job.project_key,
            session_id = %job.session_id,
            attempts = job.attempts,
            "Job started"
        );

        let resume = self.has_run_before(&job).await;
        if let Err(e) = self.deps.tracker.activate(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to activate session");
        }

        let mut registration =
            self.deps
                .registry
                .register(&job.session_id, job.id, &job.project_key);

        let outcome = AssertUnwindSafe(self.drive(&job, &mut registration, resume))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Outcome::Crashed(panic_message(panic.as_ref())));

        self.finalize(&job, outcome, registration).await;
    }

    async fn has_run_before(&self, job: &Job) -> bool {
        if job.attempts > 0 {
            return true;
        }
        match self.deps.queue.db().list_jobs_for_session(&job.session_id).await {
            Ok(jobs) => jobs
                .iter()
                .any(|other| other.id != job.id && other.started_at.is_some()),
            Err(e) => {
                tracing::warn!(session_id = %job.session_id, error = %e, "Could not read session history");
                false
            }
        }
    }

    async fn workdir(&self, job: &Job) -> Result<Option<PathBuf>, String> {
        let (Some(workspaces), Some(slug)) = (&self.deps.workspaces, &job.work_item_slug) else {
            return Ok(None);
        };
        workspaces
            .create(slug)
            .await
            .map(Some)
            .map_err(|e| format!("workspace for {slug}: {e}"))
    }

    async fn drive(&self, job: &Job, registration: &mut Registration, resume: bool) -> Outcome {
        let workdir = match self.workdir(job).await {
            Ok(dir) => dir,
            Err(reason) => return Outcome::Crashed(reason),
        };

        let request = ExecutionRequest {
            job_id: job.id,
            project_key: job.project_key.clone(),
            session_id: job.session_id.clone(),
            input: job.payload.text.clone(),
            workdir,
            resume,
        };
        let mut execution = match self.deps.executor.start(request).await {
            Ok(execution) => execution,
            Err(e) => return Outcome::Crashed(e.to_string()),
        };

        let timeout = match job.kind {
            JobKind::Standard => self.deps.config.standard_timeout,
            JobKind::LongRunning => self.deps.config.long_running_timeout,
        };
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut heartbeat = tokio::time::interval(self.deps.config.heartbeat_interval);
        let mut steering_poll = tokio::time::interval(self.deps.config.steering_poll_interval);
        // Skip immediate first ticks
        heartbeat.tick().await;
        steering_poll.tick().await;

        let wake = registration.wake_signal();

        loop {
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    tracing::warn!(job_id = %job.id, timeout_secs = timeout.as_secs(), "Job timed out");
                    stop(execution.as_mut(), job.id).await;
                    return Outcome::TimedOut(timeout);
                }

                Some(request) = registration.next_interrupt() => {
                    tracing::warn!(job_id = %job.id, reason = %request.reason, "Execution interrupted");
                    stop(execution.as_mut(), job.id).await;
                    return Outcome::Interrupted(request.reason);
                }

                _ = wake.notified() => {
                    if let Some(outcome) = self.apply_steering(job, execution.as_mut()).await {
                        return outcome;
                    }
                }

                _ = steering_poll.tick() => {
                    if let Some(outcome) = self.apply_steering(job, execution.as_mut()).await {
                        return outcome;
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = self.deps.tracker.heartbeat(&job.session_id).await {
                        tracing::warn!(session_id = %job.session_id, error = %e, "Heartbeat failed");
                    }
                }

                event = execution.next_event() => match event {
                    Ok(Some(ExecutionEvent::Finished { result })) => {
                        return Outcome::Completed(result);
                    }
                    Ok(Some(event)) => self.record(job, event).await,
                    Ok(None) => {
                        return Outcome::Crashed("event stream ended without a result".to_string());
                    }
                    Err(e) => return Outcome::Crashed(e.to_string()),
                },
            }
        }
    }

    /// Drain the mailbox and act on it. `Some` ends the execution.
    async fn apply_steering(&self, job: &Job, execution: &mut dyn Execution) -> Option<Outcome> {
        let batch = match self.deps.steering.drain(&job.session_id).await {
            Ok(batch) => batch?,
            Err(e) => {
                tracing::warn!(session_id = %job.session_id, error = %e, "Steering poll failed");
                return None;
            }
        };

        match batch {
            SteeringBatch::Abort {
                sender,
                reason,
                discarded,
            } => {
                tracing::info!(
                    job_id = %job.id,
                    session_id = %job.session_id,
                    sender = %sender,
                    discarded,
                    "Abort requested"
                );
                self.record_steering(job, &sender, &reason).await;
                stop(execution, job.id).await;
                Some(Outcome::Aborted { sender, reason })
            }
            SteeringBatch::Redirect {
                text,
                senders,
                count,
            } => {
                tracing::info!(
                    job_id = %job.id,
                    session_id = %job.session_id,
                    count,
                    "Injecting steering into running execution"
                );
                self.record_steering(job, &senders.join(","), &text).await;
                if let Err(e) = execution.interrupt().await {
                    tracing::warn!(job_id = %job.id, error = %e, "Interrupt before redirect failed");
                }
                match execution.submit(text).await {
                    Ok(()) => None,
                    Err(e) => Some(Outcome::Crashed(format!("resubmit after steering: {e}"))),
                }
            }
        }
    }

    async fn record(&self, job: &Job, event: ExecutionEvent) {
        let trace = match event {
            ExecutionEvent::ToolCall { name, args } => {
                tracing::debug!(job_id = %job.id, tool = %name, "Tool call");
                SessionEvent::tool_call(&job.session_id, name, args)
            }
            ExecutionEvent::ToolResult {
                name,
                output,
                is_error,
            } => SessionEvent::tool_result(&job.session_id, name, output, is_error),
            ExecutionEvent::Output { text } => SessionEvent::output(&job.session_id, text),
            ExecutionEvent::Finished { .. } => return,
        };
        if let Err(e) = self.deps.tracker.record(trace).await {
            tracing::warn!(session_id = %job.session_id, error = %e, "Failed to record activity");
        }
    }

    async fn record_steering(&self, job: &Job, sender: &str, text: &str) {
        let event = SessionEvent::steering(&job.session_id, sender, text);
        if let Err(e) = self.deps.tracker.record(event).await {
            tracing::warn!(session_id = %job.session_id, error = %e, "Failed to record steering");
        }
    }

    /// Terminal bookkeeping. Runs whichever way the execution ended.
    async fn finalize(&self, job: &Job, outcome: Outcome, registration: Registration) {
        let status = outcome.job_status();
        let error = outcome.error_text();
        let result = match &outcome {
            Outcome::Completed(result) => Some(result.clone()),
            _ => None,
        };

        if let Err(e) = self
            .deps
            .queue
            .mark_terminal(job.id, status, result.clone(), error.clone())
            .await
        {
            // The stored job moved on without us (flushed back to Pending,
            // or finished elsewhere). Its session and mailbox belong to
            // whoever owns it now, and no outcome may be reported.
            tracing::error!(
                job_id = %job.id,
                error = %e,
                "Failed to record job outcome, dropping result"
            );
            drop(registration);
            return;
        }

        if let Err(e) = self
            .deps
            .tracker
            .set_status(&job.session_id, outcome.session_status())
            .await
        {
            tracing::error!(session_id = %job.session_id, error = %e, "Failed to update session");
        }

        // The session is no longer Active, so later pushes go to intake.
        // Whatever slipped in before that becomes the next job.
        self.requeue_leftover_steering(job, &outcome).await;
        drop(registration);

        match &outcome {
            Outcome::Completed(_) => tracing::info!(job_id = %job.id, "Job completed"),
            other => tracing::error!(
                job_id = %job.id,
                session_id = %job.session_id,
                error = %other.error_text().unwrap_or_default(),
                "Job failed"
            ),
        }

        let signal = match (result, error) {
            (Some(result), _) => OutboundSignal::Completed {
                job_id: job.id,
                session_id: job.session_id.clone(),
                result,
            },
            (None, reason) => OutboundSignal::Error {
                job_id: job.id,
                session_id: job.session_id.clone(),
                reason: reason.unwrap_or_default(),
            },
        };
        if self.deps.outbound.send(signal).is_err() {
            tracing::debug!(job_id = %job.id, "Outbound receiver dropped, signal discarded");
        }
    }

    async fn requeue_leftover_steering(&self, job: &Job, outcome: &Outcome) {
        let leftovers = match self.deps.steering.take_all(&job.session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(session_id = %job.session_id, error = %e, "Failed to drain leftover steering");
                return;
            }
        };
        if leftovers.is_empty() {
            return;
        }

        let (aborts, messages): (Vec<_>, Vec<_>) = leftovers.into_iter().partition(|m| m.is_abort);
        if !aborts.is_empty() {
            tracing::info!(session_id = %job.session_id, count = aborts.len(), "Dropping abort for finished session");
        }
        if messages.is_empty() || matches!(outcome, Outcome::Aborted { .. }) {
            return;
        }

        let text = messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let mut followup = Job::new(
            &job.project_key,
            &job.session_id,
            JobPayload::text(text).with_sender(FOLLOWUP_SENDER),
        )
        .with_priority(job.priority)
        .with_kind(job.kind);
        followup.work_item_slug = job.work_item_slug.clone();

        match self.deps.queue.enqueue(followup).await {
            Ok(stored) => tracing::info!(
                session_id = %job.session_id,
                job_id = %stored.id,
                count = messages.len(),
                "Late steering resubmitted as a new job"
            ),
            Err(e) => tracing::error!(
                session_id = %job.session_id,
                error = %e,
                "Failed to resubmit late steering"
            ),
        }
    }
}

async fn stop(execution: &mut dyn Execution, job_id: Uuid) {
    if let Err(e) = execution.interrupt().await {
        tracing::warn!(job_id = %job_id, error = %e, "Interrupt failed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}
