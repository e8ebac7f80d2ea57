//! Job data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for the worker of its project key.
    Pending,
    /// Claimed by a worker loop and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error, timed out, or aborted.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) |
            (Running, Completed) | (Running, Failed) |
            // Crash recovery puts abandoned executions back in the queue
            (Running, Pending)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Scheduling priority. Higher values are popped first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn rank(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Self::Low,
            1 => Self::Normal,
            _ => Self::High,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Selects the execution timeout for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    Standard,
    LongRunning,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::LongRunning => "long_running",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "long_running" => Ok(Self::LongRunning),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Opaque request data carried by a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// The message text handed to the executor.
    pub text: String,
    /// Who sent the request (chat user, operator, `steering-followup`, ...).
    #[serde(default)]
    pub sender: Option<String>,
    /// Free-form classification hints from the intake layer.
    #[serde(default)]
    pub hints: serde_json::Value,
}

impl JobPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: None,
            hints: serde_json::Value::Null,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub project_key: String,
    pub session_id: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub work_item_slug: Option<String>,
    /// Enqueue order; preserved across every status transition.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Number of times recovery has put this job back in the queue.
    pub attempts: u32,
}

impl Job {
    /// Create a new pending job. `seq` is assigned by the store on enqueue.
    pub fn new(
        project_key: impl Into<String>,
        session_id: impl Into<String>,
        payload: JobPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_key: project_key.into(),
            session_id: session_id.into(),
            status: JobStatus::Pending,
            priority: Priority::Normal,
            kind: JobKind::Standard,
            payload,
            work_item_slug: None,
            seq: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_work_item(mut self, slug: impl Into<String>) -> Self {
        self.work_item_slug = Some(slug.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        for p in [Priority::Low, Priority::Normal, Priority::High] {
            assert_eq!(Priority::from_rank(p.rank()), p);
        }
    }

    #[test]
    fn status_parse_and_display() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("stuck".parse::<JobStatus>().is_err());
    }

    #[test]
    fn payload_serde_defaults() {
        let payload: JobPayload = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(payload.text, "hi");
        assert!(payload.sender.is_none());
        assert!(payload.hints.is_null());
    }
}
