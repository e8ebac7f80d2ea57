//! Session, activity trace and steering message types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// A worker loop is driving a job against this session.
    Active,
    /// Waiting to be resumed (its job was put back in the queue).
    Dormant,
    /// Stopped on request.
    Abandoned,
    /// Last job finished successfully.
    Complete,
    /// Last job crashed, timed out, or was remediated by the watchdog.
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Dormant => "dormant",
            Self::Abandoned => "abandoned",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "dormant" => Ok(Self::Dormant),
            "abandoned" => Ok(Self::Abandoned),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// The logical conversation/work context one or more jobs run against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub project_key: String,
    pub status: SessionStatus,
    pub work_item_slug: Option<String>,
    /// When the current activation started.
    pub started_at: DateTime<Utc>,
    /// Last executor progress (tool call, output).
    pub last_activity: DateTime<Utc>,
    /// Last liveness beat from the owning worker loop.
    pub last_heartbeat: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(session_id: impl Into<String>, project_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            project_key: project_key.into(),
            status: SessionStatus::Active,
            work_item_slug: None,
            started_at: now,
            last_activity: now,
            last_heartbeat: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Kind of an entry in a session's activity trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolCall,
    ToolResult,
    Output,
    Steering,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Output => "output",
            Self::Steering => "steering",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "output" => Ok(Self::Output),
            "steering" => Ok(Self::Steering),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// One entry of a session's activity trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub kind: EventKind,
    /// Tool name for tool calls, empty otherwise.
    pub name: String,
    pub args: serde_json::Value,
    pub is_error: bool,
    /// Truncated output or text.
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionEvent {
    pub fn tool_call(
        session_id: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            kind: EventKind::ToolCall,
            name: name.into(),
            args,
            is_error: false,
            output: None,
            created_at: Utc::now(),
        }
    }

    pub fn tool_result(
        session_id: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            kind: EventKind::ToolResult,
            name: name.into(),
            args: serde_json::Value::Null,
            is_error,
            output: Some(output.into()),
            created_at: Utc::now(),
        }
    }

    pub fn steering(
        session_id: impl Into<String>,
        sender: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            kind: EventKind::Steering,
            name: sender.into(),
            args: serde_json::Value::Null,
            is_error: false,
            output: Some(text.into()),
            created_at: Utc::now(),
        }
    }

    pub fn output(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind: EventKind::Output,
            name: String::new(),
            args: serde_json::Value::Null,
            is_error: false,
            output: Some(text.into()),
            created_at: Utc::now(),
        }
    }
}

/// An out-of-band instruction for a running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteeringMessage {
    pub session_id: String,
    pub text: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub is_abort: bool,
}

impl SteeringMessage {
    pub fn new(
        session_id: impl Into<String>,
        text: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            text: text.into(),
            sender: sender.into(),
            timestamp: Utc::now(),
            is_abort: false,
        }
    }

    pub fn abort(mut self) -> Self {
        self.is_abort = true;
        self
    }
}
