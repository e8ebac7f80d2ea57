//! Executor interface — the opaque long-running agent process.
//!
//! The worker only ever talks to an execution through three operations:
//! read its next event, interrupt it, and submit new input to it. What runs
//! underneath (a CLI child process, a remote runtime, a scripted fake in
//! tests) is hidden behind [`Executor`].

pub mod process;

use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ExecutorError;

pub use process::{ProcessExecutor, ProcessExecutorConfig};

/// Something the running agent did.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// The agent invoked a tool.
    ToolCall {
        name: String,
        args: serde_json::Value,
    },
    /// A tool returned.
    ToolResult {
        name: String,
        output: String,
        is_error: bool,
    },
    /// Free text produced by the agent.
    Output { text: String },
    /// The agent finished the current input.
    Finished { result: String },
}

/// Everything an executor needs to start working on a job.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: Uuid,
    pub project_key: String,
    pub session_id: String,
    pub input: String,
    /// Isolated workspace for the job's work item, if it has one.
    pub workdir: Option<PathBuf>,
    /// The session has run before and should be resumed rather than started fresh.
    pub resume: bool,
}

/// Starts executions.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn start(&self, request: ExecutionRequest) -> Result<Box<dyn Execution>, ExecutorError>;
}

/// A single live execution.
///
/// `next_event` must be cancel-safe: the worker races it against steering,
/// heartbeats and interrupts inside `tokio::select!`.
#[async_trait]
pub trait Execution: Send {
    /// Next event. `Ok(None)` means the event stream ended.
    async fn next_event(&mut self) -> Result<Option<ExecutionEvent>, ExecutorError>;

    /// Stop the current step. Honoured at the executor's next suspension point.
    async fn interrupt(&mut self) -> Result<(), ExecutorError>;

    /// Feed new input to the same execution, typically after an interrupt.
    async fn submit(&mut self, input: String) -> Result<(), ExecutorError>;
}
