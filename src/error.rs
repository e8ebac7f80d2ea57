//! Error types for agent-relay.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Steering error: {0}")]
    Steering(#[from] SteeringError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether retrying the same call later could succeed.
    ///
    /// Busy/locked databases and dropped connections are transient; schema,
    /// constraint and decoding problems are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Pool(_) => true,
            Self::Query(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("database is locked")
                    || msg.contains("busy")
                    || msg.contains("connection")
                    || msg.contains("timed out")
            }
            _ => false,
        }
    }
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Job {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },

    #[error("Job {id} stuck for {duration:?}")]
    Stuck { id: Uuid, duration: Duration },

    #[error("Job {id} timed out after {timeout:?}")]
    TimedOut { id: Uuid, timeout: Duration },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Steering channel errors.
#[derive(Debug, thiserror::Error)]
pub enum SteeringError {
    #[error("Session {session_id} is not active (status: {status})")]
    SessionNotActive { session_id: String, status: String },

    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors raised by an executor driving an agent session.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to spawn executor {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Executor protocol error: {0}")]
    Protocol(String),

    #[error("Executor crashed: {0}")]
    Crashed(String),

    #[error("Executor was interrupted")]
    Interrupted,

    #[error("Executor is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Workspace isolation errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Invalid work item slug: {0}")]
    InvalidSlug(String),

    #[error("Workspace not found for work item {0}")]
    NotFound(String),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crash recovery and supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Recovery already in progress (lock held by {holder} until {expires_at})")]
    LockHeld { holder: String, expires_at: String },

    #[error("Remediation {action} failed: {reason}")]
    Remediation { action: String, reason: String },

    #[error("Reading {what} failed: {reason}")]
    Observation { what: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alert delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to deliver notification via {notifier}: {reason}")]
    SendFailed { notifier: String, reason: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_database_is_transient() {
        assert!(DatabaseError::Query("database is locked".into()).is_transient());
        assert!(DatabaseError::Pool("no connection".into()).is_transient());
    }

    #[test]
    fn constraint_violation_is_not_transient() {
        assert!(!DatabaseError::Constraint("UNIQUE failed".into()).is_transient());
        assert!(!DatabaseError::Query("no such table: jobs".into()).is_transient());
    }
}
