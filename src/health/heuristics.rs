//! Stuck-session heuristics. Pure functions over a session record and the
//! tail of its activity trace.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::HealthConfig;
use crate::session::model::{AgentSession, EventKind, SessionEvent};

/// Tool output that looks like a failure even when the tool did not flag it.
static ERROR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(error|exception|traceback|panicked|fatal|permission denied|no such file|command not found|segmentation fault)\b",
    )
    .expect("static error pattern")
});

/// One detected problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Issue {
    Silent { idle_secs: u64 },
    Looping { tool: String, repeats: usize },
    ErrorCascade { errors: usize, window: usize },
    OverDuration { elapsed_secs: u64 },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silent { idle_secs } => write!(f, "no activity for {}m", idle_secs / 60),
            Self::Looping { tool, repeats } => {
                write!(f, "{repeats} identical consecutive `{tool}` calls")
            }
            Self::ErrorCascade { errors, window } => {
                write!(f, "{errors} errors in the last {window} tool results")
            }
            Self::OverDuration { elapsed_secs } => {
                write!(f, "running for {}m", elapsed_secs / 60)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// Everything the heuristics found for one session in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assessment {
    pub issues: Vec<Issue>,
}

impl Assessment {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    /// One issue is a warning, two or more are critical.
    pub fn severity(&self) -> Option<Severity> {
        match self.issues.len() {
            0 => None,
            1 => Some(Severity::Warning),
            _ => Some(Severity::Critical),
        }
    }

    pub fn summary(&self) -> String {
        self.issues
            .iter()
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run every heuristic. `events` is the trace tail, oldest first.
pub fn assess(
    session: &AgentSession,
    events: &[SessionEvent],
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> Assessment {
    let issues = [
        detect_silence(session, now, config.silence_threshold),
        detect_loop(events, config.loop_threshold),
        detect_error_cascade(events, config.error_window, config.error_threshold),
        detect_over_duration(session, now, config.duration_ceiling),
    ]
    .into_iter()
    .flatten()
    .collect();
    Assessment { issues }
}

pub fn detect_silence(
    session: &AgentSession,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Option<Issue> {
    let idle = elapsed(session.last_activity, now);
    (idle > threshold).then(|| Issue::Silent {
        idle_secs: idle.as_secs(),
    })
}

pub fn detect_over_duration(
    session: &AgentSession,
    now: DateTime<Utc>,
    ceiling: Duration,
) -> Option<Issue> {
    let running = elapsed(session.started_at, now);
    (running > ceiling).then(|| Issue::OverDuration {
        elapsed_secs: running.as_secs(),
    })
}

/// The trailing run of identical tool-call fingerprints.
pub fn detect_loop(events: &[SessionEvent], threshold: usize) -> Option<Issue> {
    if threshold == 0 {
        return None;
    }
    let mut calls = events
        .iter()
        .rev()
        .filter(|e| e.kind == EventKind::ToolCall);

    let last = calls.next()?;
    let print = fingerprint(&last.name, &last.args);
    let repeats = 1 + calls
        .take_while(|e| fingerprint(&e.name, &e.args) == print)
        .count();

    (repeats >= threshold).then(|| Issue::Looping {
        tool: last.name.clone(),
        repeats,
    })
}

/// Errors among the last `window` tool results.
pub fn detect_error_cascade(
    events: &[SessionEvent],
    window: usize,
    threshold: usize,
) -> Option<Issue> {
    if threshold == 0 {
        return None;
    }
    let errors = events
        .iter()
        .rev()
        .filter(|e| e.kind == EventKind::ToolResult)
        .take(window)
        .filter(|e| looks_like_error(e))
        .count();

    (errors >= threshold).then_some(Issue::ErrorCascade { errors, window })
}

fn looks_like_error(event: &SessionEvent) -> bool {
    event.is_error
        || event
            .output
            .as_deref()
            .is_some_and(|out| ERROR_PATTERN.is_match(out))
}

/// Tool name plus arguments with every object's keys sorted, so argument
/// order does not make two identical calls look different.
pub fn fingerprint(name: &str, args: &serde_json::Value) -> String {
    let mut out = String::from(name);
    out.push(':');
    write_canonical(args, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
