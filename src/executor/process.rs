//! Child-process executor for agent CLIs that stream NDJSON on stdout.
//!
//! The input goes to stdin; each stdout line is one JSON event. Both the
//! flat shape (`{"type":"tool_use",...}`) and the nested assistant/user
//! message shape of `stream-json` output are understood. Interrupting kills
//! the child; the next `submit` respawns it with the resume arguments.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::error::ExecutorError;
use crate::executor::{Execution, ExecutionEvent, ExecutionRequest, Executor};

/// Bytes of stderr kept for crash reports.
const STDERR_TAIL_BYTES: usize = 4096;

/// Program and arguments for the agent CLI.
#[derive(Debug, Clone)]
pub struct ProcessExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Appended on resume. `{session_id}` is replaced with the session id.
    pub resume_args: Vec<String>,
}

impl ProcessExecutorConfig {
    pub fn from_relay(config: &RelayConfig) -> Self {
        Self {
            program: config.agent_program.clone(),
            args: config.agent_args.clone(),
            resume_args: config.agent_resume_args.clone(),
        }
    }

    fn build_args(&self, session_id: &str, resume: bool) -> Vec<String> {
        let mut args = self.args.clone();
        if resume {
            args.extend(
                self.resume_args
                    .iter()
                    .map(|a| a.replace("{session_id}", session_id)),
            );
        }
        args
    }
}

/// Spawns one child process per execution.
pub struct ProcessExecutor {
    config: ProcessExecutorConfig,
}

impl ProcessExecutor {
    pub fn new(config: ProcessExecutorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn start(&self, request: ExecutionRequest) -> Result<Box<dyn Execution>, ExecutorError> {
        let mut execution = ProcessExecution {
            config: self.config.clone(),
            session_id: request.session_id.clone(),
            workdir: request.workdir.clone(),
            child: None,
            lines: None,
            stderr_tail: None,
            pending: VecDeque::new(),
            tool_names: HashMap::new(),
            saw_result: false,
        };
        execution.spawn(request.input, request.resume).await?;
        Ok(Box::new(execution))
    }
}

struct ProcessExecution {
    config: ProcessExecutorConfig,
    session_id: String,
    workdir: Option<PathBuf>,
    child: Option<Child>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
    stderr_tail: Option<JoinHandle<String>>,
    pending: VecDeque<ExecutionEvent>,
    /// tool_use id -> tool name, to label results that only carry the id.
    tool_names: HashMap<String, String>,
    saw_result: bool,
}

impl ProcessExecution {
    async fn spawn(&mut self, input: String, resume: bool) -> Result<(), ExecutorError> {
        let args = self.config.build_args(&self.session_id, resume);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| ExecutorError::SpawnFailed {
            program: self.config.program.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| ExecutorError::SpawnFailed {
            program: self.config.program.clone(),
            reason: "failed to capture stdout".to_string(),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let bytes = input.into_bytes();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    tracing::debug!(error = %e, "Agent closed stdin early");
                }
                // Dropping stdin closes it so the agent sees EOF
            });
        }

        self.stderr_tail = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut tail: Vec<u8> = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            tail.extend_from_slice(&buf[..n]);
                            if tail.len() > STDERR_TAIL_BYTES {
                                let excess = tail.len() - STDERR_TAIL_BYTES;
                                tail.drain(..excess);
                            }
                        }
                    }
                }
                String::from_utf8_lossy(&tail).into_owned()
            })
        });

        tracing::debug!(
            session_id = %self.session_id,
            program = %self.config.program,
            pid = child.id(),
            resume,
            "Agent process spawned"
        );

        self.lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        self.saw_result = false;
        self.pending.clear();
        Ok(())
    }

    async fn reap(&mut self) -> Result<(), ExecutorError> {
        let status = match self.child.as_mut() {
            Some(child) => child.wait().await?,
            None => return Ok(()),
        };
        let stderr = match self.stderr_tail.as_mut() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        self.child = None;
        self.lines = None;
        self.stderr_tail = None;

        if !status.success() && !self.saw_result {
            let stderr = stderr.trim();
            let detail = if stderr.is_empty() {
                format!("agent exited with {status}")
            } else {
                format!("agent exited with {status}: {stderr}")
            };
            return Err(ExecutorError::Crashed(detail));
        }
        Ok(())
    }
}

#[async_trait]
impl Execution for ProcessExecution {
    async fn next_event(&mut self) -> Result<Option<ExecutionEvent>, ExecutorError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if matches!(event, ExecutionEvent::Finished { .. }) {
                    self.saw_result = true;
                }
                return Ok(Some(event));
            }

            let Some(lines) = self.lines.as_mut() else {
                return Err(ExecutorError::NotRunning);
            };

            match lines.next_line().await? {
                Some(line) => {
                    let events = parse_line(&line, &mut self.tool_names)?;
                    self.pending.extend(events);
                }
                None => {
                    // Reading past EOF keeps returning None, so a cancelled
                    // reap is simply retried on the next call.
                    self.reap().await?;
                    return Ok(None);
                }
            }
        }
    }

    async fn interrupt(&mut self) -> Result<(), ExecutorError> {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Agent already exited");
            }
            let status = child.wait().await?;
            tracing::info!(session_id = %self.session_id, %status, "Agent process interrupted");
        }
        if let Some(handle) = self.stderr_tail.take() {
            handle.abort();
        }
        self.child = None;
        self.lines = None;
        self.pending.clear();
        Ok(())
    }

    async fn submit(&mut self, input: String) -> Result<(), ExecutorError> {
        if self.child.is_some() {
            self.interrupt().await?;
        }
        self.spawn(input, true).await
    }
}

/// Parse one stdout line into zero or more events.
fn parse_line(
    line: &str,
    tool_names: &mut HashMap<String, String>,
) -> Result<Vec<ExecutionEvent>, ExecutorError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if !trimmed.starts_with('{') {
        return Ok(vec![ExecutionEvent::Output {
            text: trimmed.to_string(),
        }]);
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            let preview: String = trimmed.chars().take(200).collect();
            tracing::warn!(error = %e, line = %preview, "Unparseable agent event, skipping");
            return Ok(Vec::new());
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("assistant") | Some("user") => {
            let blocks = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok(blocks
                .iter()
                .filter_map(|block| parse_block(block, tool_names))
                .collect())
        }
        Some("result") => {
            let result = value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if value.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
                return Err(ExecutorError::Crashed(if result.is_empty() {
                    "agent reported an error result".to_string()
                } else {
                    result
                }));
            }
            Ok(vec![ExecutionEvent::Finished { result }])
        }
        _ => Ok(parse_block(&value, tool_names).into_iter().collect()),
    }
}

fn parse_block(block: &Value, tool_names: &mut HashMap<String, String>) -> Option<ExecutionEvent> {
    match block.get("type").and_then(Value::as_str)? {
        "tool_use" => {
            let name = block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            if let Some(id) = block.get("id").and_then(Value::as_str) {
                tool_names.insert(id.to_string(), name.clone());
            }
            Some(ExecutionEvent::ToolCall {
                name,
                args: block.get("input").cloned().unwrap_or(Value::Null),
            })
        }
        "tool_result" => {
            let name = block
                .get("name")
                .and_then(Value::as_str)
                .map(String::from)
                .or_else(|| {
                    block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .and_then(|id| tool_names.get(id).cloned())
                })
                .unwrap_or_default();
            Some(ExecutionEvent::ToolResult {
                name,
                output: content_text(block.get("content").unwrap_or(&Value::Null)),
                is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            })
        }
        "text" => {
            let text = block.get("text").and_then(Value::as_str)?;
            Some(ExecutionEvent::Output {
                text: text.to_string(),
            })
        }
        _ => None,
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use uuid::Uuid;

    fn parse(line: &str) -> Vec<ExecutionEvent> {
        parse_line(line, &mut HashMap::new()).unwrap()
    }

    #[test]
    fn flat_events() {
        assert_eq!(
            parse(r#"{"type":"tool_use","name":"Read","input":{"path":"a.rs"}}"#),
            vec![ExecutionEvent::ToolCall {
                name: "Read".into(),
                args: serde_json::json!({"path": "a.rs"}),
            }]
        );
        assert_eq!(
            parse(r#"{"type":"text","text":"thinking"}"#),
            vec![ExecutionEvent::Output {
                text: "thinking".into()
            }]
        );
        assert_eq!(
            parse(r#"{"type":"result","result":"done"}"#),
            vec![ExecutionEvent::Finished {
                result: "done".into()
            }]
        );
    }

    #[test]
    fn nested_message_blocks_resolve_tool_names() {
        let mut names = HashMap::new();
        let calls = parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"},{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#,
            &mut names,
        )
        .unwrap();
        assert_eq!(calls.len(), 2);

        let results = parse_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"error: nope"}],"is_error":true}]}}"#,
            &mut names,
        )
        .unwrap();
        assert_eq!(
            results,
            vec![ExecutionEvent::ToolResult {
                name: "Bash".into(),
                output: "error: nope".into(),
                is_error: true,
            }]
        );
    }

    #[test]
    fn error_result_is_a_crash() {
        let err = parse_line(
            r#"{"type":"result","is_error":true,"result":"rate limited"}"#,
            &mut HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecutorError::Crashed(msg) if msg == "rate limited"));
    }

    #[test]
    fn junk_lines_are_tolerated() {
        assert!(parse("").is_empty());
        assert!(parse("{not json").is_empty());
        assert!(parse(r#"{"type":"system","subtype":"init"}"#).is_empty());
        assert_eq!(
            parse("plain text"),
            vec![ExecutionEvent::Output {
                text: "plain text".into()
            }]
        );
    }

    #[test]
    fn resume_args_substitute_session() {
        let config = ProcessExecutorConfig {
            program: "agent".into(),
            args: vec!["-p".into()],
            resume_args: vec!["--resume".into(), "{session_id}".into()],
        };
        assert_eq!(config.build_args("s1", false), vec!["-p"]);
        assert_eq!(config.build_args("s1", true), vec!["-p", "--resume", "s1"]);
    }

    fn sh(script: &str) -> ProcessExecutor {
        ProcessExecutor::new(ProcessExecutorConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            resume_args: Vec::new(),
        })
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            job_id: Uuid::new_v4(),
            project_key: "proj".into(),
            session_id: "s1".into(),
            input: "do the thing".into(),
            workdir: None,
            resume: false,
        }
    }

    #[tokio::test]
    async fn child_process_streams_events() {
        let executor = sh(
            r#"cat > /dev/null; echo '{"type":"text","text":"hi"}'; echo '{"type":"result","result":"done"}'"#,
        );
        let mut execution = executor.start(request()).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = execution.next_event().await.unwrap() {
            events.push(event);
        }
        assert_eq!(
            events.last(),
            Some(&ExecutionEvent::Finished {
                result: "done".into()
            })
        );
    }

    #[tokio::test]
    async fn nonzero_exit_without_result_is_crash() {
        let executor = sh("cat > /dev/null; echo oops >&2; exit 3");
        let mut execution = executor.start(request()).await.unwrap();
        let err = loop {
            match execution.next_event().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected crash"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ExecutorError::Crashed(msg) if msg.contains("oops")));
    }

    #[tokio::test]
    async fn interrupt_kills_child() {
        let executor = sh("sleep 30");
        let mut execution = executor.start(request()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), execution.interrupt())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            execution.next_event().await,
            Err(ExecutorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let executor = ProcessExecutor::new(ProcessExecutorConfig {
            program: "/nonexistent/agent-binary".into(),
            args: Vec::new(),
            resume_args: Vec::new(),
        });
        let err = executor.start(request()).await.err().unwrap();
        assert!(matches!(err, ExecutorError::SpawnFailed { .. }));
    }
}
