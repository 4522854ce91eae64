// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session factory backed by an external agent CLI.
//!
//! The core never talks to a model directly. This adapter spawns the
//! configured agent CLI (`AUTOFORGE_AGENT_CMD`, default `claude`) in the
//! task's working directory with `--output-format stream-json` and maps the
//! streamed JSON lines onto [`SessionEvent`]s. Plan-mode agents get
//! `--permission-mode plan`; headless agents get the skip-permissions flag
//! so unattended operation never blocks on a prompt.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use super::{AgentSession, SessionEvent, SessionFactory, SessionRequest, SessionStatus};
use crate::agents::AgentExecutionMode;
use crate::cancel::CancelToken;
use crate::error::AgentError;

/// Environment override for the agent CLI binary.
pub const AGENT_CMD_ENV: &str = "AUTOFORGE_AGENT_CMD";
/// Default agent CLI.
const DEFAULT_AGENT_CMD: &str = "claude";

/// Spawns one CLI process per session.
pub struct CliSessionFactory {
    program: String,
    registry: std::sync::Arc<crate::agents::AgentRegistry>,
}

impl CliSessionFactory {
    pub fn new(registry: std::sync::Arc<crate::agents::AgentRegistry>) -> Self {
        let program =
            std::env::var(AGENT_CMD_ENV).unwrap_or_else(|_| DEFAULT_AGENT_CMD.to_string());
        Self { program, registry }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl SessionFactory for CliSessionFactory {
    async fn start(
        &self,
        request: SessionRequest,
        cancel: CancelToken,
    ) -> Result<Box<dyn AgentSession>, AgentError> {
        let definition = self.registry.get(request.agent);

        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match definition.execution_mode {
            AgentExecutionMode::Plan => {
                cmd.args(["--permission-mode", "plan"]);
            }
            AgentExecutionMode::Headless => {
                cmd.arg("--dangerously-skip-permissions");
            }
            AgentExecutionMode::Standard => {}
        }
        if !request.model.is_empty() {
            cmd.args(["--model", &request.model]);
        }
        if !request.tool_capabilities.is_empty() {
            cmd.args(["--allowed-tools", &request.tool_capabilities.join(",")]);
        }
        cmd.args(["-p", &request.prompt, "--output-format", "stream-json"]);

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::SessionFailed(format!("agent CLI spawn: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::SessionFailed("agent CLI stdout missing".to_string()))?;

        Ok(Box::new(CliSession {
            child,
            lines: BufReader::new(stdout).lines(),
            cancel,
            started: false,
            ended: false,
            tool_count: 0,
        }))
    }
}

/// One running CLI process viewed as an event stream.
struct CliSession {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    cancel: CancelToken,
    started: bool,
    ended: bool,
    tool_count: u32,
}

#[async_trait]
impl AgentSession for CliSession {
    async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.ended {
            return None;
        }
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.ended = true;
                    let _ = self.child.start_kill();
                    return Some(SessionEvent::SessionEnd {
                        status: SessionStatus::Cancelled,
                        tokens_in: 0,
                        tokens_out: 0,
                        tool_count: self.tool_count,
                        error: None,
                    });
                }
                line = self.lines.next_line() => line,
            };

            match line {
                Ok(Some(text)) => {
                    if let Some(event) = self.map_line(&text) {
                        return Some(event);
                    }
                    // Unrecognized line: keep reading.
                }
                Ok(None) => {
                    // EOF without a result line: classify by exit status.
                    self.ended = true;
                    let status = self.child.wait().await.ok();
                    let success = status.map(|s| s.success()).unwrap_or(false);
                    return Some(SessionEvent::SessionEnd {
                        status: if success {
                            SessionStatus::Success
                        } else {
                            SessionStatus::Error
                        },
                        tokens_in: 0,
                        tokens_out: 0,
                        tool_count: self.tool_count,
                        error: (!success)
                            .then(|| "agent CLI stream ended without a result".to_string()),
                    });
                }
                Err(e) => {
                    self.ended = true;
                    warn!(error = %e, "agent CLI stream read error");
                    return Some(SessionEvent::SessionEnd {
                        status: SessionStatus::Error,
                        tokens_in: 0,
                        tokens_out: 0,
                        tool_count: self.tool_count,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
    }
}

impl CliSession {
    fn map_line(&mut self, text: &str) -> Option<SessionEvent> {
        let json: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                debug!(line = %text.chars().take(120).collect::<String>(), "non-JSON agent line");
                return None;
            }
        };
        map_stream_json(&json, &mut self.started, &mut self.ended, &mut self.tool_count)
    }
}

/// Map one stream-json line to a session event.
///
/// Recognized shapes:
/// - `{"type":"system","subtype":"init","session_id":...}` → SessionStart
/// - `{"type":"assistant","message":{"content":[...]}}` → AssistantText /
///   ToolCall per content block (first matching block wins per line)
/// - `{"type":"user","message":{"content":[{"type":"tool_result",...}]}}` →
///   ToolResult
/// - `{"type":"result","subtype":"success"|"error_*", "usage":...}` →
///   SessionEnd
fn map_stream_json(
    json: &Value,
    started: &mut bool,
    ended: &mut bool,
    tool_count: &mut u32,
) -> Option<SessionEvent> {
    match json.get("type").and_then(Value::as_str)? {
        "system" => {
            if json.get("subtype").and_then(Value::as_str) == Some("init") && !*started {
                *started = true;
                let session_id = json
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                return Some(SessionEvent::SessionStart { session_id });
            }
            None
        }
        "assistant" => {
            let content = json.get("message")?.get("content")?.as_array()?;
            for block in content {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        let text = block.get("text").and_then(Value::as_str)?.to_string();
                        if !text.is_empty() {
                            return Some(SessionEvent::AssistantText { text });
                        }
                    }
                    Some("tool_use") => {
                        *tool_count += 1;
                        return Some(SessionEvent::ToolCall {
                            id: block
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            input: block.get("input").cloned().unwrap_or(Value::Null),
                        });
                    }
                    _ => {}
                }
            }
            None
        }
        "user" => {
            let content = json.get("message")?.get("content")?.as_array()?;
            for block in content {
                if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                    return Some(SessionEvent::ToolResult {
                        id: block
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        output: block.get("content").cloned().unwrap_or(Value::Null),
                        is_error: block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    });
                }
            }
            None
        }
        "result" => {
            *ended = true;
            let subtype = json.get("subtype").and_then(Value::as_str).unwrap_or("");
            let success = subtype == "success";
            let usage = json.get("usage");
            let tokens = |key: &str| {
                usage
                    .and_then(|u| u.get(key))
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
            };
            Some(SessionEvent::SessionEnd {
                status: if success {
                    SessionStatus::Success
                } else {
                    SessionStatus::Error
                },
                tokens_in: tokens("input_tokens"),
                tokens_out: tokens("output_tokens"),
                tool_count: *tool_count,
                error: (!success).then(|| {
                    json.get("result")
                        .and_then(Value::as_str)
                        .unwrap_or(subtype)
                        .to_string()
                }),
            })
        }
        _ => None,
    }
}
