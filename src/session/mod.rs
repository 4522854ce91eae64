// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent session abstraction.
//!
//! The core does not implement the LLM transport. It consumes an
//! [`AgentSession`]: given a prompt, tool set, working directory, and a
//! cancellation token, the session library yields a finite stream of typed
//! events. [`SessionDriver`] pumps that stream, mirrors it into the task's
//! event log, and applies the file-existence-first rule: a transport error
//! after a successful artifact write must not be treated as a task failure.

pub mod cli;
pub mod replay;
pub mod retry;

pub use cli::CliSessionFactory;
pub use replay::{ScriptedFactory, ScriptedSession};
pub use retry::{retry_transient, RetryPolicy};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::agents::AgentKind;
use crate::cancel::CancelToken;
use crate::error::AgentError;
use crate::events::{kind as event_kind, EventLog};
use crate::settings::ThinkingLevel;

// ============================================================================
// Events
// ============================================================================

/// Terminal status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Success,
    Error,
    Cancelled,
}

/// Typed events produced by a session, in stream order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStart {
        session_id: String,
    },
    AssistantText {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        output: Value,
        is_error: bool,
    },
    SessionEnd {
        status: SessionStatus,
        tokens_in: u64,
        tokens_out: u64,
        tool_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// ============================================================================
// Contract
// ============================================================================

/// What the core hands the session library to start one agent turn.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub agent: AgentKind,
    pub working_dir: PathBuf,
    pub spec_dir: PathBuf,
    pub model: String,
    pub thinking: ThinkingLevel,
    /// Tool names this session may use.
    pub tool_capabilities: Vec<String>,
    pub prompt: String,
}

impl SessionRequest {
    pub fn new(agent: AgentKind, working_dir: &Path, spec_dir: &Path) -> Self {
        Self {
            agent,
            working_dir: working_dir.to_path_buf(),
            spec_dir: spec_dir.to_path_buf(),
            model: String::new(),
            thinking: ThinkingLevel::Medium,
            tool_capabilities: Vec::new(),
            prompt: String::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_thinking(mut self, thinking: ThinkingLevel) -> Self {
        self.thinking = thinking;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tool_capabilities = tools;
        self
    }
}

/// A live session: a finite stream of [`SessionEvent`]s.
///
/// Iteration may be interrupted by cancellation at any event boundary.
#[async_trait]
pub trait AgentSession: Send {
    /// Next event, or `None` once the stream is exhausted.
    async fn next_event(&mut self) -> Option<SessionEvent>;
}

/// Starts sessions. Implemented by the session library adapter in
/// production and by [`ScriptedFactory`] in tests.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn start(
        &self,
        request: SessionRequest,
        cancel: CancelToken,
    ) -> Result<Box<dyn AgentSession>, AgentError>;
}

// ============================================================================
// Outcome
// ============================================================================

/// Summary of one driven session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub final_text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tool_count: u32,
    pub error: Option<String>,
}

impl SessionOutcome {
    /// File-existence-first rule: a session that errored still counts as
    /// usable when the expected artifact exists on disk — the phase
    /// validator inspects the artifact instead of trusting the transport.
    pub fn usable_with_artifact(&self, artifact: &Path) -> bool {
        match self.status {
            SessionStatus::Success => true,
            SessionStatus::Error => artifact.exists(),
            SessionStatus::Cancelled => false,
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Pumps a session's event stream into the task's event log.
///
/// Observes the cancellation token at every event read (a suspension point
/// per the concurrency contract). Tool calls are surfaced to an optional
/// callback so stages can service core-owned tools (the spec factory).
pub struct SessionDriver<'a> {
    log: &'a mut EventLog,
    cancel: CancelToken,
}

impl<'a> SessionDriver<'a> {
    pub fn new(log: &'a mut EventLog, cancel: CancelToken) -> Self {
        Self { log, cancel }
    }

    /// Drive the stream to completion.
    pub async fn drive(
        &mut self,
        session: &mut Box<dyn AgentSession>,
    ) -> Result<SessionOutcome, AgentError> {
        self.drive_with(session, |_| {}).await
    }

    /// Drive the stream, handing every [`SessionEvent::ToolCall`] to
    /// `on_tool_call` before logging it.
    pub async fn drive_with<F>(
        &mut self,
        session: &mut Box<dyn AgentSession>,
        mut on_tool_call: F,
    ) -> Result<SessionOutcome, AgentError>
    where
        F: FnMut(&SessionEvent),
    {
        let mut outcome = SessionOutcome {
            status: SessionStatus::Error,
            final_text: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            tool_count: 0,
            error: Some("session produced no terminal event".to_string()),
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("session cancelled mid-stream");
                    outcome.status = SessionStatus::Cancelled;
                    outcome.error = None;
                    return Ok(outcome);
                }
                event = session.next_event() => event,
            };

            let Some(event) = event else {
                break;
            };

            match &event {
                SessionEvent::SessionStart { session_id } => {
                    let _ = self.log.append(
                        event_kind::AGENT_SESSION_START,
                        serde_json::json!({ "sessionId": session_id }),
                    );
                }
                SessionEvent::AssistantText { text } => {
                    outcome.final_text = text.clone();
                }
                SessionEvent::ToolCall { name, .. } => {
                    on_tool_call(&event);
                    let _ = self.log.append(
                        "TOOL_CALL",
                        serde_json::json!({ "tool": name }),
                    );
                }
                SessionEvent::ToolResult { .. } => {}
                SessionEvent::SessionEnd {
                    status,
                    tokens_in,
                    tokens_out,
                    tool_count,
                    error,
                } => {
                    outcome.status = *status;
                    outcome.tokens_in = *tokens_in;
                    outcome.tokens_out = *tokens_out;
                    outcome.tool_count = *tool_count;
                    outcome.error = error.clone();
                    let _ = self.log.append(
                        event_kind::AGENT_SESSION_END,
                        serde_json::json!({
                            "status": status,
                            "tokensIn": tokens_in,
                            "tokensOut": tokens_out,
                            "toolCount": tool_count,
                        }),
                    );
                }
            }
        }

        Ok(outcome)
    }
}
