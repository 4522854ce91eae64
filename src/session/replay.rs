// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scripted sessions for tests.
//!
//! [`ScriptedSession`] replays a pre-recorded event list; [`ScriptedFactory`]
//! hands scripts out in order and optionally fails a request to exercise the
//! transient-retry path. No network, no LLM.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AgentSession, SessionEvent, SessionFactory, SessionRequest, SessionStatus};
use crate::cancel::CancelToken;
use crate::error::AgentError;

/// A session that replays a fixed event script.
pub struct ScriptedSession {
    events: VecDeque<SessionEvent>,
    hang: bool,
}

impl ScriptedSession {
    pub fn new(events: Vec<SessionEvent>) -> Self {
        Self {
            events: events.into(),
            hang: false,
        }
    }

    /// A session that never produces an event, for cancellation tests.
    pub fn hanging() -> Self {
        Self {
            events: VecDeque::new(),
            hang: true,
        }
    }

    /// Convenience script: start, one text block, successful end.
    pub fn successful(text: &str) -> Self {
        Self::new(vec![
            SessionEvent::SessionStart {
                session_id: uuid::Uuid::new_v4().to_string(),
            },
            SessionEvent::AssistantText {
                text: text.to_string(),
            },
            SessionEvent::SessionEnd {
                status: SessionStatus::Success,
                tokens_in: 10,
                tokens_out: 10,
                tool_count: 0,
                error: None,
            },
        ])
    }

    /// Convenience script: start, then an errored end.
    pub fn errored(message: &str) -> Self {
        Self::new(vec![
            SessionEvent::SessionStart {
                session_id: uuid::Uuid::new_v4().to_string(),
            },
            SessionEvent::SessionEnd {
                status: SessionStatus::Error,
                tokens_in: 0,
                tokens_out: 0,
                tool_count: 0,
                error: Some(message.to_string()),
            },
        ])
    }
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.events.pop_front()
    }
}

/// Behavior of one queued factory slot.
enum Slot {
    Session(Vec<SessionEvent>),
    /// Like `Session`, but runs a side effect when the session starts —
    /// standing in for the file mutations a real agent performs through its
    /// tools (plan updates, commits).
    SessionWith(Vec<SessionEvent>, Box<dyn FnOnce() + Send>),
    StartError(AgentError),
}

/// Hands out scripted sessions in FIFO order.
///
/// When the queue runs dry, further requests get an empty successful
/// session, so tests only script the turns they care about.
pub struct ScriptedFactory {
    slots: Mutex<VecDeque<Slot>>,
    requests: Mutex<Vec<SessionRequest>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_session(&self, events: Vec<SessionEvent>) {
        self.slots.lock().unwrap().push_back(Slot::Session(events));
    }

    /// Queue a session whose side effect fires when the session starts.
    pub fn push_session_with(
        &self,
        events: Vec<SessionEvent>,
        effect: impl FnOnce() + Send + 'static,
    ) {
        self.slots
            .lock()
            .unwrap()
            .push_back(Slot::SessionWith(events, Box::new(effect)));
    }

    pub fn push_start_error(&self, error: AgentError) {
        self.slots.lock().unwrap().push_back(Slot::StartError(error));
    }

    /// Requests seen so far, for assertions on model/agent/prompt wiring.
    pub fn requests(&self) -> Vec<SessionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn start(
        &self,
        request: SessionRequest,
        _cancel: CancelToken,
    ) -> Result<Box<dyn AgentSession>, AgentError> {
        self.requests.lock().unwrap().push(request);
        let slot = self.slots.lock().unwrap().pop_front();
        match slot {
            Some(Slot::Session(events)) => Ok(Box::new(ScriptedSession::new(events))),
            Some(Slot::SessionWith(events, effect)) => {
                effect();
                Ok(Box::new(ScriptedSession::new(events)))
            }
            Some(Slot::StartError(error)) => Err(error),
            None => Ok(Box::new(ScriptedSession::successful(""))),
        }
    }
}
