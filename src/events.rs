// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Append-only per-task event log.
//!
//! One JSON line per event under `{specDir}/events.jsonl`. Sequences are
//! dense and strictly increasing within a task; the file is never rewritten.
//! Readers tolerate a truncated trailing line (a crash mid-append) and may
//! resume from a sequence checkpoint.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// File name of the per-task event log.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Well-known event kinds.
pub mod kind {
    pub const AGENT_SESSION_START: &str = "AGENT_SESSION_START";
    pub const AGENT_SESSION_END: &str = "AGENT_SESSION_END";
    pub const SUBTASK_UPDATED: &str = "SUBTASK_UPDATED";
    pub const PHASE_COMPLETED: &str = "PHASE_COMPLETED";
    pub const STAGE_STARTED: &str = "STAGE_STARTED";
    pub const STAGE_COMPLETED: &str = "STAGE_COMPLETED";
    pub const STAGE_RETRY: &str = "STAGE_RETRY";
    pub const QA_STARTED: &str = "QA_STARTED";
    pub const QA_PASSED: &str = "QA_PASSED";
    pub const QA_FAILED: &str = "QA_FAILED";
    pub const QA_FIXING_STARTED: &str = "QA_FIXING_STARTED";
    pub const QA_FIXING_COMPLETE: &str = "QA_FIXING_COMPLETE";
    pub const QA_MAX_ITERATIONS: &str = "QA_MAX_ITERATIONS";
    /// Generic daemon-originated event; the payload carries a `kind` field
    /// (e.g. `STUCK_RECOVERY`).
    pub const TASK_EVENT: &str = "TASK_EVENT";
}

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One record in a task's event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub sequence: u64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub payload: Value,
}

/// Append-only writer over a task's event log.
pub struct EventLog {
    path: PathBuf,
    next_sequence: u64,
}

impl EventLog {
    /// Open (or create) the event log for a spec directory.
    ///
    /// Scans the existing file to resume the sequence counter, so a process
    /// restart never produces gaps or duplicates.
    pub fn open(spec_dir: &Path) -> Result<Self, EventLogError> {
        let path = spec_dir.join(EVENTS_FILE);
        let next_sequence = match read_events(&path, 0) {
            Ok(events) => events.last().map(|e| e.sequence + 1).unwrap_or(1),
            Err(_) => 1,
        };
        Ok(Self {
            path,
            next_sequence,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event; returns its sequence number.
    pub fn append(&mut self, kind: &str, payload: Value) -> Result<u64, EventLogError> {
        let event = TaskEvent {
            sequence: self.next_sequence,
            ts: Utc::now(),
            kind: kind.to_string(),
            payload,
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;

        self.next_sequence += 1;
        Ok(event.sequence)
    }

    /// Append a `TASK_EVENT` with a payload kind (daemon-originated events).
    pub fn append_task_event(
        &mut self,
        payload_kind: &str,
        mut payload: Value,
    ) -> Result<u64, EventLogError> {
        if let Value::Object(ref mut map) = payload {
            map.insert("kind".to_string(), Value::String(payload_kind.to_string()));
        } else {
            payload = serde_json::json!({ "kind": payload_kind, "detail": payload });
        }
        self.append(kind::TASK_EVENT, payload)
    }

    /// Sequence the next append will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

/// Read events from a log file, skipping sequences at or below `checkpoint`.
///
/// A truncated trailing line (crash mid-append) is ignored; a corrupt line in
/// the middle of the file is skipped rather than aborting the read.
pub fn read_events(path: &Path, checkpoint: u64) -> Result<Vec<TaskEvent>, EventLogError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TaskEvent>(&line) {
            Ok(event) => {
                if event.sequence > checkpoint {
                    events.push(event);
                }
            }
            Err(_) => continue,
        }
    }
    Ok(events)
}

/// Last-modified time of a task's event log, used as a heartbeat source.
pub fn last_append_time(spec_dir: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(spec_dir.join(EVENTS_FILE))
        .and_then(|m| m.modified())
        .ok()
}
