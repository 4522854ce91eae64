// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Plan document store.
//!
//! `implementation_plan.json` is the single persisted document holding a
//! task's status and structure. Every write goes through a temp-file-plus-
//! rename sequence and is schema-validated before the replace, so a reader
//! at any instant sees either the pre-image or a valid post-image.
//!
//! Unknown fields are preserved round-trip: older and newer tooling can
//! share a specs directory without destroying each other's annotations.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::PlanSchemaError;
use crate::types::{ExecutionPhase, TaskKind, TaskPriority, TaskStatus, XstateState};

/// File name of the per-task plan document.
pub const PLAN_FILE: &str = "implementation_plan.json";

// ============================================================================
// Document structure
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl Default for SubtaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: SubtaskStatus,
    #[serde(default, rename = "filesToCreate", skip_serializing_if = "Vec::is_empty")]
    pub files_to_create: Vec<String>,
    #[serde(default, rename = "filesToModify", skip_serializing_if = "Vec::is_empty")]
    pub files_to_modify: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaStatus {
    Pending,
    Approved,
    Rejected,
    NeedsAttention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// QA iteration that recorded this issue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaSignoff {
    pub status: QaStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<QaIssue>,
    #[serde(default, rename = "reportFile", skip_serializing_if = "Option::is_none")]
    pub report_file: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Error annotation recorded on the plan when a task lands in `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanErrorEntry {
    pub kind: String,
    /// First 200 characters of the diagnostic.
    pub message: String,
    pub at: DateTime<Utc>,
}

/// The plan document. Field order here is the on-disk order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub status: TaskStatus,
    #[serde(rename = "xstateState")]
    pub xstate_state: XstateState,
    #[serde(rename = "executionPhase")]
    pub execution_phase: ExecutionPhase,
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, rename = "dependsOn", deserialize_with = "deserialize_list_field")]
    pub depends_on: Vec<String>,
    #[serde(default, rename = "parentTask", skip_serializing_if = "Option::is_none")]
    pub parent_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<PlanPhase>>,
    #[serde(default, rename = "qaSignoff", skip_serializing_if = "Option::is_none")]
    pub qa_signoff: Option<QaSignoff>,
    #[serde(default, rename = "worktreePath", skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<PlanErrorEntry>,
    #[serde(default, rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Fields this build does not know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Plan {
    /// A fresh queued plan for a task of the given kind.
    pub fn queued(kind: TaskKind, priority: TaskPriority) -> Self {
        let now = Utc::now();
        Self {
            status: TaskStatus::Queue,
            xstate_state: XstateState::Backlog,
            execution_phase: ExecutionPhase::Backlog,
            kind,
            priority,
            depends_on: Vec::new(),
            parent_task: None,
            phases: if kind.decomposes() { None } else { Some(Vec::new()) },
            qa_signoff: None,
            worktree_path: None,
            errors: Vec::new(),
            created_at: Some(now),
            updated_at: Some(now),
            extra: serde_json::Map::new(),
        }
    }

    /// Write both status twins plus the macro phase in one step.
    pub fn set_status(
        &mut self,
        status: TaskStatus,
        xstate: XstateState,
        phase: ExecutionPhase,
    ) {
        self.status = status;
        self.xstate_state = xstate;
        self.execution_phase = phase;
        self.updated_at = Some(Utc::now());
    }

    /// Record an error annotation, truncating the diagnostic to 200 chars.
    pub fn push_error(&mut self, kind: &str, diagnostic: &str) {
        let message: String = diagnostic.chars().take(200).collect();
        self.errors.push(PlanErrorEntry {
            kind: kind.to_string(),
            message,
            at: Utc::now(),
        });
    }

    /// (completed, total) over all subtasks in all phases.
    pub fn subtask_counts(&self) -> (usize, usize) {
        let mut completed = 0;
        let mut total = 0;
        if let Some(phases) = &self.phases {
            for phase in phases {
                for subtask in &phase.subtasks {
                    total += 1;
                    if subtask.status == SubtaskStatus::Completed {
                        completed += 1;
                    }
                }
            }
        }
        (completed, total)
    }

    /// Whether every subtask is completed (vacuously true with no phases).
    pub fn is_build_complete(&self) -> bool {
        let (completed, total) = self.subtask_counts();
        completed == total
    }

    /// Schema validation applied before every write and after every read.
    pub fn validate(&self) -> Result<(), PlanSchemaError> {
        if !self.status.twin_allows(&self.xstate_state) {
            return Err(PlanSchemaError::TwinMismatch {
                status: self.status.to_string(),
                xstate: self.xstate_state.to_string(),
            });
        }
        if self.kind.decomposes() {
            if let Some(phases) = &self.phases {
                if !phases.is_empty() {
                    return Err(PlanSchemaError::InvalidField {
                        field: "phases".to_string(),
                        message: format!(
                            "{} tasks must not carry phases",
                            self.kind
                        ),
                    });
                }
            }
        }
        for dep in &self.depends_on {
            if dep.trim().is_empty() {
                return Err(PlanSchemaError::InvalidField {
                    field: "dependsOn".to_string(),
                    message: "empty dependency reference".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// List-field normalization
// ============================================================================

/// Normalize a field that should be a list of strings but may arrive as a
/// JSON-encoded string (`"[\"a\"]"`), a comma-separated string, a bare
/// string, or null. Tool layers double-serialize lists often enough that
/// rejecting them would quarantine otherwise healthy plans.
pub fn normalize_list_field(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Vec::new();
            }
            if s.starts_with('[') {
                if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(s) {
                    return items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                }
            }
            if s.contains(',') {
                return s
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            vec![s.to_string()]
        }
        _ => Vec::new(),
    }
}

fn deserialize_list_field<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_list_field(&value))
}

// ============================================================================
// Store
// ============================================================================

/// Handle to one task's plan file with atomic, validated writes.
#[derive(Debug, Clone)]
pub struct PlanStore {
    spec_dir: PathBuf,
}

impl PlanStore {
    pub fn new(spec_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec_dir: spec_dir.into(),
        }
    }

    pub fn spec_dir(&self) -> &Path {
        &self.spec_dir
    }

    pub fn path(&self) -> PathBuf {
        self.spec_dir.join(PLAN_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Load and validate the plan.
    ///
    /// Tolerates a UTF-8 BOM. Never mutates the file: an unparsable plan is
    /// the caller's signal to quarantine the task, not to repair the file.
    pub fn load(&self) -> Result<Plan, PlanSchemaError> {
        let raw = self.load_raw()?;
        for field in ["status", "xstateState", "executionPhase", "kind"] {
            if raw.get(field).is_none() {
                return Err(PlanSchemaError::MissingField(field.to_string()));
            }
        }
        let plan: Plan = serde_json::from_value(raw)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Load the raw JSON document without schema validation.
    pub fn load_raw(&self) -> Result<Value, PlanSchemaError> {
        let path = self.path();
        if !path.exists() {
            return Err(PlanSchemaError::NotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(&path)?;
        let text = String::from_utf8_lossy(&bytes);
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
        Ok(serde_json::from_str(text)?)
    }

    /// Validate and atomically persist the plan.
    pub fn save(&self, plan: &Plan) -> Result<(), PlanSchemaError> {
        plan.validate()?;
        let json = serde_json::to_string_pretty(plan)
            .map_err(|e| PlanSchemaError::Parse(e.to_string()))?;
        atomic_write(&self.path(), json.as_bytes()).map_err(|e| PlanSchemaError::Io(e.to_string()))
    }

    /// Load-modify-save under the same validation rules.
    pub fn update<F>(&self, mutate: F) -> Result<Plan, PlanSchemaError>
    where
        F: FnOnce(&mut Plan),
    {
        let mut plan = self.load()?;
        mutate(&mut plan);
        plan.updated_at = Some(Utc::now());
        self.save(&plan)?;
        Ok(plan)
    }

    /// Transition the status twin (and macro phase) in one atomic write.
    pub fn update_status(
        &self,
        status: TaskStatus,
        xstate: XstateState,
        phase: ExecutionPhase,
    ) -> Result<Plan, PlanSchemaError> {
        self.update(|plan| plan.set_status(status, xstate, phase))
    }
}

/// Write bytes to `path` through a unique temp file plus rename.
///
/// The rename is retried with bounded backoff for platforms that cannot
/// replace a file that a reader currently holds open.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, bytes)?;

    let mut last_err = None;
    for attempt in 0..3 {
        match std::fs::rename(&tmp, path) {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt < 2 {
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
            }
        }
    }
    let _ = std::fs::remove_file(&tmp);
    Err(last_err.unwrap_or_else(|| std::io::Error::other("rename failed")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (PlanStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (PlanStore::new(dir.path()), dir)
    }

    #[test]
    fn test_round_trip_preserves_unknown_fields() {
        let (store, _dir) = store();
        let raw = serde_json::json!({
            "status": "queue",
            "xstateState": "backlog",
            "executionPhase": "backlog",
            "kind": "impl",
            "priority": 2,
            "dependsOn": [],
            "someFutureField": {"nested": true},
            "uiHint": "keep me"
        });
        std::fs::write(store.path(), serde_json::to_string(&raw).unwrap()).unwrap();

        let plan = store.load().unwrap();
        assert_eq!(plan.extra["someFutureField"]["nested"], true);
        store.save(&plan).unwrap();

        let reread = store.load_raw().unwrap();
        assert_eq!(reread["uiHint"], "keep me");
        assert_eq!(reread["someFutureField"]["nested"], true);
    }

    #[test]
    fn test_save_load_save_is_stable() {
        let (store, _dir) = store();
        let plan = Plan::queued(TaskKind::Impl, TaskPriority::Normal);
        store.save(&plan).unwrap();
        let first = std::fs::read(store.path()).unwrap();

        let loaded = store.load().unwrap();
        store.save(&loaded).unwrap();
        let second = std::fs::read(store.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_required_field() {
        let (store, _dir) = store();
        std::fs::write(
            store.path(),
            r#"{"status": "queue", "kind": "impl"}"#,
        )
        .unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, PlanSchemaError::MissingField(f) if f == "xstateState"));
    }

    #[test]
    fn test_twin_mismatch_rejected_on_write() {
        let (store, _dir) = store();
        let mut plan = Plan::queued(TaskKind::Impl, TaskPriority::Normal);
        plan.status = TaskStatus::Done;
        plan.xstate_state = XstateState::Coding;
        assert!(matches!(
            store.save(&plan),
            Err(PlanSchemaError::TwinMismatch { .. })
        ));
    }

    #[test]
    fn test_design_plan_must_not_carry_phases() {
        let mut plan = Plan::queued(TaskKind::Design, TaskPriority::Critical);
        assert!(plan.validate().is_ok());
        plan.phases = Some(vec![PlanPhase {
            name: "phase 1".into(),
            subtasks: Vec::new(),
            extra: serde_json::Map::new(),
        }]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_depends_on_normalization() {
        let cases = [
            (serde_json::json!(["002-a", "003-b"]), vec!["002-a", "003-b"]),
            (serde_json::json!("[\"002-a\", \"003-b\"]"), vec!["002-a", "003-b"]),
            (serde_json::json!("002-a, 003-b"), vec!["002-a", "003-b"]),
            (serde_json::json!("002-a"), vec!["002-a"]),
            (serde_json::json!(null), vec![]),
            (serde_json::json!(""), vec![]),
        ];
        for (input, expected) in cases {
            let got = normalize_list_field(&input);
            assert_eq!(got, expected, "input: {input}");
        }
    }

    #[test]
    fn test_string_encoded_depends_on_in_document() {
        let (store, _dir) = store();
        let raw = serde_json::json!({
            "status": "queue",
            "xstateState": "backlog",
            "executionPhase": "backlog",
            "kind": "impl",
            "dependsOn": "[\"001-base\"]"
        });
        std::fs::write(store.path(), raw.to_string()).unwrap();
        let plan = store.load().unwrap();
        assert_eq!(plan.depends_on, vec!["001-base"]);
    }

    #[test]
    fn test_bom_tolerated() {
        let (store, _dir) = store();
        let body = r#"{"status":"queue","xstateState":"backlog","executionPhase":"backlog","kind":"impl"}"#;
        std::fs::write(store.path(), format!("\u{feff}{body}")).unwrap();
        assert!(store.load().is_ok());
    }

    #[test]
    fn test_update_status_atomic_pair() {
        let (store, _dir) = store();
        store.save(&Plan::queued(TaskKind::Impl, TaskPriority::Normal)).unwrap();
        store
            .update_status(
                TaskStatus::InProgress,
                XstateState::Coding,
                ExecutionPhase::Coding,
            )
            .unwrap();
        let plan = store.load().unwrap();
        assert_eq!(plan.status, TaskStatus::InProgress);
        assert_eq!(plan.xstate_state, XstateState::Coding);
    }

    #[test]
    fn test_push_error_truncates() {
        let mut plan = Plan::queued(TaskKind::Impl, TaskPriority::Normal);
        plan.push_error("WorktreeError", &"x".repeat(500));
        assert_eq!(plan.errors[0].message.len(), 200);
    }

    #[test]
    fn test_subtask_counts() {
        let mut plan = Plan::queued(TaskKind::Impl, TaskPriority::Normal);
        plan.phases = Some(vec![PlanPhase {
            name: "p1".into(),
            subtasks: vec![
                Subtask {
                    id: "1-1".into(),
                    description: "a".into(),
                    status: SubtaskStatus::Completed,
                    files_to_create: vec![],
                    files_to_modify: vec![],
                    extra: serde_json::Map::new(),
                },
                Subtask {
                    id: "1-2".into(),
                    description: "b".into(),
                    status: SubtaskStatus::Pending,
                    files_to_create: vec![],
                    files_to_modify: vec![],
                    extra: serde_json::Map::new(),
                },
            ],
            extra: serde_json::Map::new(),
        }]);
        assert_eq!(plan.subtask_counts(), (1, 2));
        assert!(!plan.is_build_complete());
    }
}
