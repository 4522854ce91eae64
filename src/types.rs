// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core type definitions shared across the daemon.
//!
//! The central contract here is the status twin: `status` is the coarse
//! lifecycle label used for admission decisions, `xstateState` is the finer
//! UI-facing label. The two are derived by a fixed map and must always be
//! written together.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Task kinds
// ============================================================================

/// Kind of a task, driving agent selection and pipeline choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Generic implementation task.
    Impl,
    Frontend,
    Backend,
    Database,
    Api,
    Test,
    Integration,
    Docs,
    /// Decomposes a large project into child tasks.
    Design,
    Architecture,
    Research,
    Review,
    Planning,
    /// Post-completion verification of an implementation task.
    Verify,
    ErrorCheck,
    /// Search-based improvement over candidate branches.
    Mcts,
    /// Fallback for plans written by older tooling.
    #[serde(other)]
    Default,
}

impl TaskKind {
    /// Task kinds executed in read-only plan mode.
    pub fn is_plan_mode(&self) -> bool {
        matches!(
            self,
            Self::Design | Self::Architecture | Self::Planning | Self::Research | Self::Review
        )
    }

    /// Task kinds that trigger auto-verify after successful completion.
    pub fn triggers_verify(&self) -> bool {
        matches!(
            self,
            Self::Impl | Self::Frontend | Self::Backend | Self::Database | Self::Api
        )
    }

    /// Task kinds that decompose into child tasks and carry no phases.
    pub fn decomposes(&self) -> bool {
        matches!(self, Self::Design | Self::Architecture)
    }

    /// Name of the built-in pipeline for this kind.
    pub fn pipeline_name(&self) -> &'static str {
        match self {
            Self::Design | Self::Architecture => "design",
            Self::Verify => "qa_only",
            Self::Mcts => "mcts",
            _ => "default",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Impl => "impl",
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Database => "database",
            Self::Api => "api",
            Self::Test => "test",
            Self::Integration => "integration",
            Self::Docs => "docs",
            Self::Design => "design",
            Self::Architecture => "architecture",
            Self::Research => "research",
            Self::Review => "review",
            Self::Planning => "planning",
            Self::Verify => "verify",
            Self::ErrorCheck => "error_check",
            Self::Mcts => "mcts",
            Self::Default => "default",
        }
    }
}

impl Default for TaskKind {
    fn default() -> Self {
        Self::Default
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Priority
// ============================================================================

/// Task priority. Lower value means higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl From<u8> for TaskPriority {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Critical,
            1 => Self::High,
            2 => Self::Normal,
            _ => Self::Low,
        }
    }
}

impl From<TaskPriority> for u8 {
    fn from(value: TaskPriority) -> Self {
        value.as_u8()
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

// ============================================================================
// Status twin
// ============================================================================

/// Coarse lifecycle status of a task. Authoritative for admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Queue,
    Backlog,
    Queued,
    InProgress,
    AiReview,
    QaFixing,
    HumanReview,
    PlanReview,
    Done,
    Completed,
    Complete,
    Merged,
    PrCreated,
    Error,
    Failed,
    Stuck,
    /// A status string this build does not recognize. Preserved verbatim so
    /// the daemon never destroys information it cannot classify.
    Other(String),
}

impl TaskStatus {
    /// Statuses eligible for admission.
    pub fn is_queueable(&self) -> bool {
        matches!(self, Self::Queue | Self::Backlog | Self::Queued)
    }

    /// Terminal success statuses, satisfying `dependsOn` edges.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Completed | Self::Complete | Self::Merged | Self::PrCreated
        )
    }

    /// Terminal failure statuses.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error | Self::Failed | Self::Stuck)
    }

    /// Statuses that must not trigger auto-start.
    pub fn no_start(&self) -> bool {
        matches!(
            self,
            Self::InProgress | Self::AiReview | Self::QaFixing | Self::HumanReview | Self::PlanReview
        ) || self.is_completed()
            || self.is_error()
    }

    /// The default UI-facing twin for this status.
    ///
    /// `in_progress` is ambiguous between planning and coding; callers that
    /// know the macro phase pass it explicitly via [`XstateState`].
    pub fn default_xstate(&self) -> XstateState {
        match self {
            Self::Queue | Self::Backlog | Self::Queued => XstateState::Backlog,
            Self::InProgress => XstateState::Coding,
            Self::AiReview => XstateState::QaReview,
            Self::QaFixing => XstateState::QaFixing,
            Self::HumanReview => XstateState::HumanReview,
            Self::PlanReview => XstateState::PlanReview,
            Self::Done | Self::Completed | Self::Complete | Self::Merged | Self::PrCreated => {
                XstateState::Done
            }
            Self::Error | Self::Failed | Self::Stuck => XstateState::Error,
            Self::Other(_) => XstateState::Backlog,
        }
    }

    /// Whether `xstate` is a legal twin for this status per the fixed map.
    pub fn twin_allows(&self, xstate: &XstateState) -> bool {
        match self {
            Self::Queue | Self::Backlog | Self::Queued => *xstate == XstateState::Backlog,
            Self::InProgress => {
                matches!(xstate, XstateState::Planning | XstateState::Coding)
            }
            Self::AiReview => *xstate == XstateState::QaReview,
            Self::QaFixing => *xstate == XstateState::QaFixing,
            Self::HumanReview | Self::PlanReview => {
                matches!(xstate, XstateState::PlanReview | XstateState::HumanReview)
            }
            Self::Done | Self::Completed | Self::Complete | Self::Merged | Self::PrCreated => {
                *xstate == XstateState::Done
            }
            Self::Error | Self::Failed | Self::Stuck => *xstate == XstateState::Error,
            Self::Other(_) => true,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queue => "queue",
            Self::Backlog => "backlog",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::AiReview => "ai_review",
            Self::QaFixing => "qa_fixing",
            Self::HumanReview => "human_review",
            Self::PlanReview => "plan_review",
            Self::Done => "done",
            Self::Completed => "completed",
            Self::Complete => "complete",
            Self::Merged => "merged",
            Self::PrCreated => "pr_created",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Stuck => "stuck",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for TaskStatus {
    fn from(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "queue" => Self::Queue,
            "backlog" => Self::Backlog,
            "queued" => Self::Queued,
            "in_progress" => Self::InProgress,
            "ai_review" => Self::AiReview,
            "qa_fixing" => Self::QaFixing,
            "human_review" => Self::HumanReview,
            "plan_review" => Self::PlanReview,
            "done" => Self::Done,
            "completed" => Self::Completed,
            "complete" => Self::Complete,
            "merged" => Self::Merged,
            "pr_created" => Self::PrCreated,
            "error" => Self::Error,
            "failed" => Self::Failed,
            "stuck" => Self::Stuck,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// Finer UI-facing state. Authoritative for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XstateState {
    Backlog,
    Planning,
    Coding,
    QaReview,
    QaFixing,
    PlanReview,
    HumanReview,
    Done,
    Error,
}

impl XstateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::QaReview => "qa_review",
            Self::QaFixing => "qa_fixing",
            Self::PlanReview => "plan_review",
            Self::HumanReview => "human_review",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for XstateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current macro-phase of a running task, mirrored into the plan for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Backlog,
    Planning,
    Coding,
    QaReview,
    QaFixing,
    MergeConflict,
    Complete,
    Failed,
    HumanReview,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::QaReview => "qa_review",
            Self::QaFixing => "qa_fixing",
            Self::MergeConflict => "merge_conflict",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::HumanReview => "human_review",
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Spec identifiers
// ============================================================================

/// Validate a spec id of the form `NNN-slug` (or the synthesized
/// `verify-*` / child forms, which embed one).
pub fn is_valid_spec_id(id: &str) -> bool {
    if id.is_empty() || id.starts_with('.') {
        return false;
    }
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extract the numeric prefix of a spec id, if it has one.
pub fn spec_id_number(id: &str) -> Option<u32> {
    let digits: String = id.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Slugify a free-form task description into the `slug` part of a spec id.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for c in text.chars() {
        let lower = c.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            slug.push(lower);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-');
    slug.chars().take(50).collect::<String>().trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde_round_trip() {
        let json = serde_json::to_string(&TaskKind::ErrorCheck).unwrap();
        assert_eq!(json, "\"error_check\"");
        let kind: TaskKind = serde_json::from_str("\"impl\"").unwrap();
        assert_eq!(kind, TaskKind::Impl);
        // Unknown kinds fall back instead of failing the whole plan.
        let kind: TaskKind = serde_json::from_str("\"something_new\"").unwrap();
        assert_eq!(kind, TaskKind::Default);
    }

    #[test]
    fn test_kind_classification() {
        assert!(TaskKind::Design.is_plan_mode());
        assert!(TaskKind::Design.decomposes());
        assert!(!TaskKind::Impl.is_plan_mode());
        assert!(TaskKind::Frontend.triggers_verify());
        assert!(!TaskKind::Verify.triggers_verify());
        assert!(!TaskKind::ErrorCheck.triggers_verify());
    }

    #[test]
    fn test_pipeline_selection() {
        assert_eq!(TaskKind::Impl.pipeline_name(), "default");
        assert_eq!(TaskKind::Design.pipeline_name(), "design");
        assert_eq!(TaskKind::Verify.pipeline_name(), "qa_only");
        assert_eq!(TaskKind::Mcts.pipeline_name(), "mcts");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Normal);
        assert_eq!(TaskPriority::from(0), TaskPriority::Critical);
        assert_eq!(TaskPriority::from(9), TaskPriority::Low);
        let json = serde_json::to_string(&TaskPriority::High).unwrap();
        assert_eq!(json, "1");
    }

    #[test]
    fn test_status_sets() {
        assert!(TaskStatus::Queue.is_queueable());
        assert!(TaskStatus::Backlog.is_queueable());
        assert!(!TaskStatus::InProgress.is_queueable());
        assert!(TaskStatus::Done.is_completed());
        assert!(TaskStatus::Merged.is_completed());
        assert!(TaskStatus::Stuck.is_error());
        assert!(TaskStatus::InProgress.no_start());
        assert!(TaskStatus::Error.no_start());
        assert!(!TaskStatus::Queue.no_start());
    }

    #[test]
    fn test_status_preserves_unknown() {
        let status = TaskStatus::from("weird_custom_state");
        assert_eq!(status.as_str(), "weird_custom_state");
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"weird_custom_state\"");
    }

    #[test]
    fn test_twin_map() {
        assert!(TaskStatus::Queue.twin_allows(&XstateState::Backlog));
        assert!(TaskStatus::InProgress.twin_allows(&XstateState::Planning));
        assert!(TaskStatus::InProgress.twin_allows(&XstateState::Coding));
        assert!(!TaskStatus::InProgress.twin_allows(&XstateState::Done));
        assert!(TaskStatus::AiReview.twin_allows(&XstateState::QaReview));
        assert!(TaskStatus::HumanReview.twin_allows(&XstateState::PlanReview));
        assert!(TaskStatus::HumanReview.twin_allows(&XstateState::HumanReview));
        assert!(TaskStatus::Done.twin_allows(&XstateState::Done));
        assert!(!TaskStatus::Done.twin_allows(&XstateState::Error));
    }

    #[test]
    fn test_spec_id_helpers() {
        assert!(is_valid_spec_id("001-add-login"));
        assert!(is_valid_spec_id("verify-001-add-login-2"));
        assert!(!is_valid_spec_id(".hidden"));
        assert!(!is_valid_spec_id("has space"));
        assert_eq!(spec_id_number("012-thing"), Some(12));
        assert_eq!(spec_id_number("verify-012"), None);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Implement User Auth!"), "implement-user-auth");
        assert_eq!(slugify("  API / v2  "), "api-v2");
        let long = "x".repeat(80);
        assert!(slugify(&long).len() <= 50);
    }
}
