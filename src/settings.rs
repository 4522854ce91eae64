// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Layered settings resolution.
//!
//! Model and thinking budget resolve through three layers, later layers
//! winning:
//!
//! 1. built-in defaults, seeded by the agent definition's thinking default
//! 2. project settings (`.auto-claude/settings.yaml`), with per-phase
//!    overrides inside the project layer
//! 3. per-task overrides (`{specDir}/task_metadata.json`)
//!
//! Project deny patterns ride along unlayered; they feed the
//! session-permission layer of the exec policy. The environment helpers at
//! the bottom of this module (`MAX_CHILD_DEPTH`, `HEADLESS_BROWSER`,
//! `MARIONETTE_DISABLED`) are standalone switches for their specific
//! features, not a resolution layer. Credential storage and provider
//! selection belong to the session library.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings file inside the project-private directory.
pub const SETTINGS_FILE: &str = "settings.yaml";
/// Per-task override file inside a spec directory.
pub const TASK_METADATA_FILE: &str = "task_metadata.json";

/// Default model when no layer overrides it.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

// ============================================================================
// Thinking levels
// ============================================================================

/// Named thinking levels, convertible to token budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    None,
    Low,
    Medium,
    High,
    Ultrathink,
}

impl ThinkingLevel {
    /// Token budget for this level; `None` disables extended thinking.
    pub fn budget_tokens(&self) -> Option<u32> {
        match self {
            Self::None => None,
            Self::Low => Some(4_096),
            Self::Medium => Some(10_000),
            Self::High => Some(16_384),
            Self::Ultrathink => Some(31_999),
        }
    }
}

impl Default for ThinkingLevel {
    fn default() -> Self {
        Self::Medium
    }
}

// ============================================================================
// Layers
// ============================================================================

/// Per-phase overrides usable at the project or task layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingLevel>,
}

/// Project-level settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingLevel>,
    /// Skip the QA stage entirely for this project.
    #[serde(default)]
    pub skip_qa: bool,
    /// Merge QA-approved work into the base branch without waiting for
    /// human review. Off by default: tasks end at `human_review`.
    #[serde(default)]
    pub auto_merge: bool,
    /// Phase-keyed overrides: `plan`, `code`, `qa`.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub phases: std::collections::BTreeMap<String, PhaseOverrides>,
    /// Extra deny patterns applied at the session-permission layer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny_commands: Vec<String>,
}

impl ProjectSettings {
    /// Load from `{privateDir}/settings.yaml`; absent file means defaults.
    pub fn load(private_dir: &Path) -> Result<Self, ConfigError> {
        let path = private_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

/// Per-task overrides from `task_metadata.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingLevel>,
    #[serde(default, rename = "skipQa", skip_serializing_if = "Option::is_none")]
    pub skip_qa: Option<bool>,
}

impl TaskOverrides {
    pub fn load(spec_dir: &Path) -> Result<Self, ConfigError> {
        let path = spec_dir.join(TASK_METADATA_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Fully resolved settings handed to a stage context.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub model: String,
    pub thinking: ThinkingLevel,
    pub skip_qa: bool,
    pub auto_merge: bool,
    pub deny_commands: Vec<String>,
}

/// Resolve settings for one phase of one task.
///
/// `agent_default` is the thinking default from the agent definition; it
/// seeds layer 1 so that e.g. a reviewer thinks harder than a fixer unless
/// someone above says otherwise.
pub fn resolve(
    project: &ProjectSettings,
    task: &TaskOverrides,
    phase: &str,
    agent_default: ThinkingLevel,
) -> ResolvedSettings {
    let phase_overrides = project.phases.get(phase);

    let model = task
        .model
        .clone()
        .or_else(|| phase_overrides.and_then(|p| p.model.clone()))
        .or_else(|| project.model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let thinking = task
        .thinking
        .or_else(|| phase_overrides.and_then(|p| p.thinking))
        .or(project.thinking)
        .unwrap_or(agent_default);

    let skip_qa = task.skip_qa.unwrap_or(project.skip_qa);

    ResolvedSettings {
        model,
        thinking,
        skip_qa,
        auto_merge: project.auto_merge,
        deny_commands: project.deny_commands.clone(),
    }
}

/// `MAX_CHILD_DEPTH` env override for the CLI flag.
pub fn effective_max_child_depth(cli_value: u32) -> u32 {
    std::env::var("MAX_CHILD_DEPTH")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(cli_value)
}

/// `HEADLESS_BROWSER=true` forces the browser validator headless.
pub fn headless_browser_forced() -> bool {
    matches!(
        std::env::var("HEADLESS_BROWSER").as_deref(),
        Ok("true") | Ok("1") | Ok("yes")
    )
}

/// `MARIONETTE_DISABLED=true` disables the Flutter widget bridge.
pub fn marionette_disabled() -> bool {
    matches!(
        std::env::var("MARIONETTE_DISABLED").as_deref(),
        Ok("true") | Ok("1") | Ok("yes")
    )
}
