// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Independent QA validators.
//!
//! Each validator checks one aspect of quality and produces a
//! [`ValidatorResult`]. Selection is capability-driven; execution order
//! (build first, then runtime validators in parallel) belongs to the QA
//! loop, not to the validators themselves.
//!
//! `passed == false` only when a validator's central assertion failed.
//! Transport and setup failures produce `skipped = true` with a reason —
//! a validator that could not run must not block the loop.

pub mod api;
pub mod browser;
pub mod build;
pub mod db;

pub use api::ApiValidator;
pub use browser::BrowserValidator;
pub use build::BuildValidator;
pub use db::DatabaseValidator;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::project::{Capabilities, ProjectIndex};

/// Issue severity as reported by a validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Info
    }
}

/// Structured evidence captured by a validator run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorEvidence {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub console: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exit_codes: BTreeMap<String, i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_failed: Option<u32>,
    /// First-failure output, truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessibility_summary: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub probe_statuses: BTreeMap<String, u16>,
}

/// Output of one validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    pub summary: String,
    #[serde(default)]
    pub evidence: ValidatorEvidence,
    pub duration_ms: u64,
}

impl ValidatorResult {
    pub fn passed(name: &str, summary: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            skipped: false,
            skip_reason: None,
            severity: Severity::Info,
            summary: summary.into(),
            evidence: ValidatorEvidence::default(),
            duration_ms: 0,
        }
    }

    pub fn failed(name: &str, severity: Severity, summary: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            skipped: false,
            skip_reason: None,
            severity,
            summary: summary.into(),
            evidence: ValidatorEvidence::default(),
            duration_ms: 0,
        }
    }

    /// A validator that could not run. Note `passed` stays `true` so a
    /// setup failure never reads as an assertion failure downstream.
    pub fn skipped(name: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            name: name.to_string(),
            passed: true,
            skipped: true,
            skip_reason: Some(reason.clone()),
            severity: Severity::Info,
            summary: format!("skipped: {reason}"),
            evidence: ValidatorEvidence::default(),
            duration_ms: 0,
        }
    }

    pub fn with_evidence(mut self, evidence: ValidatorEvidence) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn timed(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// Everything a validator needs to run.
#[derive(Clone)]
pub struct ValidatorContext {
    /// Project root (the main repository).
    pub project_dir: PathBuf,
    /// Where to run commands: the task worktree when isolation is on,
    /// otherwise the project root.
    pub working_dir: PathBuf,
    pub spec_dir: PathBuf,
    pub capabilities: Capabilities,
    pub index: ProjectIndex,
    pub cancel: CancelToken,
}

/// The validator capability: selectability plus a run that always returns a
/// result (setup failure ⇒ `skipped`, not an error).
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;
    fn selectable(&self, capabilities: &Capabilities) -> bool;
    async fn run(&self, ctx: &ValidatorContext) -> ValidatorResult;
}

/// All validators applicable to a project, build validator first.
pub fn select_validators(capabilities: &Capabilities) -> Vec<Box<dyn Validator>> {
    let all: Vec<Box<dyn Validator>> = vec![
        Box::new(BuildValidator),
        Box::new(BrowserValidator),
        Box::new(ApiValidator),
        Box::new(DatabaseValidator),
    ];
    all.into_iter()
        .filter(|v| v.selectable(capabilities))
        .collect()
}

/// Format validator results as a markdown section for `qa_report.md`.
pub fn format_report(results: &[ValidatorResult]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let passed = results.iter().filter(|r| r.passed && !r.skipped).count();
    let skipped = results.iter().filter(|r| r.skipped).count();
    let mut out = String::from("# Validator Results\n\n");
    out.push_str(&format!(
        "**{passed}/{} validators passed ({skipped} skipped)**\n\n",
        results.len()
    ));
    for result in results {
        let status = if result.skipped {
            "SKIP"
        } else if result.passed {
            "PASS"
        } else {
            "FAIL"
        };
        out.push_str(&format!("### {} [{status}]\n\n{}\n\n", result.name, result.summary));
        if let Some(first_failure) = &result.evidence.first_failure {
            out.push_str(&format!("```\n{first_failure}\n```\n\n"));
        }
        if !result.evidence.screenshots.is_empty() {
            for shot in &result.evidence.screenshots {
                out.push_str(&format!("- screenshot: `{}`\n", shot.display()));
            }
            out.push('\n');
        }
        if !result.evidence.console.is_empty() {
            out.push_str("Console messages:\n\n");
            for line in result.evidence.console.iter().take(20) {
                out.push_str(&format!("- `{line}`\n"));
            }
            out.push('\n');
        }
    }
    out
}
