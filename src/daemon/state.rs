// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Daemon state persistence.
//!
//! Recovery counts, completion tracking, and the parent/child hierarchy
//! survive restarts through `.daemon_state.json` in the specs directory,
//! written atomically. Completion lookups are O(1) against a shadow set.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::plan::atomic_write;
use crate::types::spec_id_number;

/// State file name inside the specs directory.
pub const STATE_FILE: &str = ".daemon_state.json";

/// Persistent daemon state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonState {
    #[serde(default)]
    pub recovery_counts: HashMap<String, u32>,
    #[serde(default)]
    pub error_counts: HashMap<String, u32>,
    #[serde(default)]
    pub last_errors: HashMap<String, String>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub task_hierarchy: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Manages [`DaemonState`] with atomic saves and fast lookups.
pub struct StateManager {
    path: PathBuf,
    state: DaemonState,
    completed: HashSet<String>,
}

impl StateManager {
    pub fn new(specs_dir: &Path) -> Self {
        Self {
            path: specs_dir.join(STATE_FILE),
            state: DaemonState::default(),
            completed: HashSet::new(),
        }
    }

    /// Load state from disk; a missing or corrupt file starts fresh.
    pub fn load(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
                match serde_json::from_str::<DaemonState>(text) {
                    Ok(state) => {
                        self.completed = state.completed_tasks.iter().cloned().collect();
                        self.state = state;
                    }
                    Err(e) => warn!(error = %e, "daemon state unreadable, starting fresh"),
                }
            }
            Err(_) => {}
        }
    }

    pub fn save(&mut self) {
        self.state.last_updated = Some(Utc::now().to_rfc3339());
        match serde_json::to_vec_pretty(&self.state) {
            Ok(bytes) => {
                if let Err(e) = atomic_write(&self.path, &bytes) {
                    warn!(error = %e, "daemon state save failed");
                }
            }
            Err(e) => warn!(error = %e, "daemon state serialization failed"),
        }
    }

    pub fn set_started_at(&mut self) {
        self.state.started_at = Some(Utc::now().to_rfc3339());
        self.save();
    }

    pub fn started_at(&self) -> Option<&str> {
        self.state.started_at.as_deref()
    }

    // ------------------------------------------------------------------
    // Recovery counts
    // ------------------------------------------------------------------

    pub fn recovery_count(&self, spec_id: &str) -> u32 {
        self.state.recovery_counts.get(spec_id).copied().unwrap_or(0)
    }

    pub fn increment_recovery(&mut self, spec_id: &str) -> u32 {
        let count = self.recovery_count(spec_id) + 1;
        self.state.recovery_counts.insert(spec_id.to_string(), count);
        self.save();
        count
    }

    pub fn reset_recovery(&mut self, spec_id: &str) {
        self.state.recovery_counts.remove(spec_id);
        self.state.error_counts.remove(spec_id);
        self.state.last_errors.remove(spec_id);
        self.save();
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    pub fn record_error(&mut self, spec_id: &str, error: &str) {
        *self.state.error_counts.entry(spec_id.to_string()).or_insert(0) += 1;
        self.state
            .last_errors
            .insert(spec_id.to_string(), error.to_string());
        self.save();
    }

    pub fn last_error(&self, spec_id: &str) -> Option<&str> {
        self.state.last_errors.get(spec_id).map(String::as_str)
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    pub fn mark_completed(&mut self, spec_id: &str) {
        if self.completed.insert(spec_id.to_string()) {
            self.state.completed_tasks.push(spec_id.to_string());
            self.save();
        }
    }

    pub fn is_completed(&self, spec_id: &str) -> bool {
        self.completed.contains(spec_id)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// All of `depends_on` satisfied?
    pub fn dependencies_met(&self, depends_on: &[String]) -> bool {
        depends_on.iter().all(|dep| self.dependency_met(dep))
    }

    /// Three-tier matching so truncated or number-only references still
    /// gate correctly:
    ///
    /// 1. exact id
    /// 2. number prefix: `"002"` or `"002-core"` matches `"002-core-full-slug"`
    /// 3. general prefix (length ≥ 3)
    fn dependency_met(&self, dep: &str) -> bool {
        if self.completed.contains(dep) {
            return true;
        }

        let dep_lower = dep.to_lowercase();
        if let Some(number) = spec_id_number(dep) {
            let prefix = format!("{number:03}-");
            for completed in &self.completed {
                let completed_lower = completed.to_lowercase();
                if completed_lower.starts_with(&prefix) {
                    if completed_lower.starts_with(&dep_lower) {
                        return true;
                    }
                    if dep.chars().all(|c| c.is_ascii_digit()) {
                        return true;
                    }
                }
            }
        }

        if dep_lower.len() >= 3 {
            return self
                .completed
                .iter()
                .any(|completed| completed.to_lowercase().starts_with(&dep_lower));
        }
        false
    }

    // ------------------------------------------------------------------
    // Hierarchy
    // ------------------------------------------------------------------

    pub fn add_child(&mut self, parent: &str, child: &str) {
        let children = self
            .state
            .task_hierarchy
            .entry(parent.to_string())
            .or_default();
        if !children.contains(&child.to_string()) {
            children.push(child.to_string());
            self.save();
        }
    }

    pub fn children_of(&self, parent: &str) -> &[String] {
        self.state
            .task_hierarchy
            .get(parent)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_state_survives_reload() {
        let dir = TempDir::new().unwrap();
        {
            let mut mgr = StateManager::new(dir.path());
            mgr.mark_completed("001-a");
            mgr.increment_recovery("002-b");
            mgr.increment_recovery("002-b");
            mgr.add_child("001-a", "003-c");
        }
        let mut mgr = StateManager::new(dir.path());
        mgr.load();
        assert!(mgr.is_completed("001-a"));
        assert_eq!(mgr.recovery_count("002-b"), 2);
        assert_eq!(mgr.children_of("001-a"), ["003-c"]);
    }

    #[test]
    fn test_mark_completed_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut mgr = StateManager::new(dir.path());
        mgr.mark_completed("001-a");
        mgr.mark_completed("001-a");
        assert_eq!(mgr.completed_count(), 1);
    }

    #[test]
    fn test_reset_recovery_clears_errors() {
        let dir = TempDir::new().unwrap();
        let mut mgr = StateManager::new(dir.path());
        mgr.increment_recovery("001-a");
        mgr.record_error("001-a", "boom");
        mgr.reset_recovery("001-a");
        assert_eq!(mgr.recovery_count("001-a"), 0);
        assert!(mgr.last_error("001-a").is_none());
    }

    #[test]
    fn test_dependency_matching_tiers() {
        let dir = TempDir::new().unwrap();
        let mut mgr = StateManager::new(dir.path());
        mgr.mark_completed("002-core-calculator-implementation");

        // Exact.
        assert!(mgr.dependencies_met(&["002-core-calculator-implementation".into()]));
        // Truncated number-prefixed reference.
        assert!(mgr.dependencies_met(&["002-core-calculator".into()]));
        // Pure number.
        assert!(mgr.dependencies_met(&["002".into()]));
        // General prefix without number.
        mgr.mark_completed("verify-002-core");
        assert!(mgr.dependencies_met(&["verify-002".into()]));
        // No match.
        assert!(!mgr.dependencies_met(&["003-frontend".into()]));
        // Too-short references never match loosely.
        assert!(!mgr.dependencies_met(&["ve".into()]));
    }

    #[test]
    fn test_empty_dependencies_met() {
        let dir = TempDir::new().unwrap();
        let mgr = StateManager::new(dir.path());
        assert!(mgr.dependencies_met(&[]));
    }

    #[test]
    fn test_corrupt_state_starts_fresh() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "not json at all").unwrap();
        let mut mgr = StateManager::new(dir.path());
        mgr.load();
        assert_eq!(mgr.completed_count(), 0);
    }
}
