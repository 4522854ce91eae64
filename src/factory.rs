// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Spec factory: child task creation for design decomposition.
//!
//! A design task's agent calls this through a tool with a batch of child
//! specs whose `dependsOn` entries are 1-based indices into the batch.
//! Resolution is two-pass: pass one allocates real spec ids from the
//! monotonic counter, pass two rewrites the batch indices into those ids.
//! A batch whose dependency graph has a cycle is rejected before anything
//! touches disk.
//!
//! The factory also repairs broken references left behind by interrupted
//! runs: sibling groups are re-resolved on daemon startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::plan::{normalize_list_field, Plan, PlanStore, PLAN_FILE};
use crate::types::{slugify, spec_id_number, TaskKind, TaskPriority};
use crate::PRIVATE_DIR;

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty batch")]
    EmptyBatch,

    #[error("Batch dependency cycle involving entry {0}")]
    DependencyCycle(usize),

    #[error("Batch entry {index} has invalid dependency reference `{reference}`")]
    BadReference { index: usize, reference: String },

    #[error("Child depth limit reached: {0}")]
    DepthLimit(String),

    #[error("Plan error: {0}")]
    Plan(String),
}

/// One child spec in a batch, as handed over by the design agent's tool
/// call. List-ish fields tolerate comma-separated strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    pub task: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub kind: Option<TaskKind>,
    /// 1-based indices into this batch, or pre-existing spec ids.
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Value,
    #[serde(default, rename = "filesToModify")]
    pub files_to_modify: Value,
    #[serde(default, rename = "acceptanceCriteria")]
    pub acceptance_criteria: Value,
}

/// Creates child spec directories under the project's specs dir.
pub struct SpecFactory {
    specs_dir: PathBuf,
    max_child_depth: u32,
}

impl SpecFactory {
    pub fn new(project_dir: &Path, max_child_depth: u32) -> Self {
        Self {
            specs_dir: project_dir.join(PRIVATE_DIR).join("specs"),
            max_child_depth,
        }
    }

    pub fn specs_dir(&self) -> &Path {
        &self.specs_dir
    }

    /// Create a batch of child specs for `parent_spec_id`.
    ///
    /// Returns the allocated spec ids in batch order. The parent's plan is
    /// updated with the child ids and the specs directory is touched so the
    /// daemon's watcher picks the children up.
    pub fn create_batch(
        &self,
        parent_spec_id: &str,
        batch: &[ChildSpec],
    ) -> Result<Vec<String>, FactoryError> {
        if batch.is_empty() {
            return Err(FactoryError::EmptyBatch);
        }

        // Validate references and reject cycles before touching disk.
        let index_deps = self.batch_index_dependencies(batch)?;
        check_acyclic(&index_deps)?;

        // Depth rule: a design/architecture child may not be created at a
        // depth that would exceed the cap.
        let parent_depth = self.depth_of(parent_spec_id);
        for (i, child) in batch.iter().enumerate() {
            let kind = child.kind.unwrap_or(TaskKind::Impl);
            if kind.decomposes() && parent_depth + 1 >= self.max_child_depth {
                return Err(FactoryError::DepthLimit(format!(
                    "batch entry {} ({kind}) at depth {}",
                    i + 1,
                    parent_depth + 1,
                )));
            }
        }

        std::fs::create_dir_all(&self.specs_dir)?;

        // Pass 1: allocate ids and write the spec directories with empty
        // dependsOn.
        let mut next_number = self.next_spec_number();
        let mut allocated: Vec<String> = Vec::with_capacity(batch.len());
        for child in batch {
            let spec_id = format!("{next_number:03}-{}", slugify(&child.task));
            next_number += 1;
            self.write_child_spec(parent_spec_id, &spec_id, child)?;
            allocated.push(spec_id);
        }

        // Pass 2: rewrite batch indices to real spec ids.
        for (i, child) in batch.iter().enumerate() {
            let deps = &index_deps[i];
            if deps.is_empty() && external_deps(child).is_empty() {
                continue;
            }
            let mut resolved: Vec<String> =
                deps.iter().map(|&index| allocated[index].clone()).collect();
            resolved.extend(external_deps(child));
            let store = PlanStore::new(self.specs_dir.join(&allocated[i]));
            store
                .update(|plan| plan.depends_on = resolved.clone())
                .map_err(|e| FactoryError::Plan(e.to_string()))?;
        }

        // Record child ids on the parent.
        let parent_store = PlanStore::new(self.specs_dir.join(parent_spec_id));
        if parent_store.exists() {
            parent_store
                .update(|plan| {
                    plan.extra.insert(
                        "childTasks".to_string(),
                        Value::Array(
                            allocated.iter().map(|id| Value::String(id.clone())).collect(),
                        ),
                    );
                })
                .map_err(|e| FactoryError::Plan(e.to_string()))?;
        }

        // Touch the specs dir so the watcher notices even when the
        // individual file events were coalesced away.
        let _ = touch_dir(&self.specs_dir);

        info!(parent = parent_spec_id, count = allocated.len(), "batch specs created");
        Ok(allocated)
    }

    /// Walk the `parentTask` chain to compute a task's depth.
    pub fn depth_of(&self, spec_id: &str) -> u32 {
        let mut depth = 0;
        let mut current = spec_id.to_string();
        while depth <= self.max_child_depth {
            let store = PlanStore::new(self.specs_dir.join(&current));
            match store.load_raw() {
                Ok(raw) => match raw.get("parentTask").and_then(Value::as_str) {
                    Some(parent) if !parent.is_empty() => {
                        depth += 1;
                        current = parent.to_string();
                    }
                    _ => break,
                },
                Err(_) => break,
            }
        }
        depth
    }

    /// Next number for a `NNN-slug` id, one above the highest in use.
    fn next_spec_number(&self) -> u32 {
        let mut max = 0;
        if let Ok(entries) = std::fs::read_dir(&self.specs_dir) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(number) = spec_id_number(name) {
                        max = max.max(number);
                    }
                }
            }
        }
        max + 1
    }

    fn write_child_spec(
        &self,
        parent_spec_id: &str,
        spec_id: &str,
        child: &ChildSpec,
    ) -> Result<(), FactoryError> {
        let dir = self.specs_dir.join(spec_id);
        std::fs::create_dir_all(&dir)?;
        let now = Utc::now();

        let criteria = normalize_list_field(&child.acceptance_criteria);
        let files = normalize_list_field(&child.files_to_modify);

        let pretty = |value: &serde_json::Value| {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        };

        // spec.md
        let mut spec_md = format!(
            "# {}\n\n> Parent Spec: `{parent_spec_id}`\n\n## Overview\n\n{}\n",
            child.task, child.task
        );
        if !criteria.is_empty() {
            spec_md.push_str("\n## Acceptance Criteria\n\n");
            for criterion in &criteria {
                spec_md.push_str(&format!("- [ ] {criterion}\n"));
            }
        }
        if !files.is_empty() {
            spec_md.push_str("\n## Files to Modify\n\n");
            for file in &files {
                spec_md.push_str(&format!("- `{file}`\n"));
            }
        }
        std::fs::write(dir.join("spec.md"), spec_md)?;

        // requirements.json
        let requirements = serde_json::json!({
            "task": child.task,
            "parentSpec": parent_spec_id,
            "filesToModify": files,
            "acceptanceCriteria": criteria,
            "createdAt": now.to_rfc3339(),
            "createdBy": "spec_factory",
        });
        std::fs::write(dir.join("requirements.json"), pretty(&requirements))?;

        // context.json
        let context = serde_json::json!({
            "parentSpec": parent_spec_id,
            "taskDescription": child.task,
            "createdAt": now.to_rfc3339(),
        });
        std::fs::write(dir.join("context.json"), pretty(&context))?;

        // implementation_plan.json, queued with empty dependsOn (pass 2
        // fills it in).
        let mut plan = Plan::queued(
            child.kind.unwrap_or(TaskKind::Impl),
            child.priority.map(TaskPriority::from).unwrap_or_default(),
        );
        plan.parent_task = Some(parent_spec_id.to_string());
        PlanStore::new(&dir)
            .save(&plan)
            .map_err(|e| FactoryError::Plan(e.to_string()))?;

        Ok(())
    }

    /// Per-entry 0-based batch-index dependencies. Entries that are not
    /// batch indices (pre-existing spec ids) are left for `external_deps`.
    fn batch_index_dependencies(
        &self,
        batch: &[ChildSpec],
    ) -> Result<Vec<Vec<usize>>, FactoryError> {
        let mut result = Vec::with_capacity(batch.len());
        for (i, child) in batch.iter().enumerate() {
            let refs = normalize_list_field(&child.depends_on);
            let mut indices = Vec::new();
            for reference in &refs {
                if let Ok(one_based) = reference.parse::<usize>() {
                    if one_based == 0 || one_based > batch.len() {
                        return Err(FactoryError::BadReference {
                            index: i + 1,
                            reference: reference.clone(),
                        });
                    }
                    indices.push(one_based - 1);
                } else if !self.specs_dir.join(reference).join(PLAN_FILE).exists() {
                    return Err(FactoryError::BadReference {
                        index: i + 1,
                        reference: reference.clone(),
                    });
                }
            }
            result.push(indices);
        }
        Ok(result)
    }

    /// Repair broken dependency references across all spec sibling groups.
    ///
    /// Invoked by the daemon on startup: fixes string-encoded arrays and
    /// re-resolves truncated refs (`"002-foo"` for an actual
    /// `"002-foo-long-slug"`) so dependency gating works after a crash.
    /// Safe to call repeatedly; correct references are left unchanged.
    pub fn repair_all_dependencies(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.specs_dir) else {
            return 0;
        };

        let mut all_ids: Vec<String> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if entry.path().join(PLAN_FILE).exists() {
                all_ids.push(name.to_string());
            }
        }

        let mut repaired = 0;
        for spec_id in &all_ids {
            let store = PlanStore::new(self.specs_dir.join(spec_id));
            let Ok(raw) = store.load_raw() else { continue };
            let raw_deps = raw.get("dependsOn").cloned().unwrap_or(Value::Null);
            let deps = normalize_list_field(&raw_deps);
            if deps.is_empty() {
                continue;
            }

            let mut changed = matches!(raw_deps, Value::String(_));
            let resolved: Vec<String> = deps
                .iter()
                .map(|dep| {
                    if all_ids.contains(dep) {
                        dep.clone()
                    } else if let Some(actual) = resolve_ref(dep, &all_ids) {
                        changed = true;
                        actual
                    } else {
                        dep.clone()
                    }
                })
                .collect();

            if changed {
                match store.update(|plan| plan.depends_on = resolved.clone()) {
                    Ok(_) => repaired += 1,
                    Err(e) => warn!(spec_id, error = %e, "dependency repair failed"),
                }
            }
        }
        repaired
    }
}

/// Pre-existing spec ids referenced by a batch entry (everything in its
/// dependsOn that is not a bare batch index).
fn external_deps(child: &ChildSpec) -> Vec<String> {
    normalize_list_field(&child.depends_on)
        .into_iter()
        .filter(|r| r.parse::<usize>().is_err())
        .collect()
}

/// Resolve a loose reference against known ids: zero-padded number prefix
/// first, then slug prefix.
fn resolve_ref(reference: &str, all_ids: &[String]) -> Option<String> {
    let lower = reference.to_lowercase();
    if let Some(number) = spec_id_number(reference) {
        let prefix = format!("{number:03}-");
        for id in all_ids {
            if id.starts_with(&prefix) && id.to_lowercase().starts_with(&lower) {
                return Some(id.clone());
            }
        }
        // A pure number reference matches any id with that prefix.
        if reference.chars().all(|c| c.is_ascii_digit()) {
            return all_ids.iter().find(|id| id.starts_with(&prefix)).cloned();
        }
    }
    if lower.len() >= 3 {
        return all_ids
            .iter()
            .find(|id| id.to_lowercase().starts_with(&lower))
            .cloned();
    }
    None
}

/// Kahn's check: error on the first entry left in a cycle.
fn check_acyclic(deps: &[Vec<usize>]) -> Result<(), FactoryError> {
    let n = deps.len();
    let mut indegree: Vec<usize> = deps.iter().map(Vec::len).collect();

    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut resolved = vec![false; n];
    let mut count = 0;
    while let Some(node) = ready.pop() {
        resolved[node] = true;
        count += 1;
        for (i, entry_deps) in deps.iter().enumerate() {
            if !resolved[i] && entry_deps.contains(&node) {
                indegree[i] -= 1;
                if indegree[i] == 0 {
                    ready.push(i);
                }
            }
        }
    }

    if count == n {
        Ok(())
    } else {
        let stuck = (0..n).find(|&i| !resolved[i]).unwrap_or(0);
        Err(FactoryError::DependencyCycle(stuck + 1))
    }
}

fn touch_dir(path: &Path) -> std::io::Result<()> {
    // Opening and closing a marker file bumps the directory mtime.
    let marker = path.join(".touch");
    std::fs::write(&marker, b"")?;
    std::fs::remove_file(&marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use tempfile::TempDir;

    fn factory(dir: &TempDir) -> SpecFactory {
        SpecFactory::new(dir.path(), 2)
    }

    fn child(task: &str, deps: Value) -> ChildSpec {
        ChildSpec {
            task: task.to_string(),
            priority: None,
            kind: None,
            depends_on: deps,
            files_to_modify: Value::Null,
            acceptance_criteria: Value::Null,
        }
    }

    fn write_parent(factory: &SpecFactory, spec_id: &str, kind: TaskKind) {
        let dir = factory.specs_dir().join(spec_id);
        std::fs::create_dir_all(&dir).unwrap();
        let plan = Plan::queued(kind, TaskPriority::Critical);
        PlanStore::new(&dir).save(&plan).unwrap();
    }

    #[test]
    fn test_batch_index_resolution() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        write_parent(&factory, "001-design", TaskKind::Design);

        let ids = factory
            .create_batch(
                "001-design",
                &[
                    child("Database schema", Value::Null),
                    child("Backend API", serde_json::json!(["1"])),
                    child("Frontend UI", serde_json::json!(["1", "2"])),
                ],
            )
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids[0].ends_with("database-schema"));

        let backend = PlanStore::new(factory.specs_dir().join(&ids[1])).load().unwrap();
        assert_eq!(backend.depends_on, vec![ids[0].clone()]);
        let frontend = PlanStore::new(factory.specs_dir().join(&ids[2])).load().unwrap();
        assert_eq!(frontend.depends_on, vec![ids[0].clone(), ids[1].clone()]);

        // Every child is queued with the parent recorded.
        for id in &ids {
            let plan = PlanStore::new(factory.specs_dir().join(id)).load().unwrap();
            assert_eq!(plan.status, TaskStatus::Queue);
            assert_eq!(plan.parent_task.as_deref(), Some("001-design"));
        }

        // Parent carries the child ids.
        let parent = PlanStore::new(factory.specs_dir().join("001-design"))
            .load_raw()
            .unwrap();
        assert_eq!(parent["childTasks"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_monotonic_numbering_continues() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        write_parent(&factory, "007-design", TaskKind::Design);

        let ids = factory
            .create_batch("007-design", &[child("First", Value::Null)])
            .unwrap();
        assert!(ids[0].starts_with("008-"));
    }

    #[test]
    fn test_cycle_rejected() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        write_parent(&factory, "001-design", TaskKind::Design);

        let err = factory
            .create_batch(
                "001-design",
                &[
                    child("A", serde_json::json!(["2"])),
                    child("B", serde_json::json!(["1"])),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, FactoryError::DependencyCycle(_)));
        // Nothing was created.
        let children: Vec<_> = std::fs::read_dir(factory.specs_dir())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_str() != Some("001-design"))
            .collect();
        assert!(children.is_empty());
    }

    #[test]
    fn test_out_of_range_reference_rejected() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        write_parent(&factory, "001-design", TaskKind::Design);

        let err = factory
            .create_batch("001-design", &[child("A", serde_json::json!(["5"]))])
            .unwrap_err();
        assert!(matches!(err, FactoryError::BadReference { .. }));
    }

    #[test]
    fn test_comma_string_dependencies_normalized() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        write_parent(&factory, "001-design", TaskKind::Design);

        let ids = factory
            .create_batch(
                "001-design",
                &[
                    child("A", Value::Null),
                    child("B", serde_json::json!("1")),
                ],
            )
            .unwrap();
        let b = PlanStore::new(factory.specs_dir().join(&ids[1])).load().unwrap();
        assert_eq!(b.depends_on, vec![ids[0].clone()]);
    }

    #[test]
    fn test_design_child_depth_cap() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        write_parent(&factory, "001-design", TaskKind::Design);

        // A level-1 design child is fine under max depth 2.
        let mut design_child = child("Sub design", Value::Null);
        design_child.kind = Some(TaskKind::Design);
        let ids = factory.create_batch("001-design", &[design_child.clone()]).unwrap();

        // But that child may not create a further design grandchild.
        let err = factory.create_batch(&ids[0], &[design_child]).unwrap_err();
        assert!(matches!(err, FactoryError::DepthLimit(_)));

        // A plain impl grandchild is fine.
        let ok = factory.create_batch(&ids[0], &[child("Leaf impl", Value::Null)]);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_repair_truncated_references() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        write_parent(&factory, "002-core-calculator-implementation-full", TaskKind::Impl);
        write_parent(&factory, "003-frontend", TaskKind::Impl);

        // The frontend references a truncated form of the core spec id.
        PlanStore::new(factory.specs_dir().join("003-frontend"))
            .update(|plan| plan.depends_on = vec!["002-core-calculator".to_string()])
            .unwrap();

        let repaired = factory.repair_all_dependencies();
        assert_eq!(repaired, 1);

        let plan = PlanStore::new(factory.specs_dir().join("003-frontend")).load().unwrap();
        assert_eq!(
            plan.depends_on,
            vec!["002-core-calculator-implementation-full".to_string()]
        );

        // Second run is a no-op.
        assert_eq!(factory.repair_all_dependencies(), 0);
    }

    #[test]
    fn test_check_acyclic() {
        assert!(check_acyclic(&[vec![], vec![0], vec![0, 1]]).is_ok());
        assert!(check_acyclic(&[vec![1], vec![0]]).is_err());
        assert!(check_acyclic(&[vec![0]]).is_err()); // self-loop
    }
}
