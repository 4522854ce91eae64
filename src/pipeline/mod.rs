// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Declarative stage DAG executor.
//!
//! A pipeline is a DAG of named stages. The engine topologically orders
//! them, runs independent stages of the same parallel group concurrently,
//! honors per-stage conditions, retries transient failures with backoff,
//! and observes cancellation between and inside stages.
//!
//! Built-in pipelines:
//!
//! | name     | stages                          |
//! |----------|---------------------------------|
//! | default  | build → qa (unless skip) → merge |
//! | design   | decompose                       |
//! | qa_only  | qa                              |
//! | mcts     | mcts_search → merge_best        |

pub mod mcts;
pub mod stages;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agents::AgentRegistry;
use crate::cancel::CancelToken;
use crate::error::AgentError;
use crate::events::{kind as event_kind, EventLog};
use crate::plan::PlanStore;
use crate::project::{Capabilities, ProjectIndex};
use crate::session::SessionFactory;
use crate::settings::ResolvedSettings;
use crate::worktree::WorktreeManager;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage `{stage}` depends on unknown stage `{dependency}`")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Pipeline has a dependency cycle at stage `{0}`")]
    Cycle(String),

    #[error("Stage `{stage}` failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Pipeline cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Agent(e) if e.is_transient())
    }
}

/// Result of one stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Ok,
    Skipped,
}

/// Structured outcome a stage hands back.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub detail: Value,
}

impl StageOutcome {
    pub fn ok(detail: Value) -> Self {
        Self {
            status: StageStatus::Ok,
            detail,
        }
    }

    pub fn skipped(reason: &str) -> Self {
        Self {
            status: StageStatus::Skipped,
            detail: serde_json::json!({ "skipped": reason }),
        }
    }
}

/// The work of one stage.
#[async_trait]
pub trait StageAction: Send + Sync {
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, PipelineError>;
}

/// Gate deciding whether a stage runs at all.
pub type StageCondition = Arc<dyn Fn(&StageContext) -> bool + Send + Sync>;

/// Per-stage retry bounds for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct StageRetry {
    pub max: u32,
    pub backoff_ms: u64,
}

impl Default for StageRetry {
    fn default() -> Self {
        Self {
            max: 3,
            backoff_ms: 2_000,
        }
    }
}

/// One node of the DAG.
pub struct Stage {
    pub name: String,
    pub depends_on: Vec<String>,
    /// Stages sharing a group value may run concurrently once their
    /// dependencies are satisfied; `None` runs alone.
    pub parallel_group: Option<u32>,
    pub condition: Option<StageCondition>,
    pub retry: StageRetry,
    pub action: Arc<dyn StageAction>,
}

impl Stage {
    pub fn new(name: &str, action: Arc<dyn StageAction>) -> Self {
        Self {
            name: name.to_string(),
            depends_on: Vec::new(),
            parallel_group: None,
            condition: None,
            retry: StageRetry::default(),
            action,
        }
    }

    pub fn after(mut self, dependency: &str) -> Self {
        self.depends_on.push(dependency.to_string());
        self
    }

    pub fn in_group(mut self, group: u32) -> Self {
        self.parallel_group = Some(group);
        self
    }

    pub fn when(mut self, condition: StageCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// A named DAG of stages.
pub struct Pipeline {
    pub name: String,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(name: &str, stages: Vec<Stage>) -> Self {
        Self {
            name: name.to_string(),
            stages,
        }
    }

    /// Structural validation: every dependency exists and the DAG has no
    /// cycle. Called by the engine before the first stage runs.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        for stage in &self.stages {
            for dependency in &stage.depends_on {
                if !names.contains(&dependency.as_str()) {
                    return Err(PipelineError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        // Kahn over stage indices.
        let index_of: HashMap<&str, usize> =
            names.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut indegree: Vec<usize> = self.stages.iter().map(|s| s.depends_on.len()).collect();
        let mut ready: Vec<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut seen = 0;
        let mut done = vec![false; self.stages.len()];
        while let Some(node) = ready.pop() {
            done[node] = true;
            seen += 1;
            for (i, stage) in self.stages.iter().enumerate() {
                if done[i] {
                    continue;
                }
                if stage
                    .depends_on
                    .iter()
                    .any(|d| index_of[d.as_str()] == node)
                {
                    indegree[i] -= 1;
                    if indegree[i] == 0 {
                        ready.push(i);
                    }
                }
            }
        }
        if seen != self.stages.len() {
            let stuck = done
                .iter()
                .position(|d| !d)
                .map(|i| self.stages[i].name.clone())
                .unwrap_or_default();
            return Err(PipelineError::Cycle(stuck));
        }
        Ok(())
    }
}

/// Everything a stage action receives.
#[derive(Clone)]
pub struct StageContext {
    pub spec_id: String,
    pub project_dir: PathBuf,
    /// Where the task's code lives: the worktree when isolation is on,
    /// otherwise the project root.
    pub working_dir: PathBuf,
    pub spec_dir: PathBuf,
    pub plan: PlanStore,
    /// Shared because parallel stages append concurrently.
    pub events: Arc<Mutex<EventLog>>,
    pub cancel: CancelToken,
    pub settings: ResolvedSettings,
    pub sessions: Arc<dyn SessionFactory>,
    pub registry: Arc<AgentRegistry>,
    pub capabilities: Capabilities,
    pub index: ProjectIndex,
    pub worktrees: Option<Arc<WorktreeManager>>,
    /// Serializes every merge into the main repository across the daemon.
    pub merge_lock: Arc<Mutex<()>>,
    pub max_child_depth: u32,
}

/// Report of a completed pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: String,
    pub stages: Vec<(String, StageStatus)>,
}

/// Runs one pipeline for one task.
pub struct PipelineEngine;

impl PipelineEngine {
    /// Execute the pipeline to completion or first failure.
    pub async fn run(
        pipeline: &Pipeline,
        ctx: &StageContext,
    ) -> Result<PipelineReport, PipelineError> {
        pipeline.validate()?;
        info!(pipeline = %pipeline.name, spec = %ctx.spec_id, "pipeline starting");

        let mut statuses: HashMap<String, StageStatus> = HashMap::new();

        while statuses.len() < pipeline.stages.len() {
            if ctx.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            // Ready stages: not yet run, all dependencies satisfied.
            let ready: Vec<&Stage> = pipeline
                .stages
                .iter()
                .filter(|stage| !statuses.contains_key(&stage.name))
                .filter(|stage| {
                    stage
                        .depends_on
                        .iter()
                        .all(|dependency| statuses.contains_key(dependency))
                })
                .collect();
            // A validated DAG always has a ready stage.
            let Some(first) = ready.first() else {
                return Err(PipelineError::Cycle(String::new()));
            };

            // A batch is either the first ready stage alone, or every ready
            // stage sharing its parallel group.
            let batch: Vec<&Stage> = match first.parallel_group {
                None => vec![*first],
                Some(group) => ready
                    .iter()
                    .copied()
                    .filter(|stage| stage.parallel_group == Some(group))
                    .collect(),
            };

            let runs = batch.iter().map(|&stage| Self::run_stage(stage, ctx));
            let results = futures::future::join_all(runs).await;

            for (stage, result) in batch.iter().zip(results) {
                let outcome = result?;
                statuses.insert(stage.name.clone(), outcome.status);
            }
        }

        let stages = pipeline
            .stages
            .iter()
            .map(|stage| (stage.name.clone(), statuses[&stage.name]))
            .collect();
        info!(pipeline = %pipeline.name, spec = %ctx.spec_id, "pipeline complete");
        Ok(PipelineReport {
            pipeline: pipeline.name.clone(),
            stages,
        })
    }

    async fn run_stage(stage: &Stage, ctx: &StageContext) -> Result<StageOutcome, PipelineError> {
        if let Some(condition) = &stage.condition {
            if !condition(ctx) {
                info!(stage = %stage.name, "condition false, stage skipped");
                ctx.events
                    .lock()
                    .await
                    .append(
                        event_kind::STAGE_COMPLETED,
                        serde_json::json!({ "stage": stage.name, "skipped": true }),
                    )
                    .ok();
                return Ok(StageOutcome::skipped("condition"));
            }
        }

        ctx.events
            .lock()
            .await
            .append(
                event_kind::STAGE_STARTED,
                serde_json::json!({ "stage": stage.name }),
            )
            .ok();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match stage.action.run(ctx).await {
                Ok(outcome) => {
                    ctx.events
                        .lock()
                        .await
                        .append(
                            event_kind::STAGE_COMPLETED,
                            serde_json::json!({
                                "stage": stage.name,
                                "detail": outcome.detail,
                                "attempts": attempt,
                            }),
                        )
                        .ok();
                    return Ok(outcome);
                }
                Err(error) if error.is_transient() && attempt < stage.retry.max => {
                    warn!(stage = %stage.name, attempt, error = %error, "transient stage failure");
                    ctx.events
                        .lock()
                        .await
                        .append(
                            event_kind::STAGE_RETRY,
                            serde_json::json!({
                                "stage": stage.name,
                                "attempt": attempt,
                                "error": error.to_string(),
                            }),
                        )
                        .ok();
                    let backoff = std::time::Duration::from_millis(
                        stage.retry.backoff_ms * 2u64.saturating_pow(attempt - 1),
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = ctx.cancel.cancelled() => return Err(PipelineError::Cancelled),
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Construct a built-in pipeline by name.
pub fn builtin(name: &str) -> Option<Pipeline> {
    match name {
        "default" => Some(Pipeline::new(
            "default",
            vec![
                Stage::new("build", Arc::new(stages::BuildStage)),
                Stage::new("qa", Arc::new(stages::QaStage))
                    .after("build")
                    .when(Arc::new(|ctx: &StageContext| !ctx.settings.skip_qa)),
                Stage::new("merge", Arc::new(stages::MergeStage)).after("qa"),
            ],
        )),
        "design" => Some(Pipeline::new(
            "design",
            vec![Stage::new("decompose", Arc::new(stages::DecomposeStage))],
        )),
        "qa_only" => Some(Pipeline::new(
            "qa_only",
            vec![Stage::new("qa", Arc::new(stages::QaStage))],
        )),
        "mcts" => Some(Pipeline::new(
            "mcts",
            vec![
                Stage::new("mcts_search", Arc::new(mcts::MctsSearchStage)),
                Stage::new("merge_best", Arc::new(mcts::MergeBestStage)).after("mcts_search"),
            ],
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRegistry;
    use crate::plan::{Plan, PlanStore};
    use crate::session::ScriptedFactory;
    use crate::settings::{ResolvedSettings, ThinkingLevel};
    use crate::types::{TaskKind, TaskPriority};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Recorder {
        name: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        fail_times: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StageAction for Recorder {
        async fn run(&self, _ctx: &StageContext) -> Result<StageOutcome, PipelineError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(PipelineError::Agent(AgentError::Network("flaky".into())));
            }
            self.order.lock().unwrap().push(self.name);
            Ok(StageOutcome::ok(serde_json::json!({})))
        }
    }

    fn recorder(
        name: &'static str,
        order: &Arc<std::sync::Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn StageAction> {
        Arc::new(Recorder {
            name,
            order: Arc::clone(order),
            fail_times: Arc::new(AtomicU32::new(0)),
        })
    }

    fn test_context(dir: &TempDir) -> StageContext {
        let spec_dir = dir.path().join("specs/001-t");
        std::fs::create_dir_all(&spec_dir).unwrap();
        let plan = PlanStore::new(&spec_dir);
        plan.save(&Plan::queued(TaskKind::Impl, TaskPriority::Normal))
            .unwrap();
        StageContext {
            spec_id: "001-t".into(),
            project_dir: dir.path().to_path_buf(),
            working_dir: dir.path().to_path_buf(),
            spec_dir: spec_dir.clone(),
            plan,
            events: Arc::new(Mutex::new(EventLog::open(&spec_dir).unwrap())),
            cancel: CancelToken::new(),
            settings: ResolvedSettings {
                model: "m".into(),
                thinking: ThinkingLevel::Medium,
                skip_qa: false,
                auto_merge: false,
                deny_commands: Vec::new(),
            },
            sessions: Arc::new(ScriptedFactory::new()),
            registry: Arc::new(AgentRegistry::with_defaults()),
            capabilities: Capabilities::default(),
            index: ProjectIndex::default(),
            worktrees: None,
            merge_lock: Arc::new(Mutex::new(())),
            max_child_depth: 2,
        }
    }

    #[tokio::test]
    async fn test_topological_order() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let pipeline = Pipeline::new(
            "t",
            vec![
                Stage::new("c", recorder("c", &order)).after("a").after("b"),
                Stage::new("a", recorder("a", &order)),
                Stage::new("b", recorder("b", &order)).after("a"),
            ],
        );

        PipelineEngine::run(&pipeline, &ctx).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            "t",
            vec![Stage::new("a", recorder("a", &order)).after("ghost")],
        );
        let err = PipelineEngine::run(&pipeline, &ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownDependency { .. }));
    }

    #[tokio::test]
    async fn test_cycle_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            "t",
            vec![
                Stage::new("a", recorder("a", &order)).after("b"),
                Stage::new("b", recorder("b", &order)).after("a"),
            ],
        );
        assert!(matches!(
            PipelineEngine::run(&pipeline, &ctx).await,
            Err(PipelineError::Cycle(_))
        ));
    }

    #[tokio::test]
    async fn test_condition_skips_stage() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let pipeline = Pipeline::new(
            "t",
            vec![
                Stage::new("a", recorder("a", &order)),
                Stage::new("b", recorder("b", &order))
                    .after("a")
                    .when(Arc::new(|_| false)),
                Stage::new("c", recorder("c", &order)).after("b"),
            ],
        );

        let report = PipelineEngine::run(&pipeline, &ctx).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "c"]);
        assert_eq!(report.stages[1], ("b".to_string(), StageStatus::Skipped));
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let flaky = Arc::new(Recorder {
            name: "flaky",
            order: Arc::clone(&order),
            fail_times: Arc::new(AtomicU32::new(2)),
        });
        let mut stage = Stage::new("flaky", flaky);
        stage.retry = StageRetry {
            max: 3,
            backoff_ms: 1,
        };
        let pipeline = Pipeline::new("t", vec![stage]);

        PipelineEngine::run(&pipeline, &ctx).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["flaky"]);

        // Retry count lands in the event log.
        let events =
            crate::events::read_events(&ctx.spec_dir.join("events.jsonl"), 0).unwrap();
        let retries = events
            .iter()
            .filter(|e| e.kind == event_kind::STAGE_RETRY)
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_parallel_group_runs_together() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let pipeline = Pipeline::new(
            "t",
            vec![
                Stage::new("seed", recorder("seed", &order)),
                Stage::new("p1", recorder("p1", &order)).after("seed").in_group(1),
                Stage::new("p2", recorder("p2", &order)).after("seed").in_group(1),
                Stage::new("final", recorder("final", &order))
                    .after("p1")
                    .after("p2"),
            ],
        );

        PipelineEngine::run(&pipeline, &ctx).await.unwrap();
        let seen = order.lock().unwrap().clone();
        assert_eq!(seen[0], "seed");
        assert_eq!(seen[3], "final");
        assert!(seen[1..3].contains(&"p1") && seen[1..3].contains(&"p2"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_run() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        ctx.cancel.cancel();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new("t", vec![Stage::new("a", recorder("a", &order))]);
        assert!(matches!(
            PipelineEngine::run(&pipeline, &ctx).await,
            Err(PipelineError::Cancelled)
        ));
    }

    #[test]
    fn test_builtin_names() {
        for name in ["default", "design", "qa_only", "mcts"] {
            assert!(builtin(name).is_some(), "{name} missing");
        }
        assert!(builtin("bogus").is_none());
    }
}
