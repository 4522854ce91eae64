// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Built-in stage actions: build, qa, merge, decompose.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{PipelineError, StageAction, StageContext, StageOutcome};
use crate::agents::{AgentKind, ExecPolicy, ExecRequest, PolicyDecision};
use crate::events::kind as event_kind;
use crate::factory::{ChildSpec, SpecFactory};
use crate::qa::{QaConfig, QaContext, QaLoop, QaVerdict};
use crate::session::{
    retry_transient, RetryPolicy, SessionDriver, SessionEvent, SessionOutcome, SessionRequest,
    SessionStatus,
};
use crate::types::{ExecutionPhase, TaskStatus, XstateState};
use crate::worktree::MergeOutcome;

/// Hard cap on coder sessions per build stage.
const MAX_CODER_SESSIONS: u32 = 20;
/// Consecutive coder sessions without subtask progress before giving up.
const MAX_STALLED_SESSIONS: u32 = 2;

fn stage_err(stage: &str, message: impl std::fmt::Display) -> PipelineError {
    PipelineError::StageFailed {
        stage: stage.to_string(),
        message: message.to_string(),
    }
}

/// Start and drive one agent session inside a stage, in the task's
/// working directory.
pub(crate) async fn run_agent(
    ctx: &StageContext,
    agent: AgentKind,
    prompt: String,
) -> Result<SessionOutcome, PipelineError> {
    let working_dir = ctx.working_dir.clone();
    run_agent_in(ctx, agent, &working_dir, prompt).await
}

/// Start and drive one agent session in an explicit working directory
/// (the merge resolver operates on the main repository).
///
/// Every bash tool call crossing the stream is evaluated against the
/// agent's exec policy. Enforcement happens at the session boundary; a
/// violation observed here is recorded so reviewers see what was refused.
pub(crate) async fn run_agent_in(
    ctx: &StageContext,
    agent: AgentKind,
    working_dir: &std::path::Path,
    prompt: String,
) -> Result<SessionOutcome, PipelineError> {
    let definition = ctx.registry.get(agent);
    let request = SessionRequest::new(agent, working_dir, &ctx.spec_dir)
        .with_model(ctx.settings.model.clone())
        .with_thinking(definition.thinking_default)
        .with_tools(definition.all_tools())
        .with_prompt(prompt);

    let policy = ExecPolicy::for_agent(definition, &ctx.settings.deny_commands);
    let in_worktree = ctx.worktrees.is_some() && working_dir != ctx.project_dir;
    let main_branch = ctx
        .worktrees
        .as_ref()
        .map(|w| w.base_branch().to_string())
        .unwrap_or_else(|| "main".to_string());

    let sessions = Arc::clone(&ctx.sessions);
    let cancel = ctx.cancel.clone();
    let mut session = retry_transient(RetryPolicy::default(), &ctx.cancel, || {
        let sessions = Arc::clone(&sessions);
        let request = request.clone();
        let cancel = cancel.clone();
        async move { sessions.start(request, cancel).await }
    })
    .await?;

    let mut events = ctx.events.lock().await;
    let mut driver = SessionDriver::new(&mut events, ctx.cancel.clone());
    let outcome = driver
        .drive_with(&mut session, |event| {
            if let SessionEvent::ToolCall { name, input, .. } = event {
                if name != "bash" {
                    return;
                }
                let Some(command) = input.get("command").and_then(Value::as_str) else {
                    return;
                };
                let decision = policy.evaluate(&ExecRequest {
                    command,
                    in_worktree,
                    main_branch: &main_branch,
                });
                if let PolicyDecision::Deny { layer, reason } = decision {
                    warn!(agent = %agent, ?layer, reason = %reason, command = %command,
                        "exec policy violation");
                }
            }
        })
        .await?;
    Ok(outcome)
}

/// Like [`run_agent`], but hands tool calls to a callback so the stage can
/// service core-owned tools.
pub(crate) async fn run_agent_with<F>(
    ctx: &StageContext,
    agent: AgentKind,
    prompt: String,
    on_tool_call: F,
) -> Result<SessionOutcome, PipelineError>
where
    F: FnMut(&SessionEvent),
{
    let definition = ctx.registry.get(agent);
    let request = SessionRequest::new(agent, &ctx.working_dir, &ctx.spec_dir)
        .with_model(ctx.settings.model.clone())
        .with_thinking(definition.thinking_default)
        .with_tools(definition.all_tools())
        .with_prompt(prompt);

    let sessions = Arc::clone(&ctx.sessions);
    let cancel = ctx.cancel.clone();
    let mut session = retry_transient(RetryPolicy::default(), &ctx.cancel, || {
        let sessions = Arc::clone(&sessions);
        let request = request.clone();
        let cancel = cancel.clone();
        async move { sessions.start(request, cancel).await }
    })
    .await?;

    let mut events = ctx.events.lock().await;
    let mut driver = SessionDriver::new(&mut events, ctx.cancel.clone());
    Ok(driver.drive_with(&mut session, on_tool_call).await?)
}

fn spec_text(ctx: &StageContext) -> String {
    std::fs::read_to_string(ctx.spec_dir.join("spec.md")).unwrap_or_default()
}

// ============================================================================
// Build
// ============================================================================

/// Planning then implementation: the planner fills the plan's phases, then
/// coder sessions run until every subtask is completed or progress stalls.
pub struct BuildStage;

#[async_trait]
impl StageAction for BuildStage {
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, PipelineError> {
        let plan = ctx.plan.load().map_err(|e| stage_err("build", e))?;
        if plan.kind.decomposes() {
            return Err(stage_err("build", "design tasks use the design pipeline"));
        }

        let needs_planning = plan.phases.as_ref().map(Vec::is_empty).unwrap_or(true);
        if needs_planning {
            ctx.plan
                .update_status(
                    TaskStatus::InProgress,
                    XstateState::Planning,
                    ExecutionPhase::Planning,
                )
                .map_err(|e| stage_err("build", e))?;

            let outcome = run_agent(
                ctx,
                AgentKind::Planner,
                format!(
                    "Plan the implementation of this task. Break the work into phases \
                     and subtasks and record them in implementation_plan.json.\n\n{}",
                    spec_text(ctx)
                ),
            )
            .await?;

            // Artifact first: a transport error with phases on disk is a
            // successful planning pass.
            let plan = ctx.plan.load().map_err(|e| stage_err("build", e))?;
            let has_phases = plan.phases.as_ref().map(|p| !p.is_empty()).unwrap_or(false);
            if !has_phases {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "planner produced no phases".to_string());
                return Err(stage_err("build", message));
            }
        }

        ctx.plan
            .update_status(
                TaskStatus::InProgress,
                XstateState::Coding,
                ExecutionPhase::Coding,
            )
            .map_err(|e| stage_err("build", e))?;

        let mut sessions = 0u32;
        let mut stalled = 0u32;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let plan = ctx.plan.load().map_err(|e| stage_err("build", e))?;
            let (done, total) = plan.subtask_counts();
            if done == total {
                ctx.events
                    .lock()
                    .await
                    .append(
                        event_kind::PHASE_COMPLETED,
                        serde_json::json!({ "phase": "coding", "subtasks": total }),
                    )
                    .ok();
                return Ok(StageOutcome::ok(
                    serde_json::json!({ "subtasksCompleted": total }),
                ));
            }
            if sessions >= MAX_CODER_SESSIONS {
                return Err(stage_err(
                    "build",
                    format!("{done}/{total} subtasks after {sessions} coder sessions"),
                ));
            }

            let pending: Vec<String> = plan
                .phases
                .iter()
                .flatten()
                .flat_map(|phase| &phase.subtasks)
                .filter(|s| s.status != crate::plan::SubtaskStatus::Completed)
                .map(|s| format!("{}: {}", s.id, s.description))
                .collect();

            let outcome = run_agent(
                ctx,
                AgentKind::Coder,
                format!(
                    "Implement the next pending subtasks, updating their status in \
                     implementation_plan.json as you complete them. Commit your work.\n\n\
                     Pending subtasks:\n{}",
                    pending.join("\n")
                ),
            )
            .await?;
            sessions += 1;

            let (after, _) = ctx
                .plan
                .load()
                .map_err(|e| stage_err("build", e))?
                .subtask_counts();
            if after <= done {
                stalled += 1;
                warn!(stalled, "coder session completed no subtasks");
                if stalled >= MAX_STALLED_SESSIONS {
                    let message = outcome
                        .error
                        .unwrap_or_else(|| "coder sessions stopped making progress".to_string());
                    return Err(stage_err("build", message));
                }
            } else {
                stalled = 0;
            }
        }
    }
}

// ============================================================================
// QA
// ============================================================================

/// Runs the QA loop; the loop owns the terminal status transitions.
pub struct QaStage;

#[async_trait]
impl StageAction for QaStage {
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, PipelineError> {
        let qa_ctx = QaContext {
            project_dir: ctx.project_dir.clone(),
            working_dir: ctx.working_dir.clone(),
            spec_dir: ctx.spec_dir.clone(),
            plan: ctx.plan.clone(),
            capabilities: ctx.capabilities,
            index: ctx.index.clone(),
            sessions: Arc::clone(&ctx.sessions),
            registry: Arc::clone(&ctx.registry),
            settings: ctx.settings.clone(),
            cancel: ctx.cancel.clone(),
        };

        let mut events = ctx.events.lock().await;
        let verdict = QaLoop::new(QaConfig::default())
            .run(&qa_ctx, &mut events)
            .await?;

        Ok(StageOutcome::ok(serde_json::json!({
            "approved": verdict == QaVerdict::Approved,
        })))
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Merge the task branch back into the base branch, serialized across the
/// daemon by the project-wide merge mutex. Conflicts get one constrained
/// `merge_resolver` session; anything left after that escalates to human
/// review with a merge-conflict annotation.
pub struct MergeStage;

#[async_trait]
impl StageAction for MergeStage {
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, PipelineError> {
        if !ctx.settings.auto_merge {
            return Ok(StageOutcome::skipped("awaiting human review"));
        }
        let plan = ctx.plan.load().map_err(|e| stage_err("merge", e))?;
        let approved = ctx.settings.skip_qa
            || plan
                .qa_signoff
                .as_ref()
                .map(|s| s.status == crate::plan::QaStatus::Approved)
                .unwrap_or(false);
        if !approved {
            return Ok(StageOutcome::skipped("QA not approved"));
        }
        let Some(worktrees) = ctx.worktrees.as_ref() else {
            return Ok(StageOutcome::skipped("worktree isolation disabled"));
        };

        let _guard = ctx.merge_lock.lock().await;
        info!(spec = %ctx.spec_id, "merging task branch");

        let mut outcome = worktrees
            .merge_back(&ctx.spec_id)
            .await
            .map_err(|e| stage_err("merge", e))?;

        if let MergeOutcome::Conflicts(files) = &outcome {
            let files = files.clone();
            info!(conflicts = files.len(), "merge conflicts, invoking resolver");
            let resolver = run_agent_in(
                ctx,
                AgentKind::MergeResolver,
                &ctx.project_dir,
                format!(
                    "Resolve the merge conflicts in the main repository and conclude \
                     the merge with a commit. Conflicting files:\n{}",
                    files.join("\n")
                ),
            )
            .await;

            outcome = match resolver {
                Ok(result) if result.status == SessionStatus::Success => {
                    // Re-check: the resolver concludes the merge itself.
                    match worktrees.merge_back(&ctx.spec_id).await {
                        Ok(result) => result,
                        Err(_) => MergeOutcome::Conflicts(files),
                    }
                }
                _ => MergeOutcome::Conflicts(files),
            };
        }

        match outcome {
            MergeOutcome::Merged | MergeOutcome::UpToDate => {
                if let Err(e) = worktrees.destroy(&ctx.spec_id).await {
                    warn!(error = %e, "worktree cleanup failed after merge");
                }
                ctx.plan
                    .update(|plan| {
                        plan.worktree_path = None;
                        plan.set_status(
                            TaskStatus::Done,
                            XstateState::Done,
                            ExecutionPhase::Complete,
                        );
                    })
                    .map_err(|e| stage_err("merge", e))?;
                Ok(StageOutcome::ok(serde_json::json!({ "merged": true })))
            }
            MergeOutcome::Conflicts(files) => {
                let _ = worktrees.abort_merge().await;
                ctx.plan
                    .update(|plan| {
                        plan.extra.insert(
                            "mergeConflict".to_string(),
                            serde_json::json!({ "files": files.clone() }),
                        );
                        plan.set_status(
                            TaskStatus::HumanReview,
                            XstateState::HumanReview,
                            ExecutionPhase::MergeConflict,
                        );
                    })
                    .map_err(|e| stage_err("merge", e))?;
                Ok(StageOutcome::ok(serde_json::json!({
                    "merged": false,
                    "conflicts": files,
                })))
            }
        }
    }
}

// ============================================================================
// Decompose
// ============================================================================

/// Tool names the design agent uses to create child specs.
const BATCH_TOOL: &str = "create_batch_child_specs";
const SINGLE_TOOL: &str = "create_child_spec";

/// Drives the design agent and services its spec-factory tool calls.
pub struct DecomposeStage;

#[async_trait]
impl StageAction for DecomposeStage {
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, PipelineError> {
        ctx.plan
            .update_status(
                TaskStatus::InProgress,
                XstateState::Planning,
                ExecutionPhase::Planning,
            )
            .map_err(|e| stage_err("decompose", e))?;

        let factory = SpecFactory::new(&ctx.project_dir, ctx.max_child_depth);
        let parent = ctx.spec_id.clone();
        let mut created: Vec<String> = Vec::new();
        let mut tool_errors: Vec<String> = Vec::new();

        let outcome = run_agent_with(
            ctx,
            AgentKind::DesignArchitect,
            format!(
                "Decompose this project into implementation tasks using the \
                 {BATCH_TOOL} tool. Reference dependencies between batch entries \
                 by their 1-based position in the batch.\n\n{}",
                spec_text(ctx)
            ),
            |event| {
                if let SessionEvent::ToolCall { name, input, .. } = event {
                    if name == BATCH_TOOL || name == SINGLE_TOOL {
                        match parse_batch(input) {
                            Ok(batch) => match factory.create_batch(&parent, &batch) {
                                Ok(ids) => created.extend(ids),
                                Err(e) => tool_errors.push(e.to_string()),
                            },
                            Err(e) => tool_errors.push(e),
                        }
                    }
                }
            },
        )
        .await?;

        for error in &tool_errors {
            warn!(error = %error, "spec factory tool call failed");
        }

        // Artifact first: children on disk make the stage a success even if
        // the session transport died afterwards.
        if created.is_empty() {
            let message = outcome
                .error
                .or_else(|| tool_errors.into_iter().next())
                .unwrap_or_else(|| "design session created no child specs".to_string());
            return Err(stage_err("decompose", message));
        }

        ctx.plan
            .update(|plan| {
                plan.set_status(
                    TaskStatus::Complete,
                    XstateState::Done,
                    ExecutionPhase::Complete,
                );
            })
            .map_err(|e| stage_err("decompose", e))?;

        ctx.events
            .lock()
            .await
            .append_task_event(
                "CHILDREN_CREATED",
                serde_json::json!({ "count": created.len(), "children": created.clone() }),
            )
            .ok();

        Ok(StageOutcome::ok(serde_json::json!({ "children": created })))
    }
}

/// Accepts `{"specs": [...]}` or a bare array of child entries.
fn parse_batch(input: &Value) -> Result<Vec<ChildSpec>, String> {
    let list = input
        .get("specs")
        .cloned()
        .unwrap_or_else(|| input.clone());
    match list {
        Value::Array(_) => {
            serde_json::from_value::<Vec<ChildSpec>>(list).map_err(|e| e.to_string())
        }
        Value::Object(_) => serde_json::from_value::<ChildSpec>(list)
            .map(|one| vec![one])
            .map_err(|e| e.to_string()),
        _ => Err("tool input is neither a batch nor a single spec".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRegistry;
    use crate::plan::{Plan, PlanPhase, PlanStore, Subtask, SubtaskStatus};
    use crate::project::{Capabilities, ProjectIndex};
    use crate::session::ScriptedFactory;
    use crate::settings::{ResolvedSettings, ThinkingLevel};
    use crate::types::{TaskKind, TaskPriority};
    use crate::{cancel::CancelToken, events::EventLog};
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    fn context(dir: &TempDir, kind: TaskKind, factory: Arc<ScriptedFactory>) -> StageContext {
        let spec_dir = dir.path().join(".auto-claude/specs/001-task");
        std::fs::create_dir_all(&spec_dir).unwrap();
        let plan = PlanStore::new(&spec_dir);
        plan.save(&Plan::queued(kind, TaskPriority::Normal)).unwrap();
        StageContext {
            spec_id: "001-task".into(),
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
            sessions: factory,
            registry: Arc::new(AgentRegistry::with_defaults()),
            capabilities: Capabilities::default(),
            index: ProjectIndex::default(),
            worktrees: None,
            merge_lock: Arc::new(Mutex::new(())),
            max_child_depth: 2,
        }
    }

    fn one_subtask_phase(status: SubtaskStatus) -> Vec<PlanPhase> {
        vec![PlanPhase {
            name: "phase 1".into(),
            subtasks: vec![Subtask {
                id: "1-1".into(),
                description: "do the thing".into(),
                status,
                files_to_create: vec![],
                files_to_modify: vec![],
                extra: serde_json::Map::new(),
            }],
            extra: serde_json::Map::new(),
        }]
    }

    fn ok_session(id: &str) -> Vec<SessionEvent> {
        vec![
            SessionEvent::SessionStart {
                session_id: id.to_string(),
            },
            SessionEvent::SessionEnd {
                status: SessionStatus::Success,
                tokens_in: 1,
                tokens_out: 1,
                tool_count: 1,
                error: None,
            },
        ]
    }

    #[tokio::test]
    async fn test_build_planner_then_coder() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = context(&dir, TaskKind::Impl, Arc::clone(&factory));

        // Planner writes phases when driven.
        let plan = ctx.plan.clone();
        factory.push_session_with(ok_session("plan"), move || {
            plan.update(|p| p.phases = Some(one_subtask_phase(SubtaskStatus::Pending)))
                .unwrap();
        });
        // Coder completes the subtask.
        let plan = ctx.plan.clone();
        factory.push_session_with(ok_session("code"), move || {
            plan.update(|p| p.phases = Some(one_subtask_phase(SubtaskStatus::Completed)))
                .unwrap();
        });

        let outcome = BuildStage.run(&ctx).await.unwrap();
        assert_eq!(outcome.status, super::super::StageStatus::Ok);
        assert_eq!(outcome.detail["subtasksCompleted"], 1);

        let requests = factory.requests();
        assert_eq!(requests[0].agent, AgentKind::Planner);
        assert_eq!(requests[1].agent, AgentKind::Coder);
    }

    #[tokio::test]
    async fn test_build_fails_without_phases() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = context(&dir, TaskKind::Impl, Arc::clone(&factory));

        // Planner session succeeds but writes nothing.
        factory.push_session(ok_session("plan"));

        let err = BuildStage.run(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageFailed { .. }));
    }

    #[tokio::test]
    async fn test_build_detects_stalled_coder() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = context(&dir, TaskKind::Impl, Arc::clone(&factory));

        ctx.plan
            .update(|p| p.phases = Some(one_subtask_phase(SubtaskStatus::Pending)))
            .unwrap();

        // Two coder sessions that never move the subtask.
        factory.push_session(ok_session("c1"));
        factory.push_session(ok_session("c2"));

        let err = BuildStage.run(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageFailed { .. }));
        assert_eq!(factory.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_decompose_services_factory_tool() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = context(&dir, TaskKind::Design, Arc::clone(&factory));

        factory.push_session(vec![
            SessionEvent::SessionStart {
                session_id: "design".into(),
            },
            SessionEvent::ToolCall {
                id: "t1".into(),
                name: BATCH_TOOL.into(),
                input: serde_json::json!({
                    "specs": [
                        {"task": "Schema", "priority": 1},
                        {"task": "API layer", "dependsOn": ["1"]},
                    ]
                }),
            },
            SessionEvent::SessionEnd {
                status: SessionStatus::Success,
                tokens_in: 1,
                tokens_out: 1,
                tool_count: 1,
                error: None,
            },
        ]);

        let outcome = DecomposeStage.run(&ctx).await.unwrap();
        let children = outcome.detail["children"].as_array().unwrap();
        assert_eq!(children.len(), 2);

        // Parent marked complete so the daemon treats it as satisfied.
        let plan = ctx.plan.load().unwrap();
        assert_eq!(plan.status, TaskStatus::Complete);

        // The second child depends on the first by real id.
        let second = children[1].as_str().unwrap();
        let child_plan = PlanStore::new(
            dir.path().join(".auto-claude/specs").join(second),
        )
        .load()
        .unwrap();
        assert_eq!(child_plan.depends_on.len(), 1);
        assert_eq!(child_plan.parent_task.as_deref(), Some("001-task"));
    }

    #[tokio::test]
    async fn test_decompose_fails_with_no_children() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = context(&dir, TaskKind::Design, Arc::clone(&factory));

        factory.push_session(ok_session("design"));

        let err = DecomposeStage.run(&ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageFailed { .. }));
    }

    #[tokio::test]
    async fn test_merge_skips_without_auto_merge() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = context(&dir, TaskKind::Impl, Arc::clone(&factory));

        let outcome = MergeStage.run(&ctx).await.unwrap();
        assert_eq!(outcome.status, super::super::StageStatus::Skipped);
    }

    #[test]
    fn test_parse_batch_shapes() {
        let wrapped = serde_json::json!({"specs": [{"task": "A"}]});
        assert_eq!(parse_batch(&wrapped).unwrap().len(), 1);

        let bare = serde_json::json!([{"task": "A"}, {"task": "B"}]);
        assert_eq!(parse_batch(&bare).unwrap().len(), 2);

        let single = serde_json::json!({"task": "only one"});
        assert_eq!(parse_batch(&single).unwrap().len(), 1);

        assert!(parse_batch(&serde_json::json!("nope")).is_err());
    }
}
