// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! QA loop: review → fix → re-review with bounded iteration.
//!
//! Validator evidence feeds the reviewer; the reviewer's verdict lands in
//! the plan's `qaSignoff`; rejections produce a `QA_FIX_REQUEST.md` that
//! the fixer consumes inside the worktree. The loop terminates on approval,
//! on the iteration cap, or when two consecutive fix requests are
//! byte-identical (the loop is not making progress).

pub mod validators;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::agents::{AgentKind, AgentRegistry};
use crate::cancel::CancelToken;
use crate::error::AgentError;
use crate::events::{kind as event_kind, EventLog};
use crate::plan::{PlanStore, QaIssue, QaSignoff, QaStatus};
use crate::project::{Capabilities, ProjectIndex};
use crate::session::{
    retry_transient, RetryPolicy, SessionDriver, SessionFactory, SessionRequest, SessionStatus,
};
use crate::settings::ResolvedSettings;
use crate::types::{ExecutionPhase, TaskStatus, XstateState};

use validators::{
    format_report, select_validators, Validator, ValidatorContext, ValidatorResult,
};

/// Fix request consumed by the fixer (and by humans during review).
pub const FIX_REQUEST_FILE: &str = "QA_FIX_REQUEST.md";
/// Latest QA report, retained for display.
pub const QA_REPORT_FILE: &str = "qa_report.md";

/// Loop bounds.
#[derive(Debug, Clone, Copy)]
pub struct QaConfig {
    pub max_iterations: u32,
    /// Consecutive reviewer sessions that fail to update the signoff before
    /// the loop gives up.
    pub max_consecutive_errors: u32,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_consecutive_errors: 3,
        }
    }
}

/// Terminal verdict of one loop run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QaVerdict {
    Approved,
    /// Cap exceeded, non-progression, or repeated reviewer errors; the task
    /// moves to human review with the issue history preserved.
    NeedsAttention,
}

/// Everything the loop needs, assembled by the pipeline's QA stage.
#[derive(Clone)]
pub struct QaContext {
    pub project_dir: PathBuf,
    pub working_dir: PathBuf,
    pub spec_dir: PathBuf,
    pub plan: PlanStore,
    pub capabilities: Capabilities,
    pub index: ProjectIndex,
    pub sessions: Arc<dyn SessionFactory>,
    pub registry: Arc<AgentRegistry>,
    pub settings: ResolvedSettings,
    pub cancel: CancelToken,
}

pub struct QaLoop {
    config: QaConfig,
}

impl QaLoop {
    pub fn new(config: QaConfig) -> Self {
        Self { config }
    }

    /// Run the loop to a terminal verdict.
    ///
    /// The plan leaves this function in `human_review` either way; the
    /// difference is `qaSignoff.status`.
    pub async fn run(
        &self,
        ctx: &QaContext,
        events: &mut EventLog,
    ) -> Result<QaVerdict, AgentError> {
        events.append(
            event_kind::QA_STARTED,
            serde_json::json!({ "iteration": 1, "maxIterations": self.config.max_iterations }),
        )
        .ok();

        let plan = ctx
            .plan
            .load()
            .map_err(|e| AgentError::SessionFailed(format!("plan unreadable before QA: {e}")))?;
        if !plan.is_build_complete() {
            let (done, total) = plan.subtask_counts();
            return Err(AgentError::SessionFailed(format!(
                "build incomplete: {done}/{total} subtasks done"
            )));
        }

        // Already approved with no pending human feedback: nothing to do.
        let fix_request_path = ctx.spec_dir.join(FIX_REQUEST_FILE);
        let has_human_feedback = fix_request_path.exists();
        if !has_human_feedback {
            if let Some(signoff) = &plan.qa_signoff {
                if signoff.status == QaStatus::Approved {
                    events
                        .append(event_kind::QA_PASSED, serde_json::json!({ "iteration": 0 }))
                        .ok();
                    return Ok(QaVerdict::Approved);
                }
            }
        }

        // A fix request left by a human during review runs the fixer once
        // before the first review iteration.
        if has_human_feedback {
            info!("human feedback present, running fixer before first review");
            self.run_fixer(ctx, events, 0).await?;
            let _ = std::fs::remove_file(&fix_request_path);
        }

        let mut cached_results: Option<Vec<ValidatorResult>> = None;
        let mut evidence_head: Option<String> = None;
        let mut all_issues: Vec<QaIssue> = Vec::new();
        let mut previous_fix_digest: Option<[u8; 32]> = None;
        let mut consecutive_errors = 0u32;
        let mut reviewer_error_context: Option<String> = None;
        let mut iteration = 0u32;

        while iteration < self.config.max_iterations {
            iteration += 1;
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            ctx.plan
                .update_status(
                    TaskStatus::AiReview,
                    XstateState::QaReview,
                    ExecutionPhase::QaReview,
                )
                .ok();

            // Gather (or reuse) validator evidence. Validators re-run only
            // when the worktree HEAD moved since the evidence was taken.
            let head = current_head(&ctx.working_dir).await;
            let fresh_needed =
                cached_results.is_none() || head.is_none() || head != evidence_head;
            if fresh_needed {
                let (results, build_failed) = self.run_validators(ctx).await;
                if build_failed {
                    // A broken build short-circuits: no runtime validators,
                    // no reviewer; the fixer gets the build errors directly.
                    let issues = issues_from_results(&results, iteration);
                    all_issues.extend(issues.clone());
                    let digest = write_fix_request(
                        &ctx.spec_dir,
                        "Build validation failed",
                        &issues,
                        &results,
                    )?;
                    events
                        .append(
                            event_kind::QA_FAILED,
                            serde_json::json!({
                                "iteration": iteration,
                                "issueCount": issues.len(),
                                "source": "build_validator",
                            }),
                        )
                        .ok();
                    if previous_fix_digest == Some(digest) {
                        warn!("fix request identical to previous iteration, not progressing");
                        return self.needs_attention(ctx, events, iteration, all_issues);
                    }
                    previous_fix_digest = Some(digest);

                    if iteration >= self.config.max_iterations {
                        break;
                    }
                    self.run_fixer(ctx, events, iteration).await?;
                    cached_results = None;
                    continue;
                }
                evidence_head = head;
                cached_results = Some(results);
            } else {
                info!("worktree unchanged, reviewer re-runs on cached evidence");
            }
            let results = cached_results.as_ref().expect("evidence gathered above");

            // Reviewer, with the evidence injected into its prompt.
            let verdict = self
                .run_reviewer(ctx, events, results, iteration, reviewer_error_context.take())
                .await?;

            match verdict {
                ReviewerVerdict::Approved => {
                    let report = self.write_report(ctx, results, iteration)?;
                    ctx.plan
                        .update(|plan| {
                            plan.qa_signoff = Some(QaSignoff {
                                status: QaStatus::Approved,
                                issues: all_issues.clone(),
                                report_file: Some(report.display().to_string()),
                                extra: serde_json::Map::new(),
                            });
                            plan.set_status(
                                TaskStatus::HumanReview,
                                XstateState::HumanReview,
                                ExecutionPhase::Complete,
                            );
                        })
                        .ok();
                    events
                        .append(
                            event_kind::QA_PASSED,
                            serde_json::json!({ "iteration": iteration }),
                        )
                        .ok();
                    info!(iteration, "QA approved");
                    return Ok(QaVerdict::Approved);
                }
                ReviewerVerdict::Rejected(issues) => {
                    consecutive_errors = 0;
                    let mut issues = issues;
                    for issue in &mut issues {
                        issue.iteration = Some(iteration);
                    }
                    all_issues.extend(issues.clone());
                    events
                        .append(
                            event_kind::QA_FAILED,
                            serde_json::json!({
                                "iteration": iteration,
                                "issueCount": issues.len(),
                                "issues": issues
                                    .iter()
                                    .take(5)
                                    .map(|i| i.title.clone().unwrap_or_else(|| i.description.clone()))
                                    .collect::<Vec<_>>(),
                            }),
                        )
                        .ok();

                    let digest =
                        write_fix_request(&ctx.spec_dir, "QA review rejected", &issues, results)?;
                    if previous_fix_digest == Some(digest) {
                        warn!("fix request identical to previous iteration, not progressing");
                        return self.needs_attention(ctx, events, iteration, all_issues);
                    }
                    previous_fix_digest = Some(digest);

                    if iteration >= self.config.max_iterations {
                        break;
                    }
                    self.run_fixer(ctx, events, iteration).await?;
                }
                ReviewerVerdict::NoSignoff(message) => {
                    consecutive_errors += 1;
                    warn!(
                        consecutive_errors,
                        cap = self.config.max_consecutive_errors,
                        "reviewer did not update qaSignoff"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        return self.needs_attention(ctx, events, iteration, all_issues);
                    }
                    reviewer_error_context = Some(format!(
                        "Previous review session error: {message}. You MUST update \
                         implementation_plan.json with a qaSignoff object whose status is \
                         'approved' or 'rejected'."
                    ));
                    // Retry the reviewer on the same evidence.
                    iteration -= 1;
                }
            }
        }

        events
            .append(
                event_kind::QA_MAX_ITERATIONS,
                serde_json::json!({
                    "iteration": iteration,
                    "maxIterations": self.config.max_iterations,
                }),
            )
            .ok();
        self.needs_attention(ctx, events, iteration, all_issues)
    }

    /// Build validator first, then the runtime validators in parallel.
    /// Returns the collected results plus whether the build failed.
    async fn run_validators(&self, ctx: &QaContext) -> (Vec<ValidatorResult>, bool) {
        let selected = select_validators(&ctx.capabilities);
        let vctx = ValidatorContext {
            project_dir: ctx.project_dir.clone(),
            working_dir: ctx.working_dir.clone(),
            spec_dir: ctx.spec_dir.clone(),
            capabilities: ctx.capabilities,
            index: ctx.index.clone(),
            cancel: ctx.cancel.clone(),
        };

        let mut results = Vec::new();
        let mut runtime: Vec<Box<dyn Validator>> = Vec::new();
        for validator in selected {
            if validator.name() == "build" {
                let result = validator.run(&vctx).await;
                let failed = !result.passed && !result.skipped;
                results.push(result);
                if failed {
                    return (results, true);
                }
            } else {
                runtime.push(validator);
            }
        }

        let mut set = JoinSet::new();
        for validator in runtime {
            let vctx = vctx.clone();
            set.spawn(async move { validator.run(&vctx).await });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "validator task panicked"),
            }
        }
        (results, false)
    }

    async fn run_reviewer(
        &self,
        ctx: &QaContext,
        events: &mut EventLog,
        results: &[ValidatorResult],
        iteration: u32,
        error_context: Option<String>,
    ) -> Result<ReviewerVerdict, AgentError> {
        let definition = ctx.registry.get(AgentKind::QaReviewer);
        let mut prompt = format!(
            "Review the implementation in this worktree against its spec.\n\
             Iteration {iteration} of {}.\n\n\
             Automated validator evidence:\n\n{}",
            self.config.max_iterations,
            format_report(results),
        );
        if let Some(context) = error_context {
            prompt.push_str(&format!("\n\n{context}"));
        }
        prompt.push_str(
            "\n\nRecord your verdict in implementation_plan.json under qaSignoff \
             with status 'approved' or 'rejected' (with issues).",
        );

        let request = SessionRequest::new(AgentKind::QaReviewer, &ctx.working_dir, &ctx.spec_dir)
            .with_model(ctx.settings.model.clone())
            .with_thinking(definition.thinking_default)
            .with_tools(definition.all_tools())
            .with_prompt(prompt);

        let outcome = self.drive_session(ctx, events, request).await?;

        // The reviewer's contract is the plan update, not the transport
        // status: check the artifact first.
        let plan = ctx
            .plan
            .load()
            .map_err(|e| AgentError::SessionFailed(format!("plan unreadable after review: {e}")))?;
        match plan.qa_signoff {
            Some(signoff) if signoff.status == QaStatus::Approved => Ok(ReviewerVerdict::Approved),
            Some(signoff) if signoff.status == QaStatus::Rejected => {
                Ok(ReviewerVerdict::Rejected(signoff.issues))
            }
            _ => Ok(ReviewerVerdict::NoSignoff(
                outcome
                    .error
                    .unwrap_or_else(|| "session ended without a qaSignoff verdict".to_string()),
            )),
        }
    }

    async fn run_fixer(
        &self,
        ctx: &QaContext,
        events: &mut EventLog,
        iteration: u32,
    ) -> Result<(), AgentError> {
        ctx.plan
            .update_status(
                TaskStatus::QaFixing,
                XstateState::QaFixing,
                ExecutionPhase::QaFixing,
            )
            .ok();
        events
            .append(
                event_kind::QA_FIXING_STARTED,
                serde_json::json!({ "iteration": iteration }),
            )
            .ok();

        let definition = ctx.registry.get(AgentKind::QaFixer);
        let request = SessionRequest::new(AgentKind::QaFixer, &ctx.working_dir, &ctx.spec_dir)
            .with_model(ctx.settings.model.clone())
            .with_thinking(definition.thinking_default)
            .with_tools(definition.all_tools())
            .with_prompt(format!(
                "Fix every issue listed in {FIX_REQUEST_FILE} in this worktree, then \
                 commit your changes. Do not merge, push, or rebase."
            ));

        let outcome = self.drive_session(ctx, events, request).await?;
        if outcome.status == SessionStatus::Error {
            // The fixer's artifact is the commit; without one the error stands.
            return Err(AgentError::SessionFailed(
                outcome
                    .error
                    .unwrap_or_else(|| "fixer session failed".to_string()),
            ));
        }

        events
            .append(
                event_kind::QA_FIXING_COMPLETE,
                serde_json::json!({ "iteration": iteration }),
            )
            .ok();
        Ok(())
    }

    async fn drive_session(
        &self,
        ctx: &QaContext,
        events: &mut EventLog,
        request: SessionRequest,
    ) -> Result<crate::session::SessionOutcome, AgentError> {
        let sessions = Arc::clone(&ctx.sessions);
        let cancel = ctx.cancel.clone();
        let mut session = retry_transient(RetryPolicy::default(), &ctx.cancel, || {
            let sessions = Arc::clone(&sessions);
            let request = request.clone();
            let cancel = cancel.clone();
            async move { sessions.start(request, cancel).await }
        })
        .await?;

        let mut driver = SessionDriver::new(events, ctx.cancel.clone());
        driver.drive(&mut session).await
    }

    fn needs_attention(
        &self,
        ctx: &QaContext,
        events: &mut EventLog,
        iteration: u32,
        issues: Vec<QaIssue>,
    ) -> Result<QaVerdict, AgentError> {
        ctx.plan
            .update(|plan| {
                plan.qa_signoff = Some(QaSignoff {
                    status: QaStatus::NeedsAttention,
                    issues: issues.clone(),
                    report_file: Some(QA_REPORT_FILE.to_string()),
                    extra: serde_json::Map::new(),
                });
                plan.set_status(
                    TaskStatus::HumanReview,
                    XstateState::HumanReview,
                    ExecutionPhase::HumanReview,
                );
            })
            .map_err(|e| AgentError::SessionFailed(format!("plan update failed: {e}")))?;
        events
            .append_task_event(
                "QA_NEEDS_ATTENTION",
                serde_json::json!({ "iteration": iteration, "issueCount": issues.len() }),
            )
            .ok();
        Ok(QaVerdict::NeedsAttention)
    }

    fn write_report(
        &self,
        ctx: &QaContext,
        results: &[ValidatorResult],
        iteration: u32,
    ) -> Result<PathBuf, AgentError> {
        let path = ctx.spec_dir.join(QA_REPORT_FILE);
        let body = format!(
            "# QA Report\n\nApproved on iteration {iteration}.\n\n{}",
            format_report(results)
        );
        std::fs::write(&path, body)
            .map_err(|e| AgentError::SessionFailed(format!("qa report write failed: {e}")))?;
        Ok(path)
    }
}

enum ReviewerVerdict {
    Approved,
    Rejected(Vec<QaIssue>),
    NoSignoff(String),
}

/// Current HEAD of the working directory, if it is a git checkout.
async fn current_head(working_dir: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(working_dir)
        .output()
        .await
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

/// Issues derived from failing validator results.
fn issues_from_results(results: &[ValidatorResult], iteration: u32) -> Vec<QaIssue> {
    results
        .iter()
        .filter(|r| !r.passed && !r.skipped)
        .map(|r| QaIssue {
            title: Some(format!("{} validator failed", r.name)),
            severity: format!("{:?}", r.severity).to_lowercase(),
            description: r.summary.clone(),
            file: None,
            line: None,
            iteration: Some(iteration),
        })
        .collect()
}

/// Write `QA_FIX_REQUEST.md` and return the SHA-256 digest of its content,
/// used for non-progression detection.
fn write_fix_request(
    spec_dir: &Path,
    header: &str,
    issues: &[QaIssue],
    results: &[ValidatorResult],
) -> Result<[u8; 32], AgentError> {
    let mut body = format!("# QA Fix Request\n\n{header}.\n\n## Issues\n\n");
    for issue in issues {
        let title = issue.title.as_deref().unwrap_or(&issue.description);
        body.push_str(&format!("- **[{}]** {title}", issue.severity));
        if issue.title.is_some() && !issue.description.is_empty() {
            body.push_str(&format!(": {}", issue.description));
        }
        if let Some(file) = &issue.file {
            body.push_str(&format!(" ({file}"));
            if let Some(line) = issue.line {
                body.push_str(&format!(":{line}"));
            }
            body.push(')');
        }
        body.push('\n');
    }
    let evidence = format_report(results);
    if !evidence.is_empty() {
        body.push_str(&format!("\n## Evidence\n\n{evidence}"));
    }

    let path = spec_dir.join(FIX_REQUEST_FILE);
    std::fs::write(&path, &body)
        .map_err(|e| AgentError::SessionFailed(format!("fix request write failed: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Plan, PlanPhase, Subtask, SubtaskStatus};
    use crate::session::{ScriptedFactory, SessionEvent};
    use crate::settings::ThinkingLevel;
    use crate::types::{TaskKind, TaskPriority};
    use tempfile::TempDir;

    fn qa_context(dir: &TempDir, factory: Arc<ScriptedFactory>) -> QaContext {
        let spec_dir = dir.path().join("specs/001-x");
        std::fs::create_dir_all(&spec_dir).unwrap();
        let plan_store = PlanStore::new(&spec_dir);
        plan_store
            .save(&Plan::queued(TaskKind::Impl, TaskPriority::Normal))
            .unwrap();

        QaContext {
            project_dir: dir.path().to_path_buf(),
            working_dir: dir.path().to_path_buf(),
            spec_dir,
            plan: plan_store,
            capabilities: Capabilities::default(),
            index: ProjectIndex::default(),
            sessions: factory,
            registry: Arc::new(AgentRegistry::with_defaults()),
            settings: ResolvedSettings {
                model: "test-model".into(),
                thinking: ThinkingLevel::Medium,
                skip_qa: false,
                auto_merge: false,
                deny_commands: Vec::new(),
            },
            cancel: CancelToken::new(),
        }
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

    /// Queue a reviewer session that writes its verdict into the plan when
    /// driven, the way the real reviewer agent does through its tools.
    fn push_reviewer(
        factory: &ScriptedFactory,
        plan: PlanStore,
        status: QaStatus,
        issues: Vec<QaIssue>,
    ) {
        factory.push_session_with(ok_session("review"), move || {
            plan.update(|p| {
                p.qa_signoff = Some(QaSignoff {
                    status,
                    issues: issues.clone(),
                    report_file: None,
                    extra: serde_json::Map::new(),
                });
            })
            .unwrap();
        });
    }

    #[tokio::test]
    async fn test_approval_on_first_iteration() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = qa_context(&dir, Arc::clone(&factory));

        push_reviewer(&factory, ctx.plan.clone(), QaStatus::Approved, vec![]);

        let mut events = EventLog::open(&ctx.spec_dir).unwrap();
        let verdict = QaLoop::new(QaConfig::default())
            .run(&ctx, &mut events)
            .await
            .unwrap();

        assert_eq!(verdict, QaVerdict::Approved);
        let plan = ctx.plan.load().unwrap();
        assert_eq!(plan.status, TaskStatus::HumanReview);
        assert_eq!(plan.qa_signoff.unwrap().status, QaStatus::Approved);
        assert!(ctx.spec_dir.join(QA_REPORT_FILE).exists());
    }

    #[tokio::test]
    async fn test_cap_exceeded_preserves_history() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = qa_context(&dir, Arc::clone(&factory));

        // Every iteration: reviewer rejects with a fresh issue, then a fixer
        // runs. Distinct descriptions keep the fix requests distinct so the
        // non-progression guard stays quiet.
        for i in 0..3 {
            push_reviewer(
                &factory,
                ctx.plan.clone(),
                QaStatus::Rejected,
                vec![QaIssue {
                    title: Some(format!("issue {i}")),
                    severity: "major".into(),
                    description: format!("problem number {i}"),
                    file: None,
                    line: None,
                    iteration: None,
                }],
            );
            // Fixer session (plain success).
            factory.push_session(ok_session(&format!("fix{i}")));
        }

        let mut events = EventLog::open(&ctx.spec_dir).unwrap();
        let verdict = QaLoop::new(QaConfig::default())
            .run(&ctx, &mut events)
            .await
            .unwrap();

        assert_eq!(verdict, QaVerdict::NeedsAttention);
        let plan = ctx.plan.load().unwrap();
        assert_eq!(plan.status, TaskStatus::HumanReview);
        let signoff = plan.qa_signoff.unwrap();
        assert_eq!(signoff.status, QaStatus::NeedsAttention);
        // Full issue history is preserved across iterations.
        assert_eq!(signoff.issues.len(), 3);
        assert!(ctx.spec_dir.join(FIX_REQUEST_FILE).exists());
    }

    #[tokio::test]
    async fn test_non_progression_terminates_early() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = qa_context(&dir, Arc::clone(&factory));

        let same_issue = || {
            vec![QaIssue {
                title: Some("same issue".into()),
                severity: "major".into(),
                description: "identical every time".into(),
                file: None,
                line: None,
                iteration: None,
            }]
        };

        push_reviewer(&factory, ctx.plan.clone(), QaStatus::Rejected, same_issue());
        factory.push_session(ok_session("fix"));
        push_reviewer(&factory, ctx.plan.clone(), QaStatus::Rejected, same_issue());

        let mut events = EventLog::open(&ctx.spec_dir).unwrap();
        let verdict = QaLoop::new(QaConfig::default())
            .run(&ctx, &mut events)
            .await
            .unwrap();

        // Two byte-identical fix requests: terminated before iteration 3.
        assert_eq!(verdict, QaVerdict::NeedsAttention);
        // Only two reviewer sessions plus one fixer ran.
        assert_eq!(factory.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_incomplete_build_refuses_to_run() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = qa_context(&dir, Arc::clone(&factory));

        ctx.plan
            .update(|plan| {
                plan.phases = Some(vec![PlanPhase {
                    name: "p1".into(),
                    subtasks: vec![Subtask {
                        id: "1-1".into(),
                        description: "unfinished".into(),
                        status: SubtaskStatus::Pending,
                        files_to_create: vec![],
                        files_to_modify: vec![],
                        extra: serde_json::Map::new(),
                    }],
                    extra: serde_json::Map::new(),
                }]);
            })
            .unwrap();

        let mut events = EventLog::open(&ctx.spec_dir).unwrap();
        let result = QaLoop::new(QaConfig::default()).run(&ctx, &mut events).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_human_feedback_runs_fixer_first() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(ScriptedFactory::new());
        let ctx = qa_context(&dir, Arc::clone(&factory));

        std::fs::write(
            ctx.spec_dir.join(FIX_REQUEST_FILE),
            "# QA Fix Request\n\nhuman says: button color wrong\n",
        )
        .unwrap();

        // First the fixer (for the human feedback), then an approving review.
        factory.push_session(ok_session("feedback-fix"));
        push_reviewer(&factory, ctx.plan.clone(), QaStatus::Approved, vec![]);

        let mut events = EventLog::open(&ctx.spec_dir).unwrap();
        let verdict = QaLoop::new(QaConfig::default())
            .run(&ctx, &mut events)
            .await
            .unwrap();
        assert_eq!(verdict, QaVerdict::Approved);

        // The fixer ran first and the feedback file was consumed before the
        // approval path (which does not recreate it).
        let requests = factory.requests();
        assert_eq!(requests[0].agent, AgentKind::QaFixer);
        assert_eq!(requests[1].agent, AgentKind::QaReviewer);
    }
}
