// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Search-based improvement pipeline.
//!
//! `mcts_search` runs a bounded number of candidate improvement sessions on
//! scratch branches, scores each candidate with the build validator, and
//! records the scored tree under the spec dir. `merge_best` merges the
//! highest-scoring branch back into the task branch. Budget exhaustion
//! (candidate count) selects the best-so-far.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::stages::run_agent;
use super::{PipelineError, StageAction, StageContext, StageOutcome};
use crate::agents::AgentKind;
use crate::qa::validators::{Validator, ValidatorContext};
use crate::types::{ExecutionPhase, TaskStatus, XstateState};

/// Candidate budget per search stage.
const MAX_CANDIDATES: u32 = 3;
/// Scored-tree file kept for display and for `merge_best`.
const TREE_FILE: &str = "mcts_tree.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CandidateScore {
    branch: String,
    /// 1.0 when the build validator passed, 0.0 when it failed, 0.5 when
    /// it was skipped (nothing to measure against).
    score: f64,
    summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SearchTree {
    base: String,
    candidates: Vec<CandidateScore>,
}

impl SearchTree {
    fn best(&self) -> Option<&CandidateScore> {
        self.candidates
            .iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
    }
}

async fn git(cwd: &Path, args: &[&str]) -> Result<String, String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

fn stage_err(stage: &str, message: impl std::fmt::Display) -> PipelineError {
    PipelineError::StageFailed {
        stage: stage.to_string(),
        message: message.to_string(),
    }
}

/// Generate and score improvement candidates on scratch branches.
pub struct MctsSearchStage;

#[async_trait]
impl StageAction for MctsSearchStage {
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, PipelineError> {
        ctx.plan
            .update_status(
                TaskStatus::InProgress,
                XstateState::Coding,
                ExecutionPhase::Coding,
            )
            .map_err(|e| stage_err("mcts_search", e))?;

        let base = git(&ctx.working_dir, &["branch", "--show-current"])
            .await
            .map_err(|e| stage_err("mcts_search", format!("not a git checkout: {e}")))?;

        let mut tree = SearchTree {
            base: base.clone(),
            candidates: Vec::new(),
        };

        for attempt in 1..=MAX_CANDIDATES {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let branch = format!("mcts/{}/{attempt}", ctx.spec_id);
            if let Err(e) = git(&ctx.working_dir, &["checkout", "-B", &branch, &base]).await {
                warn!(branch = %branch, error = %e, "candidate branch creation failed");
                continue;
            }

            let session = run_agent(
                ctx,
                AgentKind::Coder,
                format!(
                    "Improve the implementation on this branch (candidate {attempt} of \
                     {MAX_CANDIDATES}). Take a distinct approach from earlier candidates, \
                     then commit your changes."
                ),
            )
            .await;
            if let Err(e) = session {
                warn!(branch = %branch, error = %e, "candidate session failed");
                let _ = git(&ctx.working_dir, &["checkout", &base]).await;
                continue;
            }

            // Score with the build validator alone: cheap and objective.
            let vctx = ValidatorContext {
                project_dir: ctx.project_dir.clone(),
                working_dir: ctx.working_dir.clone(),
                spec_dir: ctx.spec_dir.clone(),
                capabilities: ctx.capabilities,
                index: ctx.index.clone(),
                cancel: ctx.cancel.clone(),
            };
            let result = crate::qa::validators::BuildValidator.run(&vctx).await;
            let score = if result.skipped {
                0.5
            } else if result.passed {
                1.0
            } else {
                0.0
            };
            info!(branch = %branch, score, "candidate scored");
            tree.candidates.push(CandidateScore {
                branch,
                score,
                summary: result.summary,
            });

            let _ = git(&ctx.working_dir, &["checkout", &base]).await;

            // A passing candidate is good enough; the budget is a cap, not
            // a quota.
            if score >= 1.0 {
                break;
            }
        }

        if tree.candidates.is_empty() {
            return Err(stage_err("mcts_search", "no candidate produced"));
        }

        let tree_json = serde_json::to_string_pretty(&tree)
            .map_err(|e| stage_err("mcts_search", e))?;
        std::fs::write(ctx.spec_dir.join(TREE_FILE), tree_json)
            .map_err(|e| stage_err("mcts_search", e))?;

        let best = tree.best().expect("non-empty candidates").clone();
        ctx.plan
            .update(|plan| {
                plan.extra.insert(
                    "mctsBest".to_string(),
                    serde_json::json!({ "branch": best.branch.clone(), "score": best.score }),
                );
            })
            .map_err(|e| stage_err("mcts_search", e))?;

        Ok(StageOutcome::ok(serde_json::json!({
            "candidates": tree.candidates.len(),
            "best": best.branch,
            "bestScore": best.score,
        })))
    }
}

/// Merge the winning candidate branch into the task branch.
pub struct MergeBestStage;

#[async_trait]
impl StageAction for MergeBestStage {
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, PipelineError> {
        let tree_path = ctx.spec_dir.join(TREE_FILE);
        let tree: SearchTree = std::fs::read_to_string(&tree_path)
            .map_err(|e| stage_err("merge_best", e))
            .and_then(|text| {
                serde_json::from_str(&text).map_err(|e| stage_err("merge_best", e))
            })?;

        let best = tree
            .best()
            .ok_or_else(|| stage_err("merge_best", "search recorded no candidates"))?;
        if best.score <= 0.0 {
            return Err(stage_err(
                "merge_best",
                format!("best candidate `{}` never built", best.branch),
            ));
        }

        git(&ctx.working_dir, &["checkout", &tree.base])
            .await
            .map_err(|e| stage_err("merge_best", e))?;
        git(&ctx.working_dir, &["merge", "--no-ff", &best.branch])
            .await
            .map_err(|e| stage_err("merge_best", format!("merge of best candidate: {e}")))?;

        // Scratch branches are disposable once the winner landed.
        for candidate in &tree.candidates {
            let _ = git(&ctx.working_dir, &["branch", "-D", &candidate.branch]).await;
        }

        ctx.plan
            .update(|plan| {
                plan.set_status(
                    TaskStatus::HumanReview,
                    XstateState::HumanReview,
                    ExecutionPhase::Complete,
                );
            })
            .map_err(|e| stage_err("merge_best", e))?;

        Ok(StageOutcome::ok(serde_json::json!({
            "merged": best.branch.clone(),
            "score": best.score,
        })))
    }
}
