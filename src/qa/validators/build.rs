// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Build validator: lint, compile, test.
//!
//! Always selectable; always runs before the runtime validators. Commands
//! come from the project index and are authoritative — this validator never
//! invents commands. `lint` and `test` are blocking; a production `build`
//! failure is informational only, because the browser validator starts its
//! own dev server and should still get a chance to run.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::info;

use super::{Severity, Validator, ValidatorContext, ValidatorEvidence, ValidatorResult};
use crate::process::run_shell_captured;
use crate::project::Capabilities;

/// Per-command timeout.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
/// Output retained from the first failing command.
const FAILURE_SNIPPET_LEN: usize = 2000;

pub struct BuildValidator;

#[async_trait]
impl Validator for BuildValidator {
    fn name(&self) -> &'static str {
        "build"
    }

    fn selectable(&self, _capabilities: &Capabilities) -> bool {
        true
    }

    async fn run(&self, ctx: &ValidatorContext) -> ValidatorResult {
        let started = Instant::now();
        let commands = ctx.index.build_commands();
        if commands.is_empty() {
            return ValidatorResult::skipped(self.name(), "no build system detected")
                .timed(started);
        }

        let mut evidence = ValidatorEvidence::default();
        let mut failures: Vec<String> = Vec::new();
        let mut blocking_failure = false;

        let steps: [(&str, Option<&String>, bool); 3] = [
            ("lint", commands.lint.as_ref(), true),
            ("build", commands.build.as_ref(), false),
            ("test", commands.test.as_ref(), true),
        ];

        for (step, command, blocking) in steps {
            let Some(command) = command else { continue };
            if ctx.cancel.is_cancelled() {
                return ValidatorResult::skipped(self.name(), "cancelled").timed(started);
            }

            info!(step, command = %command, "build validator running");
            let (ok, output) =
                run_shell_captured(command, &ctx.working_dir, COMMAND_TIMEOUT).await;

            evidence
                .exit_codes
                .insert(step.to_string(), if ok { 0 } else { 1 });

            if step == "test" && ok {
                let (passed, failed) = parse_test_counts(&output);
                evidence.tests_passed = passed;
                evidence.tests_failed = failed;
            }

            if !ok {
                let label = if blocking {
                    step.to_string()
                } else {
                    format!("{step} (non-blocking)")
                };
                failures.push(label);
                if evidence.first_failure.is_none() {
                    evidence.first_failure =
                        Some(output.chars().take(FAILURE_SNIPPET_LEN).collect());
                }
                if blocking {
                    blocking_failure = true;
                }
            }
        }

        let ran: Vec<&str> = evidence.exit_codes.keys().map(String::as_str).collect();
        let result = if blocking_failure {
            ValidatorResult::failed(
                self.name(),
                Severity::Major,
                format!("failed: {}", failures.join(", ")),
            )
        } else if failures.is_empty() {
            ValidatorResult::passed(self.name(), format!("all green ({})", ran.join(", ")))
        } else {
            ValidatorResult::passed(
                self.name(),
                format!("blocking steps green; non-blocking failed: {}", failures.join(", ")),
            )
        };
        result.with_evidence(evidence).timed(started)
    }
}

/// jest style: "Tests: 2 failed, 10 passed". Tried first, since its counts
/// would also match the generic pattern in the wrong order.
static JEST_COUNTS: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"Tests:\s+(?:(\d+)\s+failed,\s+)?(\d+)\s+passed").unwrap());
/// cargo test / pytest style: "14 passed; 0 failed".
static GENERIC_COUNTS: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"(\d+)\s+passed(?:[^\d]+(\d+)\s+failed)?").unwrap());

/// Best-effort extraction of test counts from common runner output.
fn parse_test_counts(output: &str) -> (Option<u32>, Option<u32>) {
    if let Some(cap) = JEST_COUNTS.captures(output) {
        let failed = cap.get(1).and_then(|m| m.as_str().parse().ok());
        let passed = cap.get(2).and_then(|m| m.as_str().parse().ok());
        return (passed, failed.or(Some(0)));
    }
    if let Some(cap) = GENERIC_COUNTS.captures(output) {
        let passed = cap.get(1).and_then(|m| m.as_str().parse().ok());
        let failed = cap.get(2).and_then(|m| m.as_str().parse().ok());
        return (passed, failed.or(Some(0)));
    }
    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::project::ProjectIndex;
    use tempfile::TempDir;

    fn context(dir: &TempDir, index: ProjectIndex) -> ValidatorContext {
        ValidatorContext {
            project_dir: dir.path().to_path_buf(),
            working_dir: dir.path().to_path_buf(),
            spec_dir: dir.path().to_path_buf(),
            capabilities: Capabilities::default(),
            index,
            cancel: CancelToken::new(),
        }
    }

    fn index_with(test_cmd: &str) -> ProjectIndex {
        ProjectIndex::from_value(&serde_json::json!({
            "services": [{ "name": "app", "test_command": test_cmd }]
        }))
    }

    #[tokio::test]
    async fn test_no_build_system_is_skipped() {
        let dir = TempDir::new().unwrap();
        let result = BuildValidator.run(&context(&dir, ProjectIndex::default())).await;
        assert!(result.skipped);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_green_test_command_passes() {
        let dir = TempDir::new().unwrap();
        let result = BuildValidator
            .run(&context(&dir, index_with("echo '3 passed' && true")))
            .await;
        assert!(result.passed);
        assert!(!result.skipped);
        assert_eq!(result.evidence.tests_passed, Some(3));
    }

    #[tokio::test]
    async fn test_failing_test_blocks_with_first_failure_output() {
        let dir = TempDir::new().unwrap();
        let result = BuildValidator
            .run(&context(&dir, index_with("echo 'assertion failed: left != right'; exit 1")))
            .await;
        assert!(!result.passed);
        assert_eq!(result.severity, Severity::Major);
        assert!(result
            .evidence
            .first_failure
            .as_deref()
            .unwrap()
            .contains("assertion failed"));
    }

    #[tokio::test]
    async fn test_nonblocking_build_failure_still_passes() {
        let dir = TempDir::new().unwrap();
        let index = ProjectIndex::from_value(&serde_json::json!({
            "services": [{
                "name": "app",
                "build_command": "exit 1",
                "test_command": "echo ok"
            }]
        }));
        let result = BuildValidator.run(&context(&dir, index)).await;
        assert!(result.passed);
        assert!(result.summary.contains("non-blocking"));
    }

    #[test]
    fn test_parse_test_counts() {
        assert_eq!(
            parse_test_counts("test result: ok. 14 passed; 0 failed"),
            (Some(14), Some(0))
        );
        assert_eq!(
            parse_test_counts("Tests: 2 failed, 10 passed, 12 total"),
            (Some(10), Some(2))
        );
        assert_eq!(parse_test_counts("nothing here"), (None, None));
    }
}
