// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Database validator.
//!
//! Applies the project's migrations against a throwaway schema and reports
//! the first failing migration. The migrate command comes from the project
//! index; `DATABASE_URL` is pointed at a scratch SQLite file so the real
//! database is never touched.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::info;

use super::{Severity, Validator, ValidatorContext, ValidatorEvidence, ValidatorResult};
use crate::project::Capabilities;

const MIGRATE_TIMEOUT: Duration = Duration::from_secs(180);

/// Directories that indicate a migration tool when no command is declared.
const MIGRATION_DIRS: &[&str] = &[
    "migrations",
    "prisma/migrations",
    "drizzle",
    "alembic/versions",
    "db/migrate",
];

pub struct DatabaseValidator;

#[async_trait]
impl Validator for DatabaseValidator {
    fn name(&self) -> &'static str {
        "database"
    }

    fn selectable(&self, capabilities: &Capabilities) -> bool {
        capabilities.has_database
    }

    async fn run(&self, ctx: &ValidatorContext) -> ValidatorResult {
        let started = Instant::now();

        let Some(command) = ctx.index.migrate_command() else {
            let found: Vec<&str> = MIGRATION_DIRS
                .iter()
                .copied()
                .filter(|dir| ctx.working_dir.join(dir).exists())
                .collect();
            let reason = if found.is_empty() {
                "no migrate command and no migration directory".to_string()
            } else {
                format!(
                    "migrations present ({}) but no migrate command in the project index",
                    found.join(", ")
                )
            };
            return ValidatorResult::skipped(self.name(), reason).timed(started);
        };

        if ctx.cancel.is_cancelled() {
            return ValidatorResult::skipped(self.name(), "cancelled").timed(started);
        }

        // Throwaway schema: a scratch SQLite database under the spec dir.
        let scratch = ctx.spec_dir.join(".qa_scratch.db");
        let _ = std::fs::remove_file(&scratch);
        let scratch_url = format!("sqlite://{}", scratch.display());

        info!(command = %command, scratch = %scratch_url, "applying migrations on throwaway schema");
        let line = format!("DATABASE_URL='{scratch_url}' {command}");
        let (ok, output) =
            crate::process::run_shell_captured(&line, &ctx.working_dir, MIGRATE_TIMEOUT).await;

        let _ = std::fs::remove_file(&scratch);

        let mut evidence = ValidatorEvidence::default();
        evidence
            .exit_codes
            .insert("migrate".to_string(), if ok { 0 } else { 1 });

        if ok {
            ValidatorResult::passed(self.name(), "migrations apply cleanly on a fresh schema")
                .with_evidence(evidence)
                .timed(started)
        } else {
            let first_failing = first_failing_migration(&output);
            evidence.first_failure = Some(output.chars().take(2000).collect());
            let summary = match first_failing {
                Some(name) => format!("first failing migration: {name}"),
                None => "migration run failed".to_string(),
            };
            ValidatorResult::failed(self.name(), Severity::Major, summary)
                .with_evidence(evidence)
                .timed(started)
        }
    }
}

/// Common shapes: "error applying migration 0042_add_users",
/// "Migration `20240101_init` failed".
static MIGRATION_NAME: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r#"(?i)(?:applying migration|migration)\s+[`"']?([\w.-]+)[`"']?"#).unwrap()
});

/// Pull the name of the first failing migration out of tool output.
fn first_failing_migration(output: &str) -> Option<String> {
    for line in output.lines() {
        let lower = line.to_lowercase();
        if !(lower.contains("fail") || lower.contains("error")) {
            continue;
        }
        if let Some(cap) = MIGRATION_NAME.captures(line) {
            return Some(cap[1].to_string());
        }
    }
    None
}
