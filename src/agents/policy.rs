// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Layered command authorization.
//!
//! Every bash dispatch is evaluated before execution:
//!
//! 1. exec-policy hook — worktree mutation rules
//! 2. project allowlist hook — the agent's security level
//! 3. session-layer permissions — project deny patterns
//! 4. OS sandbox — outside this process; represented as the final seam
//!
//! A reject at any layer aborts the tool call with a structured error that
//! flows back through the agent session.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use super::registry::{AgentDefinition, SecurityLevel};

/// Commands permitted at the `readonly` security level.
static READONLY_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "cat", "ls", "head", "tail", "wc", "grep", "rg", "find", "file", "stat", "du", "pwd",
        "which", "jq", "diff", "sort", "uniq", "cut", "tr", "echo", "git",
    ]
    .into_iter()
    .collect()
});

/// Git subcommands permitted at the `readonly` security level.
static READONLY_GIT_SUBCOMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "status", "log", "diff", "show", "branch", "rev-parse", "ls-files", "blame", "describe",
        "worktree",
    ]
    .into_iter()
    .collect()
});

/// Stack-specific launchers permitted at the `allowlist` level, on top of
/// the read-only set.
static STACK_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "npm", "npx", "pnpm", "yarn", "node", "bun", "cargo", "rustc", "go", "python", "python3",
        "pip", "pytest", "uv", "flutter", "dart", "make", "mkdir", "cp", "mv", "touch", "tar",
        "sed", "awk",
    ]
    .into_iter()
    .collect()
});

/// Where in the evaluation chain a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyLayer {
    WorktreePolicy,
    SecurityLevel,
    SessionPermissions,
    Sandbox,
}

/// Result of evaluating one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { layer: PolicyLayer, reason: String },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    fn deny(layer: PolicyLayer, reason: impl Into<String>) -> Self {
        Self::Deny {
            layer,
            reason: reason.into(),
        }
    }
}

/// One command to evaluate.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub command: &'a str,
    /// Whether the command runs inside a task worktree.
    pub in_worktree: bool,
    /// Name of the repository's main branch.
    pub main_branch: &'a str,
}

/// Per-agent command authorization, built from an [`AgentDefinition`] plus
/// project-level deny patterns.
#[derive(Debug, Clone)]
pub struct ExecPolicy {
    level: SecurityLevel,
    extra_allow: HashSet<String>,
    extra_deny: HashSet<String>,
    session_deny_patterns: Vec<String>,
}

impl ExecPolicy {
    pub fn for_agent(definition: &AgentDefinition, session_deny: &[String]) -> Self {
        Self {
            level: definition.security_level,
            extra_allow: definition.extra_allow.iter().cloned().collect(),
            extra_deny: definition.extra_deny.iter().cloned().collect(),
            session_deny_patterns: session_deny.to_vec(),
        }
    }

    /// Run the full evaluation chain.
    pub fn evaluate(&self, request: &ExecRequest<'_>) -> PolicyDecision {
        let command = request.command.trim();
        if command.is_empty() {
            return PolicyDecision::deny(PolicyLayer::SecurityLevel, "empty command");
        }

        // Layer 1: worktree mutation policy. Applies at every level,
        // including `full`.
        if request.in_worktree {
            if let Some(reason) = worktree_violation(command, request.main_branch) {
                return PolicyDecision::deny(PolicyLayer::WorktreePolicy, reason);
            }
        }

        // Layer 2: security level.
        if let Some(reason) = self.level_violation(command) {
            return PolicyDecision::deny(PolicyLayer::SecurityLevel, reason);
        }

        // Layer 3: session permissions (project deny patterns).
        for pattern in &self.session_deny_patterns {
            if !pattern.is_empty() && command.contains(pattern.as_str()) {
                return PolicyDecision::deny(
                    PolicyLayer::SessionPermissions,
                    format!("command matches project deny pattern `{pattern}`"),
                );
            }
        }

        // Layer 4: OS sandbox — enforced outside this process.
        PolicyDecision::Allow
    }

    fn level_violation(&self, command: &str) -> Option<String> {
        let program = match first_program(command) {
            Some(p) => p,
            None => return Some("cannot determine program".to_string()),
        };

        if self.extra_deny.contains(&program) {
            return Some(format!("`{program}` is denied for this agent"));
        }

        match self.level {
            SecurityLevel::Deny => Some("agent has no bash access".to_string()),
            SecurityLevel::Readonly => {
                if !READONLY_COMMANDS.contains(program.as_str())
                    && !self.extra_allow.contains(&program)
                {
                    return Some(format!("`{program}` is not in the read-only set"));
                }
                if program == "git" {
                    if let Some(sub) = git_subcommand(command) {
                        if !READONLY_GIT_SUBCOMMANDS.contains(sub.as_str()) {
                            return Some(format!("`git {sub}` is not read-only"));
                        }
                        // `git worktree list` only; add/remove mutate.
                        if sub == "worktree" && !command.contains("list") {
                            return Some("only `git worktree list` is read-only".to_string());
                        }
                    }
                }
                None
            }
            SecurityLevel::Allowlist => {
                let allowed = READONLY_COMMANDS.contains(program.as_str())
                    || STACK_COMMANDS.contains(program.as_str())
                    || self.extra_allow.contains(&program);
                if allowed {
                    None
                } else {
                    Some(format!("`{program}` is not in the detected-stack allowlist"))
                }
            }
            SecurityLevel::Full => None,
        }
    }
}

/// Mutations forbidden inside a worktree regardless of security level:
/// merging, pushing, rebasing, hard resets, and any checkout of the main
/// branch. `add`, `commit`, `status`, `diff` stay allowed.
fn worktree_violation(command: &str, main_branch: &str) -> Option<String> {
    let tokens: Vec<&str> = command.split_whitespace().collect();

    for (i, window) in tokens.windows(2).enumerate() {
        if window[0] != "git" {
            continue;
        }
        let sub = window[1];
        match sub {
            "merge" | "push" | "rebase" => {
                return Some(format!("`git {sub}` is forbidden inside a worktree"));
            }
            "reset" => {
                if tokens.get(i + 2) == Some(&"--hard") {
                    return Some("`git reset --hard` is forbidden inside a worktree".to_string());
                }
            }
            "checkout" | "switch" => {
                let target = tokens.get(i + 2).copied().unwrap_or("");
                if target == main_branch {
                    return Some(format!(
                        "checking out `{main_branch}` inside a worktree is forbidden"
                    ));
                }
            }
            _ => {}
        }
    }
    None
}

/// First program of a (possibly compound) shell line.
///
/// Conservative: a line chained with `;`, `&&`, `|` is evaluated on every
/// segment, and the strictest answer wins at the call site by evaluating
/// segment-by-segment.
fn first_program(command: &str) -> Option<String> {
    command
        .split_whitespace()
        .next()
        .map(|p| p.rsplit('/').next().unwrap_or(p).to_string())
}

fn git_subcommand(command: &str) -> Option<String> {
    let mut tokens = command.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != "git" {
            continue;
        }
        // Skip global flags like `-C path`.
        while let Some(candidate) = tokens.next() {
            if candidate == "-C" {
                tokens.next();
                continue;
            }
            if candidate.starts_with('-') {
                continue;
            }
            return Some(candidate.to_string());
        }
    }
    None
}
