// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent registry.
//!
//! One in-process map from agent kind to [`AgentDefinition`]: its tool
//! profile, MCP bindings, security level, thinking default, and prompts.
//! Custom agents load from a project-local config at startup and live in a
//! parallel map; a custom agent may not shadow a built-in name.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::project::Capabilities;
use crate::settings::{marionette_disabled, ThinkingLevel};

/// Project-local custom agent config file, inside the private directory.
pub const CUSTOM_AGENTS_FILE: &str = "custom_agents.json";

// ============================================================================
// Enums
// ============================================================================

/// Built-in agent kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Planner,
    Coder,
    QaReviewer,
    QaFixer,
    Verifier,
    ErrorCheck,
    DesignArchitect,
    MergeResolver,
    Researcher,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::QaReviewer => "qa_reviewer",
            Self::QaFixer => "qa_fixer",
            Self::Verifier => "verifier",
            Self::ErrorCheck => "error_check",
            Self::DesignArchitect => "design_architect",
            Self::MergeResolver => "merge_resolver",
            Self::Researcher => "researcher",
        }
    }

    pub fn all() -> &'static [AgentKind] {
        &[
            Self::Planner,
            Self::Coder,
            Self::QaReviewer,
            Self::QaFixer,
            Self::Verifier,
            Self::ErrorCheck,
            Self::DesignArchitect,
            Self::MergeResolver,
            Self::Researcher,
        ]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bash access level. First defense layer for command dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// No commands permitted.
    Deny,
    /// Only commands from the built-in read-only set.
    Readonly,
    /// Detected-stack allowlist plus extra_allow minus extra_deny.
    Allowlist,
    /// Defers to the project security profile (worktree policy still applies).
    Full,
}

/// Frequently-combined toolsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolProfile {
    Minimal,
    Readonly,
    Coding,
    Qa,
    Full,
}

impl ToolProfile {
    /// Tool names bundled by this profile.
    pub fn tools(&self) -> &'static [&'static str] {
        match self {
            Self::Minimal => &["read_file"],
            Self::Readonly => &["read_file", "glob", "grep", "list_dir", "bash"],
            Self::Coding => &[
                "read_file",
                "write_file",
                "edit_file",
                "glob",
                "grep",
                "list_dir",
                "bash",
            ],
            Self::Qa => &[
                "read_file",
                "glob",
                "grep",
                "list_dir",
                "bash",
                "update_qa_status",
            ],
            Self::Full => &[
                "read_file",
                "write_file",
                "edit_file",
                "glob",
                "grep",
                "list_dir",
                "bash",
                "web_fetch",
                "web_search",
            ],
        }
    }
}

/// How the agent's session is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentExecutionMode {
    /// Read-only exploration.
    Plan,
    /// Unattended, no permission prompts.
    Headless,
    Standard,
}

// ============================================================================
// Definition
// ============================================================================

/// Everything the core knows about one agent kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub extra_tools: Vec<String>,
    #[serde(default)]
    pub thinking_default: ThinkingLevel,
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub extra_allow: Vec<String>,
    #[serde(default)]
    pub extra_deny: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    pub execution_mode: AgentExecutionMode,
    pub tool_profile: ToolProfile,
}

impl AgentDefinition {
    fn new(
        tool_profile: ToolProfile,
        security_level: SecurityLevel,
        execution_mode: AgentExecutionMode,
        thinking_default: ThinkingLevel,
    ) -> Self {
        Self {
            tools: tool_profile.tools().iter().map(|t| t.to_string()).collect(),
            mcp_servers: Vec::new(),
            extra_tools: Vec::new(),
            thinking_default,
            security_level,
            extra_allow: Vec::new(),
            extra_deny: Vec::new(),
            system_prompt: None,
            prompt_template: None,
            execution_mode,
            tool_profile,
        }
    }

    fn with_mcp(mut self, servers: &[&str]) -> Self {
        self.mcp_servers = servers.iter().map(|s| s.to_string()).collect();
        self
    }

    fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = Some(prompt.to_string());
        self
    }

    /// The full tool list: profile tools plus extras.
    pub fn all_tools(&self) -> Vec<String> {
        let mut tools = self.tools.clone();
        for extra in &self.extra_tools {
            if !tools.contains(extra) {
                tools.push(extra.clone());
            }
        }
        tools
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Single source of truth mapping agent kinds to definitions.
///
/// Built-ins are enum-keyed; custom agents loaded from project config sit in
/// a parallel string-keyed map. On name lookup, built-ins win and duplicate
/// registration of a built-in name is an error.
pub struct AgentRegistry {
    builtin: HashMap<AgentKind, AgentDefinition>,
    custom: HashMap<String, AgentDefinition>,
}

impl AgentRegistry {
    /// Registry with the built-in agent set.
    pub fn with_defaults() -> Self {
        use AgentExecutionMode as Mode;
        use SecurityLevel as Sec;
        use ThinkingLevel as Think;
        use ToolProfile as Profile;

        let mut builtin = HashMap::new();

        builtin.insert(
            AgentKind::Planner,
            AgentDefinition::new(Profile::Readonly, Sec::Readonly, Mode::Plan, Think::High)
                .with_mcp(&["context7"])
                .with_system_prompt("planner.md"),
        );
        builtin.insert(
            AgentKind::Coder,
            AgentDefinition::new(Profile::Coding, Sec::Allowlist, Mode::Headless, Think::Medium)
                .with_mcp(&["context7"])
                .with_system_prompt("coder.md"),
        );
        builtin.insert(
            AgentKind::QaReviewer,
            AgentDefinition::new(Profile::Qa, Sec::Readonly, Mode::Headless, Think::High)
                .with_mcp(&["browser"])
                .with_system_prompt("qa_reviewer.md"),
        );
        builtin.insert(
            AgentKind::QaFixer,
            AgentDefinition::new(Profile::Coding, Sec::Allowlist, Mode::Headless, Think::Medium)
                .with_mcp(&["browser", "context7"])
                .with_system_prompt("qa_fixer.md"),
        );
        builtin.insert(
            AgentKind::Verifier,
            AgentDefinition::new(Profile::Qa, Sec::Allowlist, Mode::Headless, Think::Medium)
                .with_mcp(&["browser"])
                .with_system_prompt("verifier.md"),
        );
        builtin.insert(
            AgentKind::ErrorCheck,
            AgentDefinition::new(Profile::Coding, Sec::Allowlist, Mode::Headless, Think::Medium)
                .with_system_prompt("error_check.md"),
        );
        builtin.insert(
            AgentKind::DesignArchitect,
            AgentDefinition::new(Profile::Readonly, Sec::Readonly, Mode::Plan, Think::Ultrathink)
                .with_system_prompt("design_architect.md"),
        );
        builtin.insert(
            AgentKind::MergeResolver,
            AgentDefinition::new(Profile::Coding, Sec::Allowlist, Mode::Headless, Think::High)
                .with_system_prompt("merge_resolver.md"),
        );
        builtin.insert(
            AgentKind::Researcher,
            AgentDefinition::new(Profile::Readonly, Sec::Readonly, Mode::Plan, Think::Medium)
                .with_mcp(&["context7"]),
        );

        Self {
            builtin,
            custom: HashMap::new(),
        }
    }

    pub fn get(&self, kind: AgentKind) -> &AgentDefinition {
        self.builtin
            .get(&kind)
            .expect("all built-in kinds registered by with_defaults")
    }

    /// Lookup by name with built-in precedence.
    pub fn get_named(&self, name: &str) -> Option<&AgentDefinition> {
        if let Some(kind) = AgentKind::from_name(name) {
            return self.builtin.get(&kind);
        }
        self.custom.get(name)
    }

    pub fn custom_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.custom.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Register one custom agent. Rejects built-in and duplicate names.
    pub fn register_custom(
        &mut self,
        name: &str,
        definition: AgentDefinition,
    ) -> Result<(), ConfigError> {
        if AgentKind::from_name(name).is_some() || self.custom.contains_key(name) {
            return Err(ConfigError::DuplicateAgent(name.to_string()));
        }
        self.custom.insert(name.to_string(), definition);
        Ok(())
    }

    /// Load custom agents from `{privateDir}/custom_agents.json`.
    ///
    /// Returns the number loaded. A missing file is not an error; a file
    /// with a name collision is.
    pub fn load_custom(&mut self, private_dir: &Path) -> Result<usize, ConfigError> {
        let path = private_dir.join(CUSTOM_AGENTS_FILE);
        if !path.exists() {
            return Ok(0);
        }
        let text = std::fs::read_to_string(&path)?;
        let parsed: HashMap<String, AgentDefinition> = serde_json::from_str(&text)?;
        let count = parsed.len();
        for (name, definition) in parsed {
            self.register_custom(&name, definition)?;
        }
        Ok(count)
    }

    /// Resolve the dynamic MCP server list for an agent kind.
    ///
    /// `browser` expands per project type: electron apps get the electron
    /// bridge, everything browser-shaped gets playwright, and Flutter also
    /// gets the marionette widget bridge unless disabled by environment.
    pub fn resolve_mcp_servers(&self, kind: AgentKind, caps: &Capabilities) -> Vec<String> {
        let mut servers = Vec::new();
        for server in &self.get(kind).mcp_servers {
            if server == "browser" {
                if caps.is_electron {
                    servers.push("electron".to_string());
                } else if caps.needs_browser() {
                    servers.push("playwright".to_string());
                }
                if caps.is_flutter && !marionette_disabled() {
                    servers.push("marionette".to_string());
                }
            } else if !servers.contains(server) {
                servers.push(server.clone());
            }
        }
        servers
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
