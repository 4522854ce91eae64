// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Project index and capability detection.
//!
//! `{privateDir}/project_index.json` is produced by an out-of-scope project
//! analyzer. The core only reads it: validators take their lint/build/test
//! and dev-server commands from here (command sources are authoritative —
//! validators do not invent commands), and the QA loop selects validators by
//! the capability flags derived from it.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PRIVATE_DIR;

/// Index file name inside the project-private directory.
pub const PROJECT_INDEX_FILE: &str = "project_index.json";

/// One service entry in the project index.
///
/// The analyzer emits either a map or a list of these; both are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openapi_file: Option<String>,
}

/// Parsed project index.
#[derive(Debug, Clone, Default)]
pub struct ProjectIndex {
    pub services: Vec<ServiceEntry>,
}

impl ProjectIndex {
    pub fn path_for(project_dir: &Path) -> PathBuf {
        project_dir.join(PRIVATE_DIR).join(PROJECT_INDEX_FILE)
    }

    /// Load the index; a missing or unreadable file yields an empty index.
    pub fn load(project_dir: &Path) -> Self {
        let path = Self::path_for(project_dir);
        let Ok(text) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            tracing::warn!(path = %path.display(), "project index is not valid JSON");
            return Self::default();
        };
        Self::from_value(&value)
    }

    /// Accepts `services` as either an object keyed by name or a list.
    pub fn from_value(value: &Value) -> Self {
        let mut services = Vec::new();
        match value.get("services") {
            Some(Value::Object(map)) => {
                for (name, entry) in map {
                    if let Ok(mut svc) = serde_json::from_value::<ServiceEntry>(entry.clone()) {
                        if svc.name.is_empty() {
                            svc.name = name.clone();
                        }
                        services.push(svc);
                    }
                }
            }
            Some(Value::Array(items)) => {
                for entry in items {
                    if let Ok(svc) = serde_json::from_value::<ServiceEntry>(entry.clone()) {
                        services.push(svc);
                    }
                }
            }
            _ => {}
        }
        Self { services }
    }

    /// First lint/build/test commands across services.
    pub fn build_commands(&self) -> BuildCommands {
        let mut commands = BuildCommands::default();
        for svc in &self.services {
            if commands.lint.is_none() {
                commands.lint = svc.lint_command.clone();
            }
            if commands.build.is_none() {
                commands.build = svc.build_command.clone();
            }
            if commands.test.is_none() {
                commands.test = svc.test_command.clone();
            }
        }
        commands
    }

    /// First service carrying a dev-server command.
    pub fn dev_server(&self) -> Option<DevServer> {
        for svc in &self.services {
            let Some(command) = svc.dev_command.clone() else {
                continue;
            };
            let port = svc
                .default_port
                .or_else(|| port_from_command(&command))
                .or_else(|| framework_default_port(&svc.framework));
            let Some(port) = port else { continue };
            return Some(DevServer {
                command,
                port,
                framework: svc.framework.clone(),
            });
        }
        None
    }

    /// First migrate command across services.
    pub fn migrate_command(&self) -> Option<String> {
        self.services
            .iter()
            .find_map(|svc| svc.migrate_command.clone())
    }

    /// First explicitly-declared OpenAPI manifest.
    pub fn openapi_file(&self) -> Option<String> {
        self.services.iter().find_map(|svc| svc.openapi_file.clone())
    }
}

/// Lint/build/test commands resolved from the index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildCommands {
    pub lint: Option<String>,
    pub build: Option<String>,
    pub test: Option<String>,
}

impl BuildCommands {
    pub fn is_empty(&self) -> bool {
        self.lint.is_none() && self.build.is_none() && self.test.is_none()
    }
}

/// Resolved dev-server launch info for the browser validator.
#[derive(Debug, Clone, PartialEq)]
pub struct DevServer {
    pub command: String,
    pub port: u16,
    pub framework: String,
}

/// --port 3000 / --port=3000 / --web-port 8080
static PORT_FLAG: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"--(?:web-)?port[=\s]+(\d{2,5})").unwrap());
/// host:port in the command line
static PORT_SUFFIX: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r":(\d{4,5})\b").unwrap());

fn port_from_command(command: &str) -> Option<u16> {
    if let Some(cap) = PORT_FLAG.captures(command) {
        return cap[1].parse().ok();
    }
    PORT_SUFFIX
        .captures(command)
        .and_then(|cap| cap[1].parse().ok())
}

fn framework_default_port(framework: &str) -> Option<u16> {
    let fw = framework.to_lowercase();
    let table: &[(&str, u16)] = &[
        ("flutter", 8080),
        ("next", 3000),
        ("nuxt", 3000),
        ("vite", 5173),
        ("svelte", 5173),
        ("react", 3000),
        ("angular", 4200),
        ("vue", 8080),
        ("expo", 8081),
    ];
    table
        .iter()
        .find(|(key, _)| fw.contains(key))
        .map(|(_, port)| *port)
}

// ============================================================================
// Capabilities
// ============================================================================

/// Project capability flags driving validator selection and MCP bindings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub is_web_frontend: bool,
    pub is_flutter: bool,
    pub is_electron: bool,
    pub is_tauri: bool,
    pub is_expo: bool,
    pub has_database: bool,
    pub has_api: bool,
}

impl Capabilities {
    /// Derive capability flags from the project index.
    pub fn detect(index: &ProjectIndex) -> Self {
        let mut caps = Self::default();
        for svc in &index.services {
            let fw = svc.framework.to_lowercase();
            if fw.contains("flutter") {
                caps.is_flutter = true;
            }
            if fw.contains("electron") {
                caps.is_electron = true;
            }
            if fw.contains("tauri") {
                caps.is_tauri = true;
            }
            if fw.contains("expo") {
                caps.is_expo = true;
            }
            if ["next", "nuxt", "vite", "react", "vue", "angular", "svelte"]
                .iter()
                .any(|key| fw.contains(key))
                || svc.dev_command.is_some() && !caps.is_electron
            {
                caps.is_web_frontend = true;
            }
            if svc.migrate_command.is_some() {
                caps.has_database = true;
            }
            if svc.openapi_file.is_some()
                || ["fastapi", "express", "axum", "flask", "django", "rails"]
                    .iter()
                    .any(|key| fw.contains(key))
            {
                caps.has_api = true;
            }
        }
        caps
    }

    /// Whether any browser-driven surface exists.
    pub fn needs_browser(&self) -> bool {
        self.is_web_frontend || self.is_flutter || self.is_expo || self.is_tauri
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> ProjectIndex {
        ProjectIndex::from_value(&serde_json::json!({
            "services": {
                "web": {
                    "framework": "next",
                    "lint_command": "npm run lint",
                    "build_command": "npm run build",
                    "test_command": "npm test",
                    "dev_command": "npm run dev",
                    "default_port": 3000
                },
                "api": {
                    "framework": "fastapi",
                    "test_command": "pytest",
                    "migrate_command": "alembic upgrade head",
                    "openapi_file": "openapi.json"
                }
            }
        }))
    }

    #[test]
    fn test_services_as_map() {
        let index = sample_index();
        assert_eq!(index.services.len(), 2);
        let commands = index.build_commands();
        assert_eq!(commands.lint.as_deref(), Some("npm run lint"));
        assert_eq!(commands.test.as_deref(), Some("npm test"));
    }

    #[test]
    fn test_services_as_list() {
        let index = ProjectIndex::from_value(&serde_json::json!({
            "services": [
                {"name": "app", "framework": "vite", "dev_command": "npm run dev"}
            ]
        }));
        assert_eq!(index.services.len(), 1);
        let dev = index.dev_server().unwrap();
        assert_eq!(dev.port, 5173);
    }

    #[test]
    fn test_port_extraction() {
        assert_eq!(port_from_command("next dev --port 4000"), Some(4000));
        assert_eq!(port_from_command("serve --port=8081"), Some(8081));
        assert_eq!(port_from_command("run at 127.0.0.1:5173"), Some(5173));
        assert_eq!(port_from_command("npm run dev"), None);
    }

    #[test]
    fn test_capability_detection() {
        let caps = Capabilities::detect(&sample_index());
        assert!(caps.is_web_frontend);
        assert!(caps.has_api);
        assert!(caps.has_database);
        assert!(!caps.is_flutter);
        assert!(caps.needs_browser());
    }

    #[test]
    fn test_missing_index_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = ProjectIndex::load(dir.path());
        assert!(index.services.is_empty());
        assert!(index.build_commands().is_empty());
    }
}
