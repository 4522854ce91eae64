// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the orchestration core.
//!
//! This module provides strongly-typed errors for the different parts of the
//! daemon, using `thiserror` for ergonomic error definitions and `anyhow`
//! for propagation at the binary boundary.
//!
//! The taxonomy distinguishes errors that are recovered locally (transient
//! agent errors, worktree acquisition within its retry cap) from errors that
//! are surfaced to the plan. `Cancelled` is not an error condition; it
//! signals orderly shutdown.

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
///
/// Fatal at startup; mapped to exit code 1.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Duplicate agent name: {0}")]
    DuplicateAgent(String),

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors about the project the daemon is pointed at.
///
/// Fatal for this invocation: a second live daemon holds the lock, or the
/// specs directory does not exist.
#[derive(Error, Debug)]
pub enum ProjectStateError {
    #[error("Another daemon is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("Project not initialized: {0}")]
    ProjectNotInitialized(String),

    #[error("Lock file error: {0}")]
    LockFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProjectStateError {
    /// Process exit code for this error, per the daemon CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AlreadyRunning { .. } => 2,
            Self::ProjectNotInitialized(_) => 3,
            Self::LockFile(_) | Self::Io(_) => 1,
        }
    }
}

/// Errors raised when a plan file cannot be read or fails schema validation.
///
/// A task with an unreadable plan is quarantined, never overwritten.
#[derive(Error, Debug)]
pub enum PlanSchemaError {
    #[error("Plan file not found: {0}")]
    NotFound(String),

    #[error("Plan is not valid JSON: {0}")]
    Parse(String),

    #[error("Plan missing required field: {0}")]
    MissingField(String),

    #[error("Invalid plan field {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("Status twin mismatch: status={status} xstateState={xstate}")]
    TwinMismatch { status: String, xstate: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PlanSchemaError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PlanSchemaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Errors from an agent session.
///
/// Transient errors (rate limit, 5xx, network reset) are retried with
/// exponential backoff; persistent errors surface to the phase.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session ended with error: {0}")]
    SessionFailed(String),

    #[error("Transient retry cap exceeded after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl AgentError {
    /// Whether this error should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Network(_) | Self::Timeout(_)
        ) || matches!(self, Self::ServerError { status, .. } if *status >= 500)
    }

    /// Classify an error message against the configured transient set.
    ///
    /// Used when the underlying session library reports errors as strings.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("rate limit") || lower.contains("429") {
            Self::RateLimited(message.to_string())
        } else if lower.contains("overloaded")
            || lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("529")
        {
            Self::ServerError {
                status: 500,
                message: message.to_string(),
            }
        } else if lower.contains("connection")
            || lower.contains("network")
            || lower.contains("reset")
            || lower.contains("timed out")
        {
            Self::Network(message.to_string())
        } else if lower.contains("auth") || lower.contains("401") || lower.contains("403") {
            Self::Auth(message.to_string())
        } else {
            Self::SessionFailed(message.to_string())
        }
    }
}

/// Errors from a validator that prevented it from producing a verdict.
///
/// Setup failures mark the validator `skipped`, never `passed=false`;
/// assertion failures are evidence, not errors, and live on
/// `ValidatorResult` instead.
#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("Validator setup failed: {0}")]
    Setup(String),

    #[error("Required binary missing: {0}")]
    BinaryMissing(String),

    #[error("Dev server did not come up on port {port} within {waited_secs}s")]
    ServerTimeout { port: u16, waited_secs: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias using anyhow for flexible propagation at the binary level.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_transient() {
        assert!(AgentError::RateLimited("slow down".into()).is_transient());
        assert!(AgentError::Network("reset by peer".into()).is_transient());
        assert!(AgentError::Timeout(30_000).is_transient());
        assert!(AgentError::ServerError {
            status: 529,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(!AgentError::Auth("bad key".into()).is_transient());
        assert!(!AgentError::InvalidRequest("no model".into()).is_transient());
        assert!(!AgentError::ServerError {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
    }

    #[test]
    fn test_agent_error_classify() {
        assert!(matches!(
            AgentError::classify("HTTP 429: rate limit exceeded"),
            AgentError::RateLimited(_)
        ));
        assert!(matches!(
            AgentError::classify("connection reset by peer"),
            AgentError::Network(_)
        ));
        assert!(matches!(
            AgentError::classify("401 unauthorized"),
            AgentError::Auth(_)
        ));
        assert!(matches!(
            AgentError::classify("model produced no output"),
            AgentError::SessionFailed(_)
        ));
        assert!(AgentError::classify("server overloaded, try later").is_transient());
    }

    #[test]
    fn test_project_state_exit_codes() {
        assert_eq!(ProjectStateError::AlreadyRunning { pid: 42 }.exit_code(), 2);
        assert_eq!(
            ProjectStateError::ProjectNotInitialized("/p".into()).exit_code(),
            3
        );
    }

    #[test]
    fn test_plan_schema_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("not json");
        let err: PlanSchemaError = result.unwrap_err().into();
        assert!(matches!(err, PlanSchemaError::Parse(_)));
    }

    #[test]
    fn test_config_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ConfigError = io_err.into();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
