// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracing initialization.

use std::path::Path;

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Configuration for log output.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,
    /// Whether to include target module path.
    pub include_target: bool,
    /// Whether to use ANSI colors in output.
    pub ansi_colors: bool,
    /// Custom filter directive (overrides default_level).
    pub filter_directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            include_target: false,
            ansi_colors: true,
            filter_directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Verbose output for debugging a misbehaving daemon.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            include_target: true,
            ansi_colors: true,
            filter_directive: None,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }
}

/// Initialize the global tracing subscriber.
///
/// `log_file`, when given, receives a second non-ANSI copy of every record.
/// Safe to call once per process; later calls are ignored.
pub fn init(config: TelemetryConfig, log_file: Option<&Path>) {
    let filter = match &config.filter_directive {
        Some(directive) => EnvFilter::try_new(directive.clone()).unwrap_or_else(|_| {
            EnvFilter::new(format!("autoforge={}", config.default_level))
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("autoforge={}", config.default_level))
        }),
    };

    let stdout_layer = fmt::layer()
        .with_target(config.include_target)
        .with_ansi(config.ansi_colors);

    let file_layer = log_file.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
            .map(|file| {
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(file)
            })
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.default_level, Level::INFO);
        assert!(!config.include_target);
    }

    #[test]
    fn test_builder() {
        let config = TelemetryConfig::default()
            .with_level(Level::TRACE)
            .with_filter("autoforge=debug");
        assert_eq!(config.default_level, Level::TRACE);
        assert_eq!(config.filter_directive.as_deref(), Some("autoforge=debug"));
    }
}
