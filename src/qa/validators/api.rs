// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API validator.
//!
//! When an OpenAPI (or swagger) manifest is present, issues a small set of
//! probe requests — a health endpoint plus one representative GET per
//! resource — and reports non-2xx and 5xx counts. No manifest means the
//! validator is skipped, not failed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{Severity, Validator, ValidatorContext, ValidatorEvidence, ValidatorResult};
use crate::project::Capabilities;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// One representative GET per resource, capped.
const MAX_PROBES: usize = 8;

/// Manifest names searched at the project root when the index does not
/// declare one.
const MANIFEST_CANDIDATES: &[&str] = &[
    "openapi.json",
    "openapi.yaml",
    "openapi.yml",
    "swagger.json",
    "docs/openapi.json",
    "api/openapi.json",
];

pub struct ApiValidator;

#[async_trait]
impl Validator for ApiValidator {
    fn name(&self) -> &'static str {
        "api"
    }

    fn selectable(&self, capabilities: &Capabilities) -> bool {
        capabilities.has_api
    }

    async fn run(&self, ctx: &ValidatorContext) -> ValidatorResult {
        let started = Instant::now();

        let Some(manifest_path) = find_manifest(ctx) else {
            return ValidatorResult::skipped(self.name(), "no OpenAPI manifest found")
                .timed(started);
        };

        let manifest = match load_manifest(&manifest_path) {
            Ok(m) => m,
            Err(reason) => {
                return ValidatorResult::skipped(
                    self.name(),
                    format!("manifest unreadable: {reason}"),
                )
                .timed(started)
            }
        };

        let base_url = base_url(&manifest, &ctx.index);
        let probes = probe_paths(&manifest);
        if probes.is_empty() {
            return ValidatorResult::skipped(self.name(), "manifest declares no GET routes")
                .timed(started);
        }

        let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
            Ok(c) => c,
            Err(e) => {
                return ValidatorResult::skipped(self.name(), format!("http client: {e}"))
                    .timed(started)
            }
        };

        let mut statuses: BTreeMap<String, u16> = BTreeMap::new();
        let mut transport_failures = 0usize;

        for path in probes {
            if ctx.cancel.is_cancelled() {
                return ValidatorResult::skipped(self.name(), "cancelled").timed(started);
            }
            let url = format!("{base_url}{path}");
            debug!(url = %url, "api probe");
            match client.get(&url).send().await {
                Ok(resp) => {
                    statuses.insert(path, resp.status().as_u16());
                }
                Err(_) => {
                    transport_failures += 1;
                    statuses.insert(path, 0);
                }
            }
        }

        if transport_failures == statuses.len() {
            // Nothing answered at all: the server is not up, which is a
            // setup condition, not an assertion failure.
            return ValidatorResult::skipped(
                self.name(),
                format!("no endpoint reachable at {base_url}"),
            )
            .timed(started);
        }

        let server_errors = statuses.values().filter(|s| **s >= 500).count();
        let non_2xx = statuses
            .values()
            .filter(|s| **s != 0 && !(200..300).contains(&(**s as i32)))
            .count();

        let evidence = ValidatorEvidence {
            probe_statuses: statuses.clone(),
            ..Default::default()
        };

        let result = if server_errors > 0 {
            ValidatorResult::failed(
                self.name(),
                Severity::Major,
                format!(
                    "{server_errors} probe(s) returned 5xx, {non_2xx} non-2xx of {} probed",
                    statuses.len()
                ),
            )
        } else if non_2xx > 0 {
            ValidatorResult::failed(
                self.name(),
                Severity::Minor,
                format!("{non_2xx} probe(s) non-2xx of {} probed", statuses.len()),
            )
        } else {
            ValidatorResult::passed(
                self.name(),
                format!("{} probe(s) all 2xx", statuses.len()),
            )
        };
        result.with_evidence(evidence).timed(started)
    }
}

fn find_manifest(ctx: &ValidatorContext) -> Option<PathBuf> {
    if let Some(declared) = ctx.index.openapi_file() {
        let path = ctx.working_dir.join(&declared);
        if path.exists() {
            return Some(path);
        }
    }
    MANIFEST_CANDIDATES
        .iter()
        .map(|candidate| ctx.working_dir.join(candidate))
        .find(|path| path.exists())
}

fn load_manifest(path: &std::path::Path) -> Result<Value, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&text).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&text).map_err(|e| e.to_string())
    }
}

/// Server base URL from the manifest, falling back to the dev-server port.
fn base_url(manifest: &Value, index: &crate::project::ProjectIndex) -> String {
    if let Some(url) = manifest
        .get("servers")
        .and_then(|s| s.get(0))
        .and_then(|s| s.get("url"))
        .and_then(Value::as_str)
    {
        if url.starts_with("http") {
            return url.trim_end_matches('/').to_string();
        }
    }
    let port = index.dev_server().map(|d| d.port).unwrap_or(8000);
    format!("http://127.0.0.1:{port}")
}

/// Health first, then one representative parameterless GET per resource.
fn probe_paths(manifest: &Value) -> Vec<String> {
    let mut probes = Vec::new();
    let Some(paths) = manifest.get("paths").and_then(Value::as_object) else {
        return probes;
    };

    for health in ["/health", "/healthz", "/api/health"] {
        if paths.contains_key(health) {
            probes.push(health.to_string());
            break;
        }
    }

    let mut seen_resources = std::collections::HashSet::new();
    for (path, methods) in paths {
        if probes.len() >= MAX_PROBES {
            break;
        }
        if path.contains('{') {
            continue; // needs parameters, not a cheap probe
        }
        let has_get = methods
            .as_object()
            .map(|m| m.contains_key("get"))
            .unwrap_or(false);
        if !has_get {
            continue;
        }
        let resource = path.trim_start_matches('/').split('/').next().unwrap_or("");
        if seen_resources.insert(resource.to_string()) && !probes.contains(path) {
            probes.push(path.clone());
        }
    }
    probes
}
