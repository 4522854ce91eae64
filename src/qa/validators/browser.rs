// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Browser validator.
//!
//! Starts the project's dev server, waits for its port, drives a Chromium
//! instance over the DevTools protocol, and captures evidence: a full-page
//! screenshot under `{specDir}/screenshots/`, an accessibility snapshot
//! summary, and the console message stream.
//!
//! `passed = false` only when navigation completely fails; console warnings
//! are evidence for the reviewer, not failure. Both the dev server and the
//! browser are killed with group-kill semantics on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Severity, Validator, ValidatorContext, ValidatorEvidence, ValidatorResult};
use crate::process::{kill_tree, supervised_command, supervised_shell};
use crate::project::Capabilities;
use crate::settings::headless_browser_forced;

/// Cap on waiting for the dev server port.
const PORT_POLL_CAP: Duration = Duration::from_secs(120);
/// Cap on the page load after navigation.
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Screenshot file for the first page load.
const INITIAL_SCREENSHOT: &str = "01-initial-load.png";

const CHROME_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

pub struct BrowserValidator;

#[async_trait]
impl Validator for BrowserValidator {
    fn name(&self) -> &'static str {
        "browser"
    }

    fn selectable(&self, capabilities: &Capabilities) -> bool {
        capabilities.needs_browser()
    }

    async fn run(&self, ctx: &ValidatorContext) -> ValidatorResult {
        let started = Instant::now();

        let Some(dev) = ctx.index.dev_server() else {
            return ValidatorResult::skipped(self.name(), "no dev-server command in project index")
                .timed(started);
        };

        let Some(chrome) = find_chrome() else {
            return ValidatorResult::skipped(self.name(), "no Chromium/Chrome binary found")
                .timed(started);
        };

        info!(command = %dev.command, port = dev.port, "starting dev server");
        let mut server = match supervised_shell(&dev.command, &ctx.working_dir).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ValidatorResult::skipped(
                    self.name(),
                    format!("dev server failed to spawn: {e}"),
                )
                .timed(started)
            }
        };

        let result = self.run_with_server(ctx, &chrome, dev.port, started).await;

        // Group-kill on every exit path.
        kill_tree(&mut server, Duration::from_secs(5)).await;
        result
    }
}

impl BrowserValidator {
    async fn run_with_server(
        &self,
        ctx: &ValidatorContext,
        chrome: &str,
        port: u16,
        started: Instant,
    ) -> ValidatorResult {
        if let Err(reason) = poll_port(port, PORT_POLL_CAP, &ctx.cancel).await {
            return ValidatorResult::skipped(self.name(), reason).timed(started);
        }

        let debug_port = match free_port() {
            Some(p) => p,
            None => {
                return ValidatorResult::skipped(self.name(), "no free debugging port")
                    .timed(started)
            }
        };

        // Headless by default for unattended runs; HEADLESS_BROWSER=true
        // forces it even where a display is available.
        let headless = headless_browser_forced() || std::env::var("DISPLAY").is_err();
        let mut args: Vec<String> = vec![
            format!("--remote-debugging-port={debug_port}"),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--user-data-dir=/tmp/autoforge-chrome".to_string(),
            "about:blank".to_string(),
        ];
        if headless {
            args.insert(0, "--headless=new".to_string());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let mut browser = match supervised_command(chrome, &arg_refs, &ctx.working_dir).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ValidatorResult::skipped(self.name(), format!("browser spawn: {e}"))
                    .timed(started)
            }
        };

        let result = self.browse(ctx, debug_port, port, started).await;
        kill_tree(&mut browser, Duration::from_secs(5)).await;
        result
    }

    async fn browse(
        &self,
        ctx: &ValidatorContext,
        debug_port: u16,
        app_port: u16,
        started: Instant,
    ) -> ValidatorResult {
        let ws_url = match discover_page_target(debug_port, &ctx.cancel).await {
            Ok(url) => url,
            Err(reason) => return ValidatorResult::skipped(self.name(), reason).timed(started),
        };

        let mut client = match CdpClient::connect(&ws_url).await {
            Ok(c) => c,
            Err(reason) => {
                return ValidatorResult::skipped(self.name(), format!("CDP connect: {reason}"))
                    .timed(started)
            }
        };

        for domain in ["Page", "Runtime"] {
            if let Err(reason) = client.enable_domain(domain).await {
                return ValidatorResult::skipped(
                    self.name(),
                    format!("{domain}.enable: {reason}"),
                )
                .timed(started);
            }
        }

        let url = format!("http://127.0.0.1:{app_port}/");
        info!(url = %url, "navigating");
        let mut evidence = ValidatorEvidence::default();

        // Navigation failure is the one central assertion of this validator.
        let nav = client
            .send_command("Page.navigate", serde_json::json!({ "url": url.as_str() }))
            .await;
        let nav_error = match &nav {
            Err(reason) => Some(reason.clone()),
            Ok(result) => result
                .get("errorText")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        };
        if let Some(reason) = nav_error {
            return ValidatorResult::failed(
                self.name(),
                Severity::Critical,
                format!("navigation to {url} failed: {reason}"),
            )
            .with_evidence(evidence)
            .timed(started);
        }

        // Wait for the load event, collecting console messages on the way.
        let deadline = Instant::now() + LOAD_TIMEOUT;
        let mut loaded = false;
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                event = tokio::time::timeout(remaining, client.recv_event()) => event,
            };
            match event {
                Ok(Some(cdp_event)) => {
                    if cdp_event.method == "Page.loadEventFired" {
                        loaded = true;
                        break;
                    }
                    if let Some(line) = format_console_event(&cdp_event) {
                        evidence.console.push(line);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        // Drain console messages that arrive just after load.
        tokio::time::sleep(Duration::from_millis(500)).await;
        while let Ok(Some(cdp_event)) =
            tokio::time::timeout(Duration::from_millis(50), client.recv_event()).await
        {
            if let Some(line) = format_console_event(&cdp_event) {
                evidence.console.push(line);
            }
        }

        // Screenshot: evidence, not a gate.
        let screenshots_dir = ctx.spec_dir.join("screenshots");
        match client
            .send_command(
                "Page.captureScreenshot",
                serde_json::json!({ "captureBeyondViewport": true }),
            )
            .await
        {
            Ok(result) => {
                if let Some(data) = result.get("data").and_then(Value::as_str) {
                    if let Ok(bytes) = B64.decode(data) {
                        if std::fs::create_dir_all(&screenshots_dir).is_ok() {
                            let path = screenshots_dir.join(INITIAL_SCREENSHOT);
                            if std::fs::write(&path, bytes).is_ok() {
                                evidence.screenshots.push(path);
                            }
                        }
                    }
                }
            }
            Err(reason) => warn!(reason = %reason, "screenshot capture failed"),
        }

        // Accessibility snapshot summary.
        if let Ok(result) = client
            .send_command("Accessibility.getFullAXTree", serde_json::json!({}))
            .await
        {
            evidence.accessibility_summary = Some(summarize_ax_tree(&result));
        }

        let console_errors = evidence
            .console
            .iter()
            .filter(|line| line.starts_with("[error]"))
            .count();

        if loaded {
            ValidatorResult::passed(
                self.name(),
                format!(
                    "page loaded; {} console message(s), {console_errors} error(s)",
                    evidence.console.len()
                ),
            )
            .with_evidence(evidence)
            .timed(started)
        } else {
            ValidatorResult::failed(
                self.name(),
                Severity::Critical,
                format!("page at {url} never fired its load event"),
            )
            .with_evidence(evidence)
            .timed(started)
        }
    }
}

// ============================================================================
// Launch plumbing
// ============================================================================

fn find_chrome() -> Option<String> {
    if let Ok(path) = std::env::var("CHROME_PATH") {
        if std::path::Path::new(&path).exists() {
            return Some(path);
        }
    }
    for candidate in CHROME_CANDIDATES {
        let found = std::process::Command::new("which")
            .arg(candidate)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        if found {
            return Some(candidate.to_string());
        }
    }
    None
}

fn free_port() -> Option<u16> {
    std::net::TcpListener::bind("127.0.0.1:0")
        .ok()
        .and_then(|listener| listener.local_addr().ok())
        .map(|addr| addr.port())
}

/// Poll a local port until it accepts connections, observing cancellation.
async fn poll_port(
    port: u16,
    cap: Duration,
    cancel: &crate::cancel::CancelToken,
) -> Result<(), String> {
    let deadline = Instant::now() + cap;
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return Err("cancelled while waiting for dev server".to_string());
        }
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            _ = cancel.cancelled() => {
                return Err("cancelled while waiting for dev server".to_string());
            }
        }
    }
    Err(format!(
        "dev server did not open port {port} within {}s",
        cap.as_secs()
    ))
}

/// Resolve the first page target's WebSocket URL from the DevTools HTTP
/// endpoint, retrying while the browser boots.
async fn discover_page_target(
    debug_port: u16,
    cancel: &crate::cancel::CancelToken,
) -> Result<String, String> {
    let url = format!("http://127.0.0.1:{debug_port}/json/list");
    let client = reqwest::Client::new();
    for _ in 0..30 {
        if cancel.is_cancelled() {
            return Err("cancelled".to_string());
        }
        if let Ok(resp) = client.get(&url).send().await {
            if let Ok(targets) = resp.json::<Value>().await {
                if let Some(ws) = targets
                    .as_array()
                    .and_then(|list| {
                        list.iter().find(|t| {
                            t.get("type").and_then(Value::as_str) == Some("page")
                        })
                    })
                    .and_then(|t| t.get("webSocketDebuggerUrl"))
                    .and_then(Value::as_str)
                {
                    return Ok(ws.to_string());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    Err("browser never exposed a page target".to_string())
}

// ============================================================================
// Evidence shaping
// ============================================================================

/// One console line from a `Runtime.consoleAPICalled` event, or `None` for
/// unrelated events.
fn format_console_event(event: &CdpEvent) -> Option<String> {
    if event.method != "Runtime.consoleAPICalled" {
        return None;
    }
    let level = event
        .params
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("log");
    let text = event
        .params
        .get("args")
        .and_then(Value::as_array)
        .map(|args| {
            args.iter()
                .filter_map(|arg| {
                    arg.get("value")
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .or_else(|| {
                            arg.get("description").and_then(Value::as_str).map(str::to_string)
                        })
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    Some(format!("[{level}] {text}"))
}

fn summarize_ax_tree(result: &Value) -> String {
    let nodes = result
        .get("nodes")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let mut roles: HashMap<&str, usize> = HashMap::new();
    if let Some(list) = result.get("nodes").and_then(Value::as_array) {
        for node in list {
            if let Some(role) = node
                .get("role")
                .and_then(|r| r.get("value"))
                .and_then(Value::as_str)
            {
                *roles.entry(role).or_default() += 1;
            }
        }
    }
    let mut top: Vec<(&str, usize)> = roles.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1));
    let roles_summary: Vec<String> = top
        .into_iter()
        .take(5)
        .map(|(role, count)| format!("{role}×{count}"))
        .collect();
    format!("{nodes} accessibility nodes ({})", roles_summary.join(", "))
}

// ============================================================================
// Minimal CDP client
// ============================================================================

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// A CDP event received from the browser.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

/// Command/response-correlated DevTools WebSocket client. Responses resolve
/// by id; events fan out on an unbounded channel.
struct CdpClient {
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    writer: Arc<Mutex<WsSink>>,
    event_rx: mpsc::UnboundedReceiver<CdpEvent>,
    _reader: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    async fn connect(ws_url: &str) -> Result<Self, String> {
        let (stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| e.to_string())?;
        let (writer, mut reader) = stream.split();

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let pending_reader = Arc::clone(&pending);
        let reader_handle = tokio::spawn(async move {
            while let Some(Ok(msg)) = reader.next().await {
                let text = match msg {
                    Message::Text(t) => t.to_string(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(json) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if let Some(id) = json.get("id").and_then(Value::as_u64) {
                    if let Some(tx) = pending_reader.lock().await.remove(&id) {
                        let _ = tx.send(json);
                    }
                } else if let Some(method) = json.get("method").and_then(Value::as_str) {
                    let _ = event_tx.send(CdpEvent {
                        method: method.to_string(),
                        params: json.get("params").cloned().unwrap_or(Value::Null),
                    });
                }
            }
        });

        Ok(Self {
            next_id: Arc::new(AtomicU64::new(1)),
            pending,
            writer: Arc::new(Mutex::new(writer)),
            event_rx,
            _reader: reader_handle,
        })
    }

    async fn send_command(&self, method: &str, params: Value) -> Result<Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = serde_json::json!({ "id": id, "method": method, "params": params });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!(id, method, "CDP command");
        self.writer
            .lock()
            .await
            .send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|e| e.to_string())?;

        let response = tokio::time::timeout(Duration::from_secs(30), rx)
            .await
            .map_err(|_| format!("{method} timed out"))?
            .map_err(|_| "response channel closed".to_string())?;

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown CDP error");
            return Err(message.to_string());
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn enable_domain(&self, domain: &str) -> Result<(), String> {
        self.send_command(&format!("{domain}.enable"), serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn recv_event(&mut self) -> Option<CdpEvent> {
        self.event_rx.recv().await
    }
}
