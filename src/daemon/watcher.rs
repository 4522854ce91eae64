// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Specs directory watching.
//!
//! Two cooperating sources feed one channel: a notify-based file watcher
//! for low latency, and a periodic full rescan to recover from missed
//! events. The watcher collapses bursts in a 100 ms stabilization window
//! and coalesces by spec id — only the latest plan content matters.
//! Consumers deduplicate by (path, mtime).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::plan::PLAN_FILE;

/// Burst-collapse window.
const STABILIZATION: Duration = Duration::from_millis(100);

/// One change notification: a spec whose plan may have changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecChange {
    pub spec_id: String,
    pub spec_dir: PathBuf,
}

/// Watches the specs directory, merging filesystem events and rescans.
pub struct SpecsWatcher {
    rx: mpsc::Receiver<SpecChange>,
    /// Keeps the notify watcher alive.
    _watcher: Option<PollWatcher>,
}

impl SpecsWatcher {
    /// Start watching. Events arrive on [`SpecsWatcher::recv`]; a full
    /// rescan fires every `rescan_interval` and immediately at startup.
    pub fn start(
        specs_dir: &Path,
        rescan_interval: Duration,
        cancel: CancelToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<SpecChange>(256);

        // Source 1: notify events, batched in the stabilization window.
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<NotifyEvent>();
        let watcher = PollWatcher::new(
            move |res: Result<NotifyEvent, notify::Error>| {
                if let Ok(event) = res {
                    let _ = raw_tx.send(event);
                }
            },
            notify::Config::default().with_poll_interval(STABILIZATION),
        )
        .and_then(|mut w| {
            w.watch(specs_dir, RecursiveMode::Recursive)?;
            Ok(w)
        });

        let watcher = match watcher {
            Ok(w) => {
                info!(path = %specs_dir.display(), "watching specs directory");
                Some(w)
            }
            Err(e) => {
                warn!(error = %e, "file watcher unavailable, rescan only");
                None
            }
        };

        let specs_dir = specs_dir.to_path_buf();
        let specs_dir_rescan = specs_dir.clone();
        let tx_events = tx.clone();
        let cancel_events = cancel.clone();
        // Bridge thread: batches raw notify events, coalesces by spec id,
        // dedupes by (path, mtime).
        std::thread::spawn(move || {
            let mut seen_mtimes: HashMap<PathBuf, SystemTime> = HashMap::new();
            loop {
                if cancel_events.is_cancelled() {
                    break;
                }
                // Block briefly for the first event, then drain the burst.
                let first = match raw_rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(event) => event,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                };
                let mut batch = vec![first];
                std::thread::sleep(STABILIZATION);
                while let Ok(event) = raw_rx.try_recv() {
                    batch.push(event);
                }

                let mut changed: HashSet<SpecChange> = HashSet::new();
                for event in &batch {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        let Some(change) = spec_change_for(&specs_dir, path) else {
                            continue;
                        };
                        // (path, mtime) dedupe: polling re-reports unchanged
                        // files; skip those.
                        let plan_path = change.spec_dir.join(PLAN_FILE);
                        if let Ok(mtime) =
                            std::fs::metadata(&plan_path).and_then(|m| m.modified())
                        {
                            if seen_mtimes.get(&plan_path) == Some(&mtime) {
                                continue;
                            }
                            seen_mtimes.insert(plan_path, mtime);
                        }
                        changed.insert(change);
                    }
                }
                for change in changed {
                    debug!(spec_id = %change.spec_id, "spec change");
                    if tx_events.blocking_send(change).is_err() {
                        return;
                    }
                }
                // Bound the dedupe map.
                if seen_mtimes.len() > 2048 {
                    seen_mtimes.clear();
                }
            }
        });

        // Source 2: periodic rescan, immediate first pass. Recovers from
        // any event the notify source missed.
        let tx_rescan = tx;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(rescan_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        for change in scan_specs(&specs_dir_rescan) {
                            if tx_rescan.send(change).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Self {
            rx,
            _watcher: watcher,
        }
    }

    /// Next change, or `None` when the watcher shut down.
    pub async fn recv(&mut self) -> Option<SpecChange> {
        self.rx.recv().await
    }
}

/// Map a filesystem path to the spec it belongs to. Only plan-file writes
/// and spec-directory creations count.
fn spec_change_for(specs_dir: &Path, path: &Path) -> Option<SpecChange> {
    let relative = path.strip_prefix(specs_dir).ok()?;
    let mut components = relative.components();
    let spec_id = components.next()?.as_os_str().to_str()?.to_string();
    if spec_id.starts_with('.') {
        return None;
    }

    // Either the plan file itself changed, or the spec directory appeared.
    let is_plan = path.file_name().and_then(|n| n.to_str()) == Some(PLAN_FILE);
    let is_spec_dir = relative.components().count() == 1;
    if !is_plan && !is_spec_dir {
        return None;
    }

    Some(SpecChange {
        spec_id,
        spec_dir: specs_dir.join(relative.components().next()?.as_os_str()),
    })
}

/// Enumerate every spec directory carrying a plan file.
pub fn scan_specs(specs_dir: &Path) -> Vec<SpecChange> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(specs_dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if path.join(PLAN_FILE).exists() {
            found.push(SpecChange {
                spec_id: name.to_string(),
                spec_dir: path,
            });
        }
    }
    found.sort_by(|a, b| a.spec_id.cmp(&b.spec_id));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_spec(dir: &Path, spec_id: &str) -> PathBuf {
        let spec_dir = dir.join(spec_id);
        std::fs::create_dir_all(&spec_dir).unwrap();
        std::fs::write(spec_dir.join(PLAN_FILE), "{}").unwrap();
        spec_dir
    }

    #[test]
    fn test_scan_specs_finds_plans() {
        let dir = TempDir::new().unwrap();
        make_spec(dir.path(), "002-b");
        make_spec(dir.path(), "001-a");
        std::fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        std::fs::create_dir_all(dir.path().join("003-no-plan")).unwrap();

        let found = scan_specs(dir.path());
        let ids: Vec<&str> = found.iter().map(|c| c.spec_id.as_str()).collect();
        assert_eq!(ids, vec!["001-a", "002-b"]);
    }

    #[test]
    fn test_spec_change_mapping() {
        let specs = Path::new("/p/.auto-claude/specs");

        // Plan file write.
        let change = spec_change_for(
            specs,
            Path::new("/p/.auto-claude/specs/001-a/implementation_plan.json"),
        )
        .unwrap();
        assert_eq!(change.spec_id, "001-a");

        // Spec directory creation.
        let change =
            spec_change_for(specs, Path::new("/p/.auto-claude/specs/002-b")).unwrap();
        assert_eq!(change.spec_id, "002-b");

        // Unrelated file inside a spec dir.
        assert!(spec_change_for(
            specs,
            Path::new("/p/.auto-claude/specs/001-a/notes.txt")
        )
        .is_none());

        // Hidden entries.
        assert!(spec_change_for(
            specs,
            Path::new("/p/.auto-claude/specs/.daemon_state.json")
        )
        .is_none());

        // Outside the tree.
        assert!(spec_change_for(specs, Path::new("/elsewhere/x")).is_none());
    }

    #[tokio::test]
    async fn test_watcher_reports_new_spec() {
        let dir = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        let mut watcher =
            SpecsWatcher::start(dir.path(), Duration::from_secs(3600), cancel.clone());

        make_spec(dir.path(), "001-live");

        let change = tokio::time::timeout(Duration::from_secs(10), watcher.recv())
            .await
            .expect("watcher should report the new spec")
            .unwrap();
        assert_eq!(change.spec_id, "001-live");
        cancel.cancel();
    }
}
