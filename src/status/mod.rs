// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Status bridge: atomic snapshot file plus WebSocket push.
//!
//! The file at `{project}/.auto-claude/daemon_status.json` is the source of
//! truth; the WebSocket stream is a push hint telling observers to re-read.
//! Writes happen on every state change, on a 30-second heartbeat, and the
//! current snapshot is re-published every few seconds even when nothing
//! changed so observers recover from their own state resets.

pub mod ws;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::plan::atomic_write;
use crate::process::pid_alive;

/// Status file name inside the project-private directory.
pub const STATUS_FILE: &str = "daemon_status.json";

/// Heartbeat cap: the file is rewritten at least this often while running.
const HEARTBEAT: Duration = Duration::from_secs(30);
/// Observer-resync interval: snapshot re-publish cadence on the WebSocket.
const RESYNC: Duration = Duration::from_secs(4);

// ============================================================================
// Snapshot shape (stable wire format)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunningTaskSnapshot {
    pub spec_dir: String,
    pub pid: Option<u32>,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_subtask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTaskSnapshot {
    pub spec_id: String,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotStats {
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
}

/// The daemon's published view of the world.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSnapshot {
    pub running: bool,
    pub pid: u32,
    pub started_at: Option<String>,
    pub running_tasks: BTreeMap<String, RunningTaskSnapshot>,
    pub queued_tasks: Vec<QueuedTaskSnapshot>,
    pub stats: SnapshotStats,
    pub ws_port: Option<u16>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl DaemonSnapshot {
    /// `runningTasks` and `queuedTasks` must be disjoint.
    pub fn is_consistent(&self) -> bool {
        self.queued_tasks
            .iter()
            .all(|queued| !self.running_tasks.contains_key(&queued.spec_id))
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Publishes snapshots to the file and the WebSocket stream.
///
/// The daemon holds the only [`StatusBridge`]; observers get the file path
/// and the advertised port. One writer, many readers.
pub struct StatusBridge {
    path: PathBuf,
    dirty: Arc<Notify>,
    latest_tx: watch::Sender<DaemonSnapshot>,
    ws: Option<ws::WsServer>,
}

impl StatusBridge {
    /// Create the bridge and bind the WebSocket server on the first free
    /// port in its range. A fully-occupied range degrades to file-only.
    pub async fn start(private_dir: &Path, cancel: CancelToken) -> Self {
        Self::start_at(private_dir.join(STATUS_FILE), cancel).await
    }

    /// Same, with an explicit status-file path (`--status-file`).
    pub async fn start_at(status_path: PathBuf, cancel: CancelToken) -> Self {
        let (latest_tx, latest_rx) = watch::channel(DaemonSnapshot::default());
        let ws = ws::WsServer::bind(latest_rx, cancel.clone()).await;
        if ws.is_none() {
            warn!("no free WebSocket port, observers fall back to file polling");
        }

        let bridge = Self {
            path: status_path,
            dirty: Arc::new(Notify::new()),
            latest_tx,
            ws,
        };
        bridge.spawn_publisher(cancel);
        bridge
    }

    /// File-only bridge for tests.
    pub fn file_only(private_dir: &Path, cancel: CancelToken) -> Self {
        let (latest_tx, _) = watch::channel(DaemonSnapshot::default());
        let bridge = Self {
            path: private_dir.join(STATUS_FILE),
            dirty: Arc::new(Notify::new()),
            latest_tx,
            ws: None,
        };
        bridge.spawn_publisher(cancel);
        bridge
    }

    pub fn ws_port(&self) -> Option<u16> {
        self.ws.as_ref().map(|server| server.port())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Publish a new snapshot: stamps it, stores it, wakes the writer.
    /// The file write happens before the WebSocket hint fires.
    pub fn publish(&self, mut snapshot: DaemonSnapshot) {
        snapshot.ws_port = self.ws_port();
        snapshot.pid = std::process::id();
        snapshot.timestamp = Some(Utc::now());
        debug_assert!(snapshot.is_consistent());
        let _ = self.latest_tx.send(snapshot);
        self.dirty.notify_one();
    }

    fn spawn_publisher(&self, cancel: CancelToken) {
        let dirty = Arc::clone(&self.dirty);
        let path = self.path.clone();
        let latest = self.latest_tx.subscribe();
        let ws = self.ws.clone();
        tokio::spawn(async move {
            let mut resync = tokio::time::interval(RESYNC);
            resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = dirty.notified() => true,
                    _ = tokio::time::sleep(HEARTBEAT) => true,
                    _ = resync.tick() => false,
                };

                let snapshot = latest.borrow().clone();
                if change {
                    write_status_file(&path, &snapshot);
                    if let Some(server) = &ws {
                        server.notify_change();
                    }
                } else if let Some(server) = &ws {
                    // Unchanged re-publish so observers that reset their
                    // state converge again; consumers deduplicate.
                    server.resend_snapshot();
                }
            }
            // Final write so a clean shutdown leaves `running: false`.
            let mut snapshot = latest.borrow().clone();
            snapshot.running = false;
            snapshot.timestamp = Some(Utc::now());
            write_status_file(&path, &snapshot);
        });
    }
}

/// Atomic write with peer-merge: when another live process owns the file,
/// merge our view into theirs instead of clobbering it.
fn write_status_file(path: &Path, snapshot: &DaemonSnapshot) {
    let merged = match read_existing(path) {
        Some(existing)
            if existing.pid != snapshot.pid && existing.pid != 0 && pid_alive(existing.pid) =>
        {
            merge_snapshots(existing, snapshot.clone())
        }
        _ => snapshot.clone(),
    };

    match serde_json::to_vec_pretty(&merged) {
        Ok(bytes) => {
            if let Err(e) = atomic_write(path, &bytes) {
                warn!(error = %e, "status file write failed");
            } else {
                debug!(path = %path.display(), "status file written");
            }
        }
        Err(e) => warn!(error = %e, "status snapshot serialization failed"),
    }
}

fn read_existing(path: &Path) -> Option<DaemonSnapshot> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Union of two daemons' views: their running/queued entries are kept
/// wherever ours do not claim the same task.
fn merge_snapshots(theirs: DaemonSnapshot, ours: DaemonSnapshot) -> DaemonSnapshot {
    let mut merged = ours;
    for (spec_id, task) in theirs.running_tasks {
        merged.running_tasks.entry(spec_id).or_insert(task);
    }
    for queued in theirs.queued_tasks {
        let claimed = merged.running_tasks.contains_key(&queued.spec_id)
            || merged
                .queued_tasks
                .iter()
                .any(|q| q.spec_id == queued.spec_id);
        if !claimed {
            merged.queued_tasks.push(queued);
        }
    }
    merged.stats.running = merged.running_tasks.len();
    merged.stats.queued = merged.queued_tasks.len();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn running(spec_dir: &str) -> RunningTaskSnapshot {
        RunningTaskSnapshot {
            spec_dir: spec_dir.to_string(),
            pid: Some(4242),
            status: "in_progress".into(),
            started_at: Some(Utc::now()),
            last_update: Some(Utc::now()),
            is_running: true,
            kind: "impl".into(),
            current_subtask: None,
            phase: Some("coding".into()),
            session: None,
        }
    }

    #[test]
    fn test_snapshot_wire_names() {
        let mut snapshot = DaemonSnapshot {
            running: true,
            pid: 1,
            ws_port: Some(18800),
            ..Default::default()
        };
        snapshot
            .running_tasks
            .insert("001-a".into(), running("/p/specs/001-a"));
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"runningTasks\""));
        assert!(json.contains("\"queuedTasks\""));
        assert!(json.contains("\"wsPort\":18800"));
        assert!(json.contains("\"specDir\""));
        assert!(json.contains("\"isRunning\""));
    }

    #[test]
    fn test_consistency_check() {
        let mut snapshot = DaemonSnapshot::default();
        snapshot
            .running_tasks
            .insert("001-a".into(), running("/p/001-a"));
        snapshot.queued_tasks.push(QueuedTaskSnapshot {
            spec_id: "002-b".into(),
            priority: 2,
        });
        assert!(snapshot.is_consistent());

        snapshot.queued_tasks.push(QueuedTaskSnapshot {
            spec_id: "001-a".into(),
            priority: 1,
        });
        assert!(!snapshot.is_consistent());
    }

    #[test]
    fn test_merge_prefers_ours_for_shared_tasks() {
        let mut theirs = DaemonSnapshot {
            pid: 111,
            ..Default::default()
        };
        theirs
            .running_tasks
            .insert("001-a".into(), running("/theirs/001-a"));
        theirs.queued_tasks.push(QueuedTaskSnapshot {
            spec_id: "003-c".into(),
            priority: 2,
        });

        let mut ours = DaemonSnapshot {
            pid: 222,
            ..Default::default()
        };
        ours.running_tasks
            .insert("001-a".into(), running("/ours/001-a"));
        ours.queued_tasks.push(QueuedTaskSnapshot {
            spec_id: "002-b".into(),
            priority: 1,
        });

        let merged = merge_snapshots(theirs, ours);
        assert_eq!(merged.running_tasks["001-a"].spec_dir, "/ours/001-a");
        assert_eq!(merged.queued_tasks.len(), 2);
        assert_eq!(merged.stats.running, 1);
        assert!(merged.is_consistent());
    }

    #[tokio::test]
    async fn test_publish_writes_file_atomically() {
        let dir = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        let bridge = StatusBridge::file_only(dir.path(), cancel.clone());

        let mut snapshot = DaemonSnapshot {
            running: true,
            ..Default::default()
        };
        snapshot
            .running_tasks
            .insert("001-a".into(), running("/p/001-a"));
        bridge.publish(snapshot);

        // The writer task runs asynchronously; wait for the file.
        let path = dir.path().join(STATUS_FILE);
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let written: DaemonSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written.running);
        assert_eq!(written.pid, std::process::id());
        assert!(written.timestamp.is_some());
        assert_eq!(written.running_tasks.len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stale_peer_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STATUS_FILE);

        // A dead peer's file (pid that cannot exist).
        let mut stale = DaemonSnapshot {
            running: true,
            pid: 3_999_998,
            ..Default::default()
        };
        stale
            .running_tasks
            .insert("900-zombie".into(), running("/dead/900-zombie"));
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let ours = DaemonSnapshot {
            running: true,
            pid: std::process::id(),
            ..Default::default()
        };
        write_status_file(&path, &ours);

        let written: DaemonSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        // Dead peer's entries are gone.
        assert!(written.running_tasks.is_empty());
    }
}
