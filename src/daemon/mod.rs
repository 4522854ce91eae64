// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task daemon: the supervisor.
//!
//! Continuously converts eligible tasks into running supervised processes,
//! respecting concurrency, dependencies, priority, and recovery caps. One
//! daemon per project, enforced by a liveness-checked lock file.
//!
//! Per-task state machine, as observed here:
//!
//! ```text
//!   queued ──admit──► running ──complete──► terminal(done|human_review)
//!      ▲               │
//!      │               ├─stuck──► terminated ──under_cap──► queued
//!      │               │                      └─over_cap──► error
//!      │               └─crash──► terminated (same branches)
//!      └─re-queue from QA/verify loop
//! ```

pub mod state;
pub mod watcher;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::AsyncBufReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::commands::{CommandBus, DaemonCommand};
use crate::error::ProjectStateError;
use crate::events::EventLog;
use crate::factory::SpecFactory;
use crate::plan::{Plan, PlanStore};
use crate::process::{kill_tree, pid_alive, supervised_command};
use crate::status::{
    DaemonSnapshot, QueuedTaskSnapshot, RunningTaskSnapshot, SnapshotStats, StatusBridge,
};
use crate::types::{ExecutionPhase, TaskKind, TaskPriority, TaskStatus, XstateState};
use crate::worktree::WorktreeManager;
use crate::PRIVATE_DIR;

use state::StateManager;
use watcher::{scan_specs, SpecChange, SpecsWatcher};

/// Lock file name inside the private directory.
pub const LOCK_FILE: &str = "daemon.pid";

/// Supervisor tick driving admission and exit collection.
const TICK: Duration = Duration::from_secs(1);
/// Stuck-checker cadence.
const STUCK_CHECK: Duration = Duration::from_secs(30);
/// Back-off after a failed worktree acquisition.
const WORKTREE_BACKOFF: Duration = Duration::from_secs(60);
/// Consecutive worktree failures before the task errors out.
const WORKTREE_FAILURE_CAP: u32 = 3;
/// verify → error_check → verify cycles per parent before giving up.
const MAX_VERIFY_ATTEMPTS: u32 = 3;

// ============================================================================
// Configuration
// ============================================================================

/// Which signals count as proof of life for a running task.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub stdout_lines: bool,
    pub event_appends: bool,
    pub plan_mtime: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            stdout_lines: true,
            event_appends: true,
            plan_mtime: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub project_dir: PathBuf,
    pub max_concurrent: usize,
    pub use_worktrees: bool,
    pub status_file: Option<PathBuf>,
    pub stuck_timeout: Duration,
    pub rescan_interval: Duration,
    pub max_recovery: u32,
    pub max_child_depth: u32,
    /// Grace between TERM and KILL when stopping a task.
    pub grace: Duration,
    pub heartbeat: HeartbeatConfig,
    pub base_branch: String,
}

impl DaemonConfig {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            max_concurrent: 1,
            use_worktrees: false,
            status_file: None,
            stuck_timeout: Duration::from_secs(600),
            rescan_interval: Duration::from_secs(60),
            max_recovery: 3,
            max_child_depth: 2,
            grace: Duration::from_secs(30),
            heartbeat: HeartbeatConfig::default(),
            base_branch: "main".to_string(),
        }
    }
}

// ============================================================================
// Lock file
// ============================================================================

/// `O_CREAT|O_EXCL` lock with pid + timestamp contents. A stale lock (dead
/// pid, probed non-destructively) is replaced; a live peer is a hard error.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: PathBuf) -> Result<Self, ProjectStateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        for attempt in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let content = format!("{} {}", std::process::id(), Utc::now().to_rfc3339());
                    file.write_all(content.as_bytes())?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|text| {
                            text.split_whitespace().next().and_then(|p| p.parse::<u32>().ok())
                        });
                    match holder {
                        Some(pid) if pid_alive(pid) => {
                            return Err(ProjectStateError::AlreadyRunning { pid });
                        }
                        _ => {
                            info!(path = %path.display(), "replacing stale lock file");
                            std::fs::remove_file(&path)?;
                            if attempt == 1 {
                                return Err(ProjectStateError::LockFile(
                                    "lock file reappeared after stale removal".to_string(),
                                ));
                            }
                        }
                    }
                }
                Err(e) => return Err(ProjectStateError::LockFile(e.to_string())),
            }
        }
        Err(ProjectStateError::LockFile("unreachable".to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ============================================================================
// Queue and running entries
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub spec_id: String,
    pub spec_dir: PathBuf,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub depends_on: Vec<String>,
    pub parent_task: Option<String>,
    pub ctime: DateTime<Utc>,
}

impl QueuedTask {
    fn from_plan(change: &SpecChange, plan: &Plan) -> Self {
        let ctime = plan.created_at.unwrap_or_else(|| {
            std::fs::metadata(&change.spec_dir)
                .and_then(|m| m.created())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now())
        });
        Self {
            spec_id: change.spec_id.clone(),
            spec_dir: change.spec_dir.clone(),
            kind: plan.kind,
            priority: plan.priority,
            depends_on: plan.depends_on.clone(),
            parent_task: plan.parent_task.clone(),
            ctime,
        }
    }
}

/// Admission order: priority ascending, then creation time, then spec id.
pub fn admission_order(a: &QueuedTask, b: &QueuedTask) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.ctime.cmp(&b.ctime))
        .then(a.spec_id.cmp(&b.spec_id))
}

struct RunningTask {
    spec_id: String,
    spec_dir: PathBuf,
    kind: TaskKind,
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
    status: String,
    /// Updated by the stdout reader and by plan-change events.
    last_update: Arc<std::sync::Mutex<Instant>>,
    /// Whether any heartbeat was ever observed.
    produced_output: Arc<AtomicBool>,
    recovering: bool,
}

// ============================================================================
// Daemon
// ============================================================================

pub struct TaskDaemon {
    config: DaemonConfig,
    private_dir: PathBuf,
    specs_dir: PathBuf,
    state: StateManager,
    running: HashMap<String, RunningTask>,
    queue: Vec<QueuedTask>,
    paused: bool,
    cancel: CancelToken,
    worktrees: Option<Arc<WorktreeManager>>,
    /// Consecutive worktree-acquisition failures and next eligible time.
    worktree_failures: HashMap<String, (u32, Instant)>,
    /// Tasks that crashed before their first heartbeat; the first such
    /// crash re-queues without consuming a recovery slot.
    early_crashes: std::collections::HashSet<String>,
    bus_rx: mpsc::Receiver<DaemonCommand>,
    bus: CommandBus,
    _lock: LockFile,
}

impl TaskDaemon {
    /// Construct the daemon, acquiring the project lock.
    ///
    /// Fails with [`ProjectStateError::ProjectNotInitialized`] when the
    /// specs directory is absent and [`ProjectStateError::AlreadyRunning`]
    /// when a live peer holds the lock.
    pub fn new(config: DaemonConfig) -> Result<Self, ProjectStateError> {
        let private_dir = config.project_dir.join(PRIVATE_DIR);
        let specs_dir = private_dir.join("specs");
        if !specs_dir.exists() {
            return Err(ProjectStateError::ProjectNotInitialized(
                specs_dir.display().to_string(),
            ));
        }

        let lock = LockFile::acquire(private_dir.join(LOCK_FILE))?;
        let state = StateManager::new(&specs_dir);
        let worktrees = config.use_worktrees.then(|| {
            Arc::new(WorktreeManager::new(
                &config.project_dir,
                config.base_branch.clone(),
            ))
        });
        let (bus, bus_rx) = CommandBus::new();

        Ok(Self {
            config,
            private_dir,
            specs_dir,
            state,
            running: HashMap::new(),
            queue: Vec::new(),
            paused: false,
            cancel: CancelToken::new(),
            worktrees,
            worktree_failures: HashMap::new(),
            early_crashes: std::collections::HashSet::new(),
            bus_rx,
            bus: bus.clone(),
            _lock: lock,
        })
    }

    /// Control-plane handle for CLI and tests.
    pub fn command_bus(&self) -> CommandBus {
        self.bus.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run until stopped. Blocking in the async sense.
    pub async fn run(&mut self) -> Result<(), ProjectStateError> {
        info!(project = %self.config.project_dir.display(), "daemon starting");

        self.state.load();
        self.state.set_started_at();

        // Repair dependency references left by interrupted factory runs.
        let repaired = SpecFactory::new(&self.config.project_dir, self.config.max_child_depth)
            .repair_all_dependencies();
        if repaired > 0 {
            info!(repaired, "dependency references repaired");
        }

        let status_path = self
            .config
            .status_file
            .clone()
            .unwrap_or_else(|| self.private_dir.join(crate::status::STATUS_FILE));
        let bridge = StatusBridge::start_at(status_path, self.cancel.clone()).await;

        // Initial scan: queue eligible tasks, discover externally-completed
        // ones so dependency checks work after a restart.
        let mut discovered_completed = 0;
        for change in scan_specs(&self.specs_dir) {
            let Ok(plan) = PlanStore::new(&change.spec_dir).load() else {
                self.quarantine(&change, "plan unreadable at scan");
                continue;
            };
            if plan.status.is_completed() {
                if !self.state.is_completed(&change.spec_id) {
                    self.state.mark_completed(&change.spec_id);
                    discovered_completed += 1;
                }
            } else if self.should_queue(&change.spec_id, &plan) {
                self.enqueue(QueuedTask::from_plan(&change, &plan));
            }
        }
        if discovered_completed > 0 {
            info!(discovered_completed, "externally-completed tasks discovered");
        }
        info!(queued = self.queue.len(), "initial scan complete");

        let mut watcher = SpecsWatcher::start(
            &self.specs_dir,
            self.config.rescan_interval,
            self.cancel.clone(),
        );

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stuck_tick = tokio::time::interval(STUCK_CHECK);
        stuck_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        bridge.publish(self.snapshot());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                change = watcher.recv() => {
                    match change {
                        Some(change) => {
                            if self.on_spec_change(&change) {
                                self.admit(&bridge).await;
                                // Queue changes reach observers even when
                                // nothing was admitted.
                                bridge.publish(self.snapshot());
                            }
                        }
                        None => break,
                    }
                }
                command = self.bus_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command, &bridge).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.collect_exits(&bridge).await;
                    self.admit(&bridge).await;
                }
                _ = stuck_tick.tick() => {
                    self.check_stuck(&bridge).await;
                }
            }
        }

        self.shutdown(&bridge).await;
        Ok(())
    }

    /// Returns `true` when the loop should stop.
    async fn handle_command(&mut self, command: DaemonCommand, bridge: &StatusBridge) -> bool {
        match command {
            DaemonCommand::Pause => {
                info!("admission paused");
                self.paused = true;
            }
            DaemonCommand::Resume => {
                info!("admission resumed");
                self.paused = false;
                self.admit(bridge).await;
            }
            DaemonCommand::Stop => return true,
            DaemonCommand::Requeue { spec_id } => {
                self.state.reset_recovery(&spec_id);
                let spec_dir = self.specs_dir.join(&spec_id);
                let store = PlanStore::new(&spec_dir);
                let _ = store.update_status(
                    TaskStatus::Queue,
                    XstateState::Backlog,
                    ExecutionPhase::Backlog,
                );
                if let Ok(plan) = store.load() {
                    let change = SpecChange {
                        spec_id: spec_id.clone(),
                        spec_dir,
                    };
                    self.enqueue(QueuedTask::from_plan(&change, &plan));
                    bridge.publish(self.snapshot());
                }
            }
            DaemonCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Returns `true` when the change may unlock admission.
    fn on_spec_change(&mut self, change: &SpecChange) -> bool {
        let store = PlanStore::new(&change.spec_dir);
        let plan = match store.load() {
            Ok(plan) => plan,
            Err(e) => {
                // Quarantine, never overwrite a file we cannot parse.
                debug!(spec_id = %change.spec_id, error = %e, "plan unreadable");
                return false;
            }
        };

        if let Some(task) = self.running.get(&change.spec_id) {
            // A plan mutation is a heartbeat.
            if self.config.heartbeat.plan_mtime {
                *task.last_update.lock().unwrap() = Instant::now();
                task.produced_output.store(true, Ordering::Relaxed);
            }
            let status = plan.status.to_string();
            self.running.get_mut(&change.spec_id).unwrap().status = status;
            return false;
        }

        if plan.status.is_completed() {
            let newly = !self.state.is_completed(&change.spec_id);
            if newly {
                self.state.mark_completed(&change.spec_id);
            }
            return newly;
        }

        if self.queue.iter().any(|task| task.spec_id == change.spec_id) {
            return false;
        }
        if self.should_queue(&change.spec_id, &plan) {
            self.enqueue(QueuedTask::from_plan(change, &plan));
            return true;
        }
        false
    }

    fn should_queue(&self, spec_id: &str, plan: &Plan) -> bool {
        plan.status.is_queueable()
            && self.state.recovery_count(spec_id) < self.config.max_recovery
    }

    fn enqueue(&mut self, task: QueuedTask) {
        info!(spec_id = %task.spec_id, priority = task.priority.as_u8(), kind = %task.kind, "queued");
        self.queue.push(task);
        self.queue.sort_by(admission_order);
    }

    fn quarantine(&mut self, change: &SpecChange, reason: &str) {
        warn!(spec_id = %change.spec_id, reason, "task quarantined");
        if let Ok(mut events) = EventLog::open(&change.spec_dir) {
            let _ = events.append_task_event(
                "QUARANTINED",
                serde_json::json!({ "reason": reason }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// The next task eligible to start, honoring dependencies, recovery
    /// caps, depth limits, and worktree backoff. Stale entries (completed
    /// externally) are swept on the way.
    fn next_admissible(&mut self) -> Option<QueuedTask> {
        let now = Instant::now();
        let mut stale: Vec<usize> = Vec::new();
        let mut pick: Option<usize> = None;

        for (i, task) in self.queue.iter().enumerate() {
            // Re-read the plan to spot external transitions.
            match PlanStore::new(&task.spec_dir).load() {
                Ok(plan) => {
                    if plan.status.is_completed() {
                        stale.push(i);
                        continue;
                    }
                    if plan.status.no_start() {
                        continue;
                    }
                }
                Err(_) => {
                    stale.push(i);
                    continue;
                }
            }

            if self.state.recovery_count(&task.spec_id) >= self.config.max_recovery {
                continue;
            }
            if !self.state.dependencies_met(&task.depends_on) {
                continue;
            }
            // Design decomposition depth cap.
            if task.kind.decomposes() {
                let depth = SpecFactory::new(&self.config.project_dir, self.config.max_child_depth)
                    .depth_of(&task.spec_id);
                if depth >= self.config.max_child_depth {
                    continue;
                }
            }
            // Worktree back-off window.
            if let Some((_, next_try)) = self.worktree_failures.get(&task.spec_id) {
                if *next_try > now {
                    continue;
                }
            }
            pick = Some(i);
            break;
        }

        for i in stale.iter().rev() {
            let removed = self.queue.remove(*i);
            if !self.state.is_completed(&removed.spec_id) {
                if PlanStore::new(&removed.spec_dir)
                    .load()
                    .map(|p| p.status.is_completed())
                    .unwrap_or(false)
                {
                    self.state.mark_completed(&removed.spec_id);
                }
            }
            info!(spec_id = %removed.spec_id, "stale queue entry removed");
            if let Some(p) = pick.as_mut() {
                if *i < *p {
                    *p -= 1;
                }
            }
        }

        pick.map(|i| self.queue.remove(i))
    }

    async fn admit(&mut self, bridge: &StatusBridge) {
        if self.paused {
            return;
        }
        let mut changed = false;
        while self.running.len() < self.config.max_concurrent {
            let Some(task) = self.next_admissible() else {
                break;
            };
            changed = true;
            if let Err(e) = self.start_task(task).await {
                warn!(error = %e, "task start failed");
            }
        }
        if changed {
            bridge.publish(self.snapshot());
        }
    }

    async fn start_task(&mut self, task: QueuedTask) -> Result<(), ProjectStateError> {
        let spec_id = task.spec_id.clone();
        let store = PlanStore::new(&task.spec_dir);

        // Admission requires the full spec-pipeline file set.
        for required in ["spec.md", "requirements.json", "context.json"] {
            if !task.spec_dir.join(required).exists() {
                self.quarantine(
                    &SpecChange {
                        spec_id: spec_id.clone(),
                        spec_dir: task.spec_dir.clone(),
                    },
                    &format!("missing {required}"),
                );
                return Ok(());
            }
        }

        // Worktree acquisition with bounded consecutive failures.
        let mut working_dir = self.config.project_dir.clone();
        if let Some(worktrees) = self.worktrees.clone() {
            match worktrees.acquire(&spec_id).await {
                Ok(handle) => {
                    self.worktree_failures.remove(&spec_id);
                    working_dir = handle.path.clone();
                    let _ = store.update(|plan| plan.worktree_path = Some(handle.path.clone()));
                }
                Err(e) => {
                    let entry = self
                        .worktree_failures
                        .entry(spec_id.clone())
                        .or_insert((0, Instant::now()));
                    entry.0 += 1;
                    entry.1 = Instant::now() + WORKTREE_BACKOFF;
                    warn!(spec_id = %spec_id, attempt = entry.0, error = %e, "worktree acquisition failed");
                    if entry.0 >= WORKTREE_FAILURE_CAP {
                        let _ = store.update(|plan| {
                            plan.push_error("WorktreeError", &e.to_string());
                            plan.set_status(
                                TaskStatus::Error,
                                XstateState::Error,
                                ExecutionPhase::Failed,
                            );
                        });
                        self.state.record_error(&spec_id, &e.to_string());
                        self.worktree_failures.remove(&spec_id);
                    } else {
                        // Back to the queue; retried after the back-off.
                        self.enqueue(task);
                    }
                    return Ok(());
                }
            }
        }

        store
            .update_status(
                TaskStatus::InProgress,
                XstateState::Planning,
                ExecutionPhase::Planning,
            )
            .map_err(|e| ProjectStateError::LockFile(e.to_string()))
            .ok();

        // The child runs one Pipeline Engine instance against this spec.
        let exe = std::env::current_exe()?;
        let exe_str = exe.to_string_lossy().to_string();
        let project = self.config.project_dir.to_string_lossy().to_string();
        let spec_dir_str = task.spec_dir.to_string_lossy().to_string();
        let working_str = working_dir.to_string_lossy().to_string();
        let depth = self.config.max_child_depth.to_string();
        let mut args = vec![
            "run-task",
            "--project-dir",
            project.as_str(),
            "--spec-dir",
            spec_dir_str.as_str(),
            "--working-dir",
            working_str.as_str(),
            "--max-child-depth",
            depth.as_str(),
        ];
        if self.worktrees.is_some() {
            args.push("--use-worktrees");
        }

        let mut child = supervised_command(&exe_str, &args, &self.config.project_dir)
            .spawn()
            .map_err(ProjectStateError::Io)?;
        let pid = child.id().unwrap_or(0);
        info!(spec_id = %spec_id, pid, "task started");

        let last_update = Arc::new(std::sync::Mutex::new(Instant::now()));
        let produced_output = Arc::new(AtomicBool::new(false));

        // stdout reader: every line is a heartbeat.
        if let Some(stdout) = child.stdout.take() {
            let last_update = Arc::clone(&last_update);
            let produced_output = Arc::clone(&produced_output);
            let stdout_heartbeat = self.config.heartbeat.stdout_lines;
            let reader_spec = spec_id.clone();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if stdout_heartbeat {
                        *last_update.lock().unwrap() = Instant::now();
                        produced_output.store(true, Ordering::Relaxed);
                    }
                    debug!(spec_id = %reader_spec, line = %truncate(&line, 200), "child");
                }
            });
        }
        // Drain stderr so the child never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let reader_spec = spec_id.clone();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(spec_id = %reader_spec, line = %truncate(&line, 200), "child stderr");
                }
            });
        }

        self.running.insert(
            spec_id.clone(),
            RunningTask {
                spec_id,
                spec_dir: task.spec_dir,
                kind: task.kind,
                child,
                pid,
                started_at: Utc::now(),
                status: TaskStatus::InProgress.to_string(),
                last_update,
                produced_output,
                recovering: false,
            },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Exit handling
    // ------------------------------------------------------------------

    async fn collect_exits(&mut self, bridge: &StatusBridge) {
        let exited: Vec<(String, bool)> = self
            .running
            .iter_mut()
            .filter(|(_, task)| !task.recovering)
            .filter_map(|(spec_id, task)| {
                task.child
                    .try_wait()
                    .ok()
                    .flatten()
                    .map(|status| (spec_id.clone(), status.success()))
            })
            .collect();

        for (spec_id, success) in exited {
            self.handle_exit(&spec_id, success).await;
            bridge.publish(self.snapshot());
        }
    }

    async fn handle_exit(&mut self, spec_id: &str, success: bool) {
        let Some(task) = self.running.remove(spec_id) else {
            return;
        };
        info!(spec_id, success, "task exited");

        let store = PlanStore::new(&task.spec_dir);
        let plan = store.load().ok();
        let current_status = plan.as_ref().map(|p| p.status.clone());

        if success {
            self.state.reset_recovery(spec_id);
            self.state.mark_completed(spec_id);
            // The pipeline writes its own terminal states; only fill in
            // when it left the plan mid-flight.
            let terminal = current_status
                .as_ref()
                .map(|s| s.is_completed() || matches!(s, TaskStatus::HumanReview))
                .unwrap_or(false);
            if !terminal {
                let _ = store.update_status(
                    TaskStatus::HumanReview,
                    XstateState::HumanReview,
                    ExecutionPhase::Complete,
                );
            }
        } else {
            // A design task may exit non-zero after its children landed.
            let already_complete = current_status
                .as_ref()
                .map(TaskStatus::is_completed)
                .unwrap_or(false);
            if already_complete {
                self.state.mark_completed(spec_id);
            } else if !task.produced_output.load(Ordering::Relaxed)
                && self.early_crashes.insert(spec_id.to_string())
            {
                // Crash before the first heartbeat: immediate re-queue,
                // no recovery slot consumed.
                info!(spec_id, "crash before first heartbeat, immediate retry");
                let _ = store.update_status(
                    TaskStatus::Queue,
                    XstateState::Backlog,
                    ExecutionPhase::Backlog,
                );
                if let Ok(plan) = store.load() {
                    let change = SpecChange {
                        spec_id: spec_id.to_string(),
                        spec_dir: task.spec_dir.clone(),
                    };
                    self.enqueue(QueuedTask::from_plan(&change, &plan));
                }
                return;
            } else {
                self.state.record_error(spec_id, "child exited non-zero");
                let _ = store.update(|plan| {
                    plan.push_error("TaskExit", "child process exited non-zero");
                    plan.set_status(TaskStatus::Error, XstateState::Error, ExecutionPhase::Failed);
                });
            }
        }

        if let Some(parent) = plan.as_ref().and_then(|p| p.parent_task.clone()) {
            self.state.add_child(&parent, spec_id);
        }

        if success {
            self.maybe_auto_verify(spec_id, &task.spec_dir, task.kind);

            // error_check success re-queues a fresh verify of its parent.
            if task.kind == TaskKind::ErrorCheck {
                if let Some(parent) = plan.as_ref().and_then(|p| p.parent_task.clone()) {
                    let parent_dir = self.specs_dir.join(&parent);
                    if parent_dir.exists() {
                        self.synthesize_verify(&parent, &parent_dir);
                    }
                }
            }
        }
    }

    /// Auto-verify: a successful implementation-kind task whose plan
    /// reached `human_review` with an approved signoff gets a `verify`
    /// child, capped at [`MAX_VERIFY_ATTEMPTS`] per parent.
    fn maybe_auto_verify(&mut self, spec_id: &str, spec_dir: &Path, kind: TaskKind) {
        if !kind.triggers_verify() {
            return;
        }
        let Ok(plan) = PlanStore::new(spec_dir).load() else {
            return;
        };
        let approved = plan.xstate_state == XstateState::HumanReview
            && plan
                .qa_signoff
                .as_ref()
                .map(|s| s.status == crate::plan::QaStatus::Approved)
                .unwrap_or(false);
        if approved {
            self.synthesize_verify(spec_id, spec_dir);
        }
    }

    fn synthesize_verify(&mut self, parent_id: &str, parent_dir: &Path) {
        // Count prior verify attempts for this parent.
        let attempts = (1..=MAX_VERIFY_ATTEMPTS)
            .map(|n| {
                if n == 1 {
                    format!("verify-{parent_id}")
                } else {
                    format!("verify-{parent_id}-{n}")
                }
            })
            .filter(|id| self.specs_dir.join(id).exists())
            .count() as u32;

        if attempts >= MAX_VERIFY_ATTEMPTS {
            warn!(parent = parent_id, "verify attempt cap reached");
            return;
        }
        let attempt = attempts + 1;
        let verify_id = if attempt == 1 {
            format!("verify-{parent_id}")
        } else {
            format!("verify-{parent_id}-{attempt}")
        };
        let dir = self.specs_dir.join(&verify_id);
        if dir.exists() {
            return;
        }
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(error = %e, "verify spec dir creation failed");
            return;
        }

        let original = std::fs::read_to_string(parent_dir.join("spec.md")).unwrap_or_default();
        let spec_md = format!(
            "# Verify: {parent_id}\n\nVerify the implementation of `{parent_id}` by running \
             tests, checking for build errors, and performing runtime validation.\n\n\
             ## Original Spec\n\n{original}\n"
        );
        let _ = std::fs::write(dir.join("spec.md"), spec_md);
        let _ = std::fs::write(
            dir.join("requirements.json"),
            serde_json::json!({ "task": format!("Verify {parent_id}"), "parentSpec": parent_id })
                .to_string(),
        );
        let _ = std::fs::write(
            dir.join("context.json"),
            serde_json::json!({ "parentSpec": parent_id }).to_string(),
        );

        let mut plan = Plan::queued(TaskKind::Verify, TaskPriority::High);
        plan.depends_on = vec![parent_id.to_string()];
        plan.parent_task = Some(parent_id.to_string());
        if let Err(e) = PlanStore::new(&dir).save(&plan) {
            warn!(error = %e, "verify plan write failed");
            return;
        }
        self.state.add_child(parent_id, &verify_id);
        info!(verify = %verify_id, parent = parent_id, "verify task synthesized");
    }

    // ------------------------------------------------------------------
    // Stuck detection & recovery
    // ------------------------------------------------------------------

    async fn check_stuck(&mut self, bridge: &StatusBridge) {
        let timeout = self.config.stuck_timeout;
        let stuck: Vec<String> = self
            .running
            .iter()
            .filter(|(_, task)| !task.recovering)
            .filter(|(_, task)| self.heartbeat_age(task) > timeout)
            .map(|(spec_id, _)| spec_id.clone())
            .collect();

        for spec_id in stuck {
            self.recover_task(&spec_id).await;
            bridge.publish(self.snapshot());
        }
    }

    /// Time since the freshest enabled heartbeat source.
    fn heartbeat_age(&self, task: &RunningTask) -> Duration {
        let mut age = task.last_update.lock().unwrap().elapsed();

        if self.config.heartbeat.event_appends {
            if let Some(mtime) = crate::events::last_append_time(&task.spec_dir) {
                if let Ok(event_age) = mtime.elapsed() {
                    age = age.min(event_age);
                }
            }
        }
        if self.config.heartbeat.plan_mtime {
            if let Ok(mtime) = std::fs::metadata(task.spec_dir.join(crate::plan::PLAN_FILE))
                .and_then(|m| m.modified())
            {
                if let Ok(plan_age) = mtime.elapsed() {
                    age = age.min(plan_age);
                }
            }
        }
        age
    }

    async fn recover_task(&mut self, spec_id: &str) {
        let Some(task) = self.running.get_mut(spec_id) else {
            return;
        };
        task.recovering = true;
        let spec_dir = task.spec_dir.clone();
        let grace = self.config.grace;

        let count = self.state.increment_recovery(spec_id);
        warn!(spec_id, attempt = count, "stuck task, recovering");

        if let Ok(mut events) = EventLog::open(&spec_dir) {
            let _ = events.append_task_event(
                "STUCK_RECOVERY",
                serde_json::json!({ "attempt": count }),
            );
        }

        // Kill the whole tree: TERM, grace, KILL.
        if let Some(task) = self.running.get_mut(spec_id) {
            kill_tree(&mut task.child, grace).await;
        }
        self.running.remove(spec_id);

        // Same threshold the admission guard uses: a task at the cap is
        // terminated, never re-queued into a state nothing will admit.
        let store = PlanStore::new(&spec_dir);
        if count >= self.config.max_recovery {
            error!(spec_id, count, "recovery cap reached, task terminated");
            let _ = store.update(|plan| {
                plan.push_error("StuckTask", "max recovery attempts exceeded");
                plan.set_status(TaskStatus::Error, XstateState::Error, ExecutionPhase::Failed);
            });
            return;
        }

        // Safer default: a re-queued task gets a fresh worktree.
        if let Some(worktrees) = &self.worktrees {
            if let Err(e) = worktrees.destroy(spec_id).await {
                warn!(spec_id, error = %e, "worktree teardown during recovery failed");
            }
        }

        let _ = store.update_status(
            TaskStatus::Queue,
            XstateState::Backlog,
            ExecutionPhase::Backlog,
        );
        if let Ok(plan) = store.load() {
            let change = SpecChange {
                spec_id: spec_id.to_string(),
                spec_dir,
            };
            self.enqueue(QueuedTask::from_plan(&change, &plan));
        }
    }

    // ------------------------------------------------------------------
    // Snapshot & shutdown
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> DaemonSnapshot {
        let mut running_tasks = std::collections::BTreeMap::new();
        for (spec_id, task) in &self.running {
            running_tasks.insert(
                spec_id.clone(),
                RunningTaskSnapshot {
                    spec_dir: task.spec_dir.display().to_string(),
                    pid: Some(task.pid),
                    status: task.status.clone(),
                    started_at: Some(task.started_at),
                    last_update: Some(
                        Utc::now()
                            - chrono::Duration::from_std(
                                task.last_update.lock().unwrap().elapsed(),
                            )
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                    ),
                    is_running: true,
                    kind: task.kind.to_string(),
                    current_subtask: None,
                    phase: None,
                    session: None,
                },
            );
        }
        let queued_tasks: Vec<QueuedTaskSnapshot> = self
            .queue
            .iter()
            .filter(|task| !running_tasks.contains_key(&task.spec_id))
            .map(|task| QueuedTaskSnapshot {
                spec_id: task.spec_id.clone(),
                priority: task.priority.as_u8(),
            })
            .collect();

        DaemonSnapshot {
            running: !self.cancel.is_cancelled(),
            pid: std::process::id(),
            started_at: self.state.started_at().map(str::to_string),
            stats: SnapshotStats {
                running: running_tasks.len(),
                queued: queued_tasks.len(),
                completed: self.state.completed_count(),
            },
            running_tasks,
            queued_tasks,
            ws_port: None,
            timestamp: None,
        }
    }

    async fn shutdown(&mut self, bridge: &StatusBridge) {
        info!("daemon stopping, draining running tasks");
        self.cancel.cancel();

        let grace = self.config.grace;
        for (spec_id, task) in self.running.iter_mut() {
            info!(spec_id = %spec_id, "terminating task");
            kill_tree(&mut task.child, grace).await;
        }
        self.running.clear();
        self.state.save();
        bridge.publish(self.snapshot());
        // Give the publisher a beat to flush the final snapshot.
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!("daemon stopped");
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use tempfile::TempDir;

    fn project(dir: &TempDir) -> PathBuf {
        let project = dir.path().to_path_buf();
        std::fs::create_dir_all(project.join(PRIVATE_DIR).join("specs")).unwrap();
        project
    }

    fn make_spec(project: &Path, spec_id: &str, plan: &Plan) -> PathBuf {
        let dir = project.join(PRIVATE_DIR).join("specs").join(spec_id);
        std::fs::create_dir_all(&dir).unwrap();
        for file in ["spec.md", "requirements.json", "context.json"] {
            std::fs::write(dir.join(file), "{}").unwrap();
        }
        PlanStore::new(&dir).save(plan).unwrap();
        dir
    }

    fn queued(spec_id: &str, dir: &Path, priority: TaskPriority, ctime_s: i64) -> QueuedTask {
        QueuedTask {
            spec_id: spec_id.to_string(),
            spec_dir: dir.to_path_buf(),
            kind: TaskKind::Impl,
            priority,
            depends_on: Vec::new(),
            parent_task: None,
            ctime: DateTime::<Utc>::from_timestamp(ctime_s, 0).unwrap(),
        }
    }

    /// Register a live (sleeping) child as a running task so the recovery
    /// path has a real process tree to terminate.
    fn insert_running(daemon: &mut TaskDaemon, spec_id: &str, spec_dir: &Path) {
        let child = supervised_command("sleep", &["30"], spec_dir)
            .spawn()
            .expect("spawn sleep child");
        let pid = child.id().unwrap_or(0);
        daemon.running.insert(
            spec_id.to_string(),
            RunningTask {
                spec_id: spec_id.to_string(),
                spec_dir: spec_dir.to_path_buf(),
                kind: TaskKind::Impl,
                child,
                pid,
                started_at: Utc::now(),
                status: TaskStatus::InProgress.to_string(),
                last_update: Arc::new(std::sync::Mutex::new(Instant::now())),
                produced_output: Arc::new(AtomicBool::new(true)),
                recovering: false,
            },
        );
    }

    #[test]
    fn test_project_not_initialized() {
        let dir = TempDir::new().unwrap();
        let err = match TaskDaemon::new(DaemonConfig::new(dir.path())) {
            Ok(_) => panic!("expected TaskDaemon::new to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, ProjectStateError::ProjectNotInitialized(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_lock_file_blocks_second_daemon() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);

        let first = TaskDaemon::new(DaemonConfig::new(&project)).unwrap();
        let err = match TaskDaemon::new(DaemonConfig::new(&project)) {
            Ok(_) => panic!("expected TaskDaemon::new to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, ProjectStateError::AlreadyRunning { .. }));
        assert_eq!(err.exit_code(), 2);

        drop(first);
        // Lock released on drop; a new daemon can start.
        assert!(TaskDaemon::new(DaemonConfig::new(&project)).is_ok());
    }

    #[test]
    fn test_stale_lock_replaced() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let lock_path = project.join(PRIVATE_DIR).join(LOCK_FILE);
        std::fs::write(&lock_path, "3999997 2026-01-01T00:00:00Z").unwrap();

        assert!(TaskDaemon::new(DaemonConfig::new(&project)).is_ok());
    }

    #[test]
    fn test_admission_order_tie_breaks() {
        let dir = TempDir::new().unwrap();
        let p = dir.path();

        let mut tasks = vec![
            queued("003-c", p, TaskPriority::Critical, 300),
            queued("002-b", p, TaskPriority::High, 200),
            queued("001-a", p, TaskPriority::High, 200),
            queued("004-d", p, TaskPriority::High, 100),
        ];
        tasks.sort_by(admission_order);
        let ids: Vec<&str> = tasks.iter().map(|t| t.spec_id.as_str()).collect();
        // Priority first (003 critical), then ctime (004 earliest of the
        // highs), then lexicographic spec id.
        assert_eq!(ids, vec!["003-c", "004-d", "001-a", "002-b"]);
    }

    #[tokio::test]
    async fn test_next_admissible_honors_dependencies() {
        let dir = TempDir::new().unwrap();
        let project_dir = project(&dir);

        let dep_plan = Plan::queued(TaskKind::Impl, TaskPriority::Critical);
        let mut gated = Plan::queued(TaskKind::Impl, TaskPriority::Critical);
        gated.depends_on = vec!["005-dep".to_string()];

        let dep_dir = make_spec(&project_dir, "005-dep", &dep_plan);
        let gated_dir = make_spec(&project_dir, "004-gated", &gated);

        let mut daemon = TaskDaemon::new(DaemonConfig::new(&project_dir)).unwrap();
        daemon.enqueue(queued("004-gated", &gated_dir, TaskPriority::Critical, 100));
        daemon.queue.last_mut().unwrap().depends_on = vec!["005-dep".to_string()];
        daemon.enqueue(queued("005-dep", &dep_dir, TaskPriority::Low, 200));

        // 005 runs before 004 regardless of priority: 004 is gated.
        let first = daemon.next_admissible().unwrap();
        assert_eq!(first.spec_id, "005-dep");

        // Still gated until the dependency is completed.
        assert!(daemon.next_admissible().is_none());
        daemon.state.mark_completed("005-dep");
        daemon.enqueue(queued("004-gated", &gated_dir, TaskPriority::Critical, 100));
        daemon.queue.last_mut().unwrap().depends_on = vec!["005-dep".to_string()];
        let second = daemon.next_admissible().unwrap();
        assert_eq!(second.spec_id, "004-gated");
    }

    #[tokio::test]
    async fn test_next_admissible_sweeps_stale_entries() {
        let dir = TempDir::new().unwrap();
        let project_dir = project(&dir);

        let mut done_plan = Plan::queued(TaskKind::Impl, TaskPriority::Normal);
        done_plan.set_status(TaskStatus::Done, XstateState::Done, ExecutionPhase::Complete);
        let done_dir = make_spec(&project_dir, "001-done", &done_plan);

        let live_plan = Plan::queued(TaskKind::Impl, TaskPriority::Normal);
        let live_dir = make_spec(&project_dir, "002-live", &live_plan);

        let mut daemon = TaskDaemon::new(DaemonConfig::new(&project_dir)).unwrap();
        daemon.enqueue(queued("001-done", &done_dir, TaskPriority::Critical, 100));
        daemon.enqueue(queued("002-live", &live_dir, TaskPriority::Normal, 200));

        let picked = daemon.next_admissible().unwrap();
        assert_eq!(picked.spec_id, "002-live");
        // The externally-completed entry was swept and recorded.
        assert!(daemon.state.is_completed("001-done"));
        assert!(daemon.queue.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_cap_blocks_admission() {
        let dir = TempDir::new().unwrap();
        let project_dir = project(&dir);
        let plan = Plan::queued(TaskKind::Impl, TaskPriority::Normal);
        let spec_dir = make_spec(&project_dir, "001-flaky", &plan);

        let mut daemon = TaskDaemon::new(DaemonConfig::new(&project_dir)).unwrap();
        for _ in 0..3 {
            daemon.state.increment_recovery("001-flaky");
        }
        daemon.enqueue(queued("001-flaky", &spec_dir, TaskPriority::Critical, 100));
        assert!(daemon.next_admissible().is_none());
    }

    #[tokio::test]
    async fn test_design_depth_cap_blocks_admission() {
        let dir = TempDir::new().unwrap();
        let project_dir = project(&dir);

        // Parent design at depth 0, child design at depth 1; with
        // max_child_depth=1 the child may not be admitted.
        let parent = Plan::queued(TaskKind::Design, TaskPriority::Critical);
        make_spec(&project_dir, "001-parent", &parent);
        let mut child = Plan::queued(TaskKind::Design, TaskPriority::Critical);
        child.parent_task = Some("001-parent".to_string());
        let child_dir = make_spec(&project_dir, "002-child", &child);

        let mut config = DaemonConfig::new(&project_dir);
        config.max_child_depth = 1;
        let mut daemon = TaskDaemon::new(config).unwrap();
        let mut entry = queued("002-child", &child_dir, TaskPriority::Critical, 100);
        entry.kind = TaskKind::Design;
        entry.parent_task = Some("001-parent".to_string());
        daemon.enqueue(entry);

        assert!(daemon.next_admissible().is_none());
    }

    #[tokio::test]
    async fn test_recovery_at_cap_transitions_to_error() {
        let dir = TempDir::new().unwrap();
        let project_dir = project(&dir);
        let plan = Plan::queued(TaskKind::Impl, TaskPriority::Normal);
        let spec_dir = make_spec(&project_dir, "001-stuck", &plan);

        let mut config = DaemonConfig::new(&project_dir);
        config.max_recovery = 2;
        config.grace = Duration::from_secs(1);
        let mut daemon = TaskDaemon::new(config).unwrap();

        // First stuck recovery: under the cap, the task goes back to queue.
        insert_running(&mut daemon, "001-stuck", &spec_dir);
        daemon.recover_task("001-stuck").await;
        assert!(!daemon.running.contains_key("001-stuck"));
        assert_eq!(daemon.state.recovery_count("001-stuck"), 1);
        assert!(daemon.queue.iter().any(|t| t.spec_id == "001-stuck"));
        let reloaded = PlanStore::new(&spec_dir).load().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Queue);

        // Second recovery hits the cap exactly: terminal error, no re-queue.
        // (The admission guard refuses count >= cap, so a re-queue here
        // would strand the task as a permanent zombie.)
        daemon.queue.clear();
        insert_running(&mut daemon, "001-stuck", &spec_dir);
        daemon.recover_task("001-stuck").await;
        assert_eq!(daemon.state.recovery_count("001-stuck"), 2);
        assert!(daemon.queue.is_empty());
        assert!(!daemon.running.contains_key("001-stuck"));
        let reloaded = PlanStore::new(&spec_dir).load().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Error);
        assert!(!reloaded.errors.is_empty());
        assert!(daemon.next_admissible().is_none());

        // Both recovery attempts left their trail in the event log.
        let events =
            crate::events::read_events(&spec_dir.join(crate::events::EVENTS_FILE), 0).unwrap();
        let stuck_events = events
            .iter()
            .filter(|e| e.payload["kind"] == "STUCK_RECOVERY")
            .count();
        assert_eq!(stuck_events, 2);
    }

    #[tokio::test]
    async fn test_synthesize_verify_caps_attempts() {
        let dir = TempDir::new().unwrap();
        let project_dir = project(&dir);
        let plan = Plan::queued(TaskKind::Impl, TaskPriority::Normal);
        let spec_dir = make_spec(&project_dir, "001-impl", &plan);

        let mut daemon = TaskDaemon::new(DaemonConfig::new(&project_dir)).unwrap();
        daemon.synthesize_verify("001-impl", &spec_dir);
        daemon.synthesize_verify("001-impl", &spec_dir);
        daemon.synthesize_verify("001-impl", &spec_dir);
        daemon.synthesize_verify("001-impl", &spec_dir); // over cap, ignored

        let specs = daemon.specs_dir.clone();
        assert!(specs.join("verify-001-impl").exists());
        assert!(specs.join("verify-001-impl-2").exists());
        assert!(specs.join("verify-001-impl-3").exists());
        assert!(!specs.join("verify-001-impl-4").exists());

        // The synthesized plan depends on the parent with high priority.
        let verify_plan = PlanStore::new(specs.join("verify-001-impl")).load().unwrap();
        assert_eq!(verify_plan.kind, TaskKind::Verify);
        assert_eq!(verify_plan.priority, TaskPriority::High);
        assert_eq!(verify_plan.depends_on, vec!["001-impl".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_disjoint_and_counts() {
        let dir = TempDir::new().unwrap();
        let project_dir = project(&dir);
        let plan = Plan::queued(TaskKind::Impl, TaskPriority::Normal);
        let spec_dir = make_spec(&project_dir, "001-q", &plan);

        let mut daemon = TaskDaemon::new(DaemonConfig::new(&project_dir)).unwrap();
        daemon.enqueue(queued("001-q", &spec_dir, TaskPriority::Normal, 100));
        daemon.state.mark_completed("000-old");

        let snapshot = daemon.snapshot();
        assert!(snapshot.is_consistent());
        assert_eq!(snapshot.stats.queued, 1);
        assert_eq!(snapshot.stats.running, 0);
        assert_eq!(snapshot.stats.completed, 1);
        assert_eq!(snapshot.pid, std::process::id());
    }
}
