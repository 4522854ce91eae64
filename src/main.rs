// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Autoforge daemon entry point.
//!
//! Without a subcommand, runs the task daemon against `--project-dir` until
//! interrupted. The hidden `run-task` subcommand is the child-process mode
//! the daemon spawns: one pipeline run for one spec directory.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 already running,
//! 3 project not initialized, 130 interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use autoforge::agents::AgentRegistry;
use autoforge::cancel::CancelToken;
use autoforge::commands::DaemonCommand;
use autoforge::daemon::{DaemonConfig, TaskDaemon};
use autoforge::error::ProjectStateError;
use autoforge::events::EventLog;
use autoforge::pipeline::{builtin, PipelineEngine, StageContext};
use autoforge::plan::PlanStore;
use autoforge::project::{Capabilities, ProjectIndex};
use autoforge::session::CliSessionFactory;
use autoforge::settings::{
    effective_max_child_depth, resolve, ProjectSettings, TaskOverrides,
};
use autoforge::telemetry::{self, TelemetryConfig};
use autoforge::worktree::WorktreeManager;
use autoforge::{PRIVATE_DIR, VERSION};

/// Autoforge - autonomous task orchestration daemon.
#[derive(Parser)]
#[command(name = "autoforge")]
#[command(author, version, about = "Autonomous task orchestration daemon", long_about = None)]
struct Cli {
    /// Project root (containing .auto-claude/specs/)
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Worker pool size
    #[arg(long, default_value_t = 1)]
    max_concurrent: usize,

    /// Enable git worktree isolation for parallel tasks
    #[arg(long)]
    use_worktrees: bool,

    /// Status file path (default: {project}/.auto-claude/daemon_status.json)
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Seconds without a heartbeat before a task counts as stuck
    #[arg(long, default_value_t = 600)]
    stuck_timeout: u64,

    /// Seconds between full specs-directory rescans
    #[arg(long, default_value_t = 60)]
    rescan_interval: u64,

    /// Maximum recovery attempts per task
    #[arg(long, default_value_t = 3)]
    max_recovery: u32,

    /// Design decomposition depth cap (MAX_CHILD_DEPTH overrides)
    #[arg(long, default_value_t = 2)]
    max_child_depth: u32,

    /// Base branch worktrees are created from and merged into
    #[arg(long, default_value = "main")]
    base_branch: String,

    /// Duplicate logs into this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Show debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Child-process mode: run one pipeline for one spec dir.
    #[command(hide = true)]
    RunTask {
        #[arg(long)]
        project_dir: PathBuf,
        #[arg(long)]
        spec_dir: PathBuf,
        #[arg(long)]
        working_dir: PathBuf,
        #[arg(long, default_value_t = 2)]
        max_child_depth: u32,
        #[arg(long)]
        use_worktrees: bool,
        #[arg(long, default_value = "main")]
        base_branch: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let telemetry_config = if cli.debug {
        TelemetryConfig::development()
    } else {
        TelemetryConfig::default()
    };
    telemetry::init(telemetry_config, cli.log_file.as_deref());

    let code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
        .block_on(run(cli));
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Some(Commands::RunTask {
            project_dir,
            spec_dir,
            working_dir,
            max_child_depth,
            use_worktrees,
            base_branch,
        }) => {
            run_task(
                project_dir,
                spec_dir,
                working_dir,
                max_child_depth,
                use_worktrees,
                base_branch,
            )
            .await
        }
        None => {
            let Some(project_dir) = cli.project_dir.clone() else {
                eprintln!("{}", "--project-dir is required".red());
                return 1;
            };
            run_daemon(cli, project_dir).await
        }
    }
}

async fn run_daemon(cli: Cli, project_dir: PathBuf) -> i32 {
    let project_dir = match project_dir.canonicalize() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{} {e}", "invalid --project-dir:".red());
            return 1;
        }
    };

    let mut config = DaemonConfig::new(&project_dir);
    config.max_concurrent = cli.max_concurrent;
    config.use_worktrees = cli.use_worktrees;
    config.status_file = cli.status_file;
    config.stuck_timeout = Duration::from_secs(cli.stuck_timeout);
    config.rescan_interval = Duration::from_secs(cli.rescan_interval);
    config.max_recovery = cli.max_recovery;
    config.max_child_depth = effective_max_child_depth(cli.max_child_depth);
    config.base_branch = cli.base_branch;

    let mut daemon = match TaskDaemon::new(config.clone()) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("{} {e}", "daemon startup failed:".red());
            return e.exit_code();
        }
    };

    banner(&config);

    // SIGINT/SIGTERM drain the daemon; a clean drain still exits 130.
    let bus = daemon.command_bus();
    let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let interrupted_flag = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            let _ = bus.send(DaemonCommand::Stop).await;
        }
    });

    match daemon.run().await {
        Ok(()) => {
            if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
                130
            } else {
                0
            }
        }
        Err(e @ ProjectStateError::AlreadyRunning { .. }) => {
            eprintln!("{} {e}", "error:".red());
            2
        }
        Err(e @ ProjectStateError::ProjectNotInitialized(_)) => {
            eprintln!("{} {e}", "error:".red());
            3
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".red());
            1
        }
    }
}

async fn run_task(
    project_dir: PathBuf,
    spec_dir: PathBuf,
    working_dir: PathBuf,
    max_child_depth: u32,
    use_worktrees: bool,
    base_branch: String,
) -> i32 {
    let spec_id = spec_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let plan_store = PlanStore::new(&spec_dir);
    let plan = match plan_store.load() {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("{} {e}", "plan unreadable:".red());
            return 1;
        }
    };

    let Some(pipeline) = builtin(plan.kind.pipeline_name()) else {
        eprintln!("no pipeline for task kind {}", plan.kind);
        return 1;
    };

    let mut registry = AgentRegistry::with_defaults();
    let private_dir = project_dir.join(PRIVATE_DIR);
    if let Err(e) = registry.load_custom(&private_dir) {
        eprintln!("{} {e}", "custom agents rejected:".red());
        return 1;
    }
    let registry = Arc::new(registry);

    let project_settings = ProjectSettings::load(&private_dir).unwrap_or_default();
    let task_overrides = TaskOverrides::load(&spec_dir).unwrap_or_default();
    let settings = resolve(
        &project_settings,
        &task_overrides,
        "code",
        autoforge::settings::ThinkingLevel::Medium,
    );

    let index = ProjectIndex::load(&project_dir);
    let capabilities = Capabilities::detect(&index);

    let events = match EventLog::open(&spec_dir) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("{} {e}", "event log unavailable:".red());
            return 1;
        }
    };

    let cancel = CancelToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let ctx = StageContext {
        spec_id: spec_id.clone(),
        project_dir: project_dir.clone(),
        working_dir,
        spec_dir,
        plan: plan_store,
        events: Arc::new(tokio::sync::Mutex::new(events)),
        cancel,
        settings,
        sessions: Arc::new(CliSessionFactory::new(Arc::clone(&registry))),
        registry,
        capabilities,
        index,
        worktrees: use_worktrees
            .then(|| Arc::new(WorktreeManager::new(&project_dir, base_branch))),
        merge_lock: Arc::new(tokio::sync::Mutex::new(())),
        max_child_depth,
    };

    match PipelineEngine::run(&pipeline, &ctx).await {
        Ok(report) => {
            println!(
                "pipeline {} complete: {} stage(s)",
                report.pipeline,
                report.stages.len()
            );
            0
        }
        Err(e) => {
            eprintln!("{} {e}", "pipeline failed:".red());
            // Leave the failure on the plan for the daemon and UI.
            let _ = ctx.plan.update(|plan| {
                plan.push_error("PipelineError", &e.to_string());
                plan.set_status(
                    autoforge::types::TaskStatus::Error,
                    autoforge::types::XstateState::Error,
                    autoforge::types::ExecutionPhase::Failed,
                );
            });
            1
        }
    }
}

fn banner(config: &DaemonConfig) {
    println!("{}", "=".repeat(64));
    println!(
        "  {} {}",
        "autoforge task daemon".bold(),
        format!("v{VERSION}").dimmed()
    );
    println!("{}", "=".repeat(64));
    println!("  project:         {}", config.project_dir.display());
    println!("  max concurrent:  {}", config.max_concurrent);
    println!(
        "  worktrees:       {}",
        if config.use_worktrees { "enabled" } else { "disabled" }
    );
    println!("  stuck timeout:   {}s", config.stuck_timeout.as_secs());
    println!("  max recovery:    {}", config.max_recovery);
    println!("  pid:             {}", std::process::id());
    println!("{}", "=".repeat(64));
    println!("Press Ctrl+C to stop");
}
