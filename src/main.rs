use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use agent_relay::cli::{Cli, Commands, WorkspaceAction};
use agent_relay::config::{RelayConfig, SupervisorConfig};
use agent_relay::error::DatabaseError;
use agent_relay::executor::{ProcessExecutor, ProcessExecutorConfig};
use agent_relay::health::{HealthMonitor, spawn_health_monitor};
use agent_relay::intake::{Intake, OutboundSignal};
use agent_relay::notify::{Notifier, notifier_from_env};
use agent_relay::queue::{Job, JobKind, JobPayload, JobQueue};
use agent_relay::recovery::supervisor::LOG_FILE_PREFIX;
use agent_relay::recovery::{CrashRecovery, DaemonControl, Supervisor, write_pid};
use agent_relay::session::{SessionRegistry, SessionStatus, SessionTracker, SteeringChannel};
use agent_relay::store::{self, Database};
use agent_relay::worker::{Scheduler, WorkerDeps, spawn_queue_sweeper};
use agent_relay::workspace::WorkspaceManager;

/// Lock file held by a running daemon. A leftover one blocks the next start.
const DAEMON_LOCK: &str = "agent-relay.lock";
/// How often the daemon looks for pending work submitted by other processes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Finished jobs and events older than this are deleted at startup.
const KEEP_FINISHED_DAYS: u32 = 30;

#[derive(Debug, thiserror::Error)]
#[error("job store unavailable at {path}: {source}")]
struct StoreUnavailable {
    path: PathBuf,
    source: DatabaseError,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = RelayConfig::from_env();

    // Only the daemon writes the rolling log; its freshness is a liveness signal.
    let _guard = init_logging(&config, matches!(cli.command, Commands::Run));

    match dispatch(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            if e.downcast_ref::<StoreUnavailable>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_logging(config: &RelayConfig, to_file: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = if to_file {
        if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
            eprintln!("Warning: cannot create log dir {}: {e}", config.log_dir.display());
        }
        let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

/// Store-backed services shared by the subcommands.
struct Components {
    db: Arc<dyn Database>,
    queue: JobQueue,
    tracker: SessionTracker,
    steering: SteeringChannel,
    registry: Arc<SessionRegistry>,
}

impl Components {
    async fn open(config: &RelayConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let db = store::open(&config.db_path)
            .await
            .map_err(|source| StoreUnavailable {
                path: config.db_path.clone(),
                source,
            })?;

        let registry = Arc::new(SessionRegistry::new());
        Ok(Self {
            queue: JobQueue::new(db.clone(), &config.queue),
            tracker: SessionTracker::new(db.clone(), &config.queue),
            steering: SteeringChannel::new(db.clone(), registry.clone(), &config.queue),
            registry,
            db,
        })
    }

    /// Intake for one-shot commands. The daemon's sweeper starts the worker.
    fn intake(&self) -> Intake {
        let (outbound, _) = mpsc::unbounded_channel();
        Intake::new(
            self.queue.clone(),
            self.tracker.clone(),
            self.steering.clone(),
            None,
            outbound,
        )
    }
}

async fn dispatch(cli: Cli, config: RelayConfig) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Status { json } => cmd_status(&config, json).await,
        Commands::FlushStuck => {
            let c = Components::open(&config).await?;
            let recovery = CrashRecovery::new(c.queue, c.tracker, config.health.clone());
            let outcomes = recovery.flush_stuck().await?;
            if outcomes.is_empty() {
                println!("No stuck jobs");
            }
            for outcome in outcomes {
                println!("{}", serde_json::to_string(&outcome)?);
            }
            Ok(())
        }
        Commands::FlushJob { id } => {
            let c = Components::open(&config).await?;
            let recovery = CrashRecovery::new(c.queue, c.tracker, config.health.clone());
            let outcome = recovery.flush_job(id).await?;
            println!("{}", serde_json::to_string(&outcome)?);
            Ok(())
        }
        Commands::Submit {
            project,
            session,
            text,
            priority,
            long_running,
            slug,
            sender,
        } => {
            let c = Components::open(&config).await?;
            let mut job = Job::new(project, session, JobPayload::text(text).with_sender(sender))
                .with_priority(priority.into());
            if long_running {
                job = job.with_kind(JobKind::LongRunning);
            }
            if let Some(slug) = slug {
                job = job.with_work_item(slug);
            }
            let job_id = c.intake().submit_job(job).await?;
            println!("{job_id}");
            Ok(())
        }
        Commands::Steer {
            project,
            session,
            text,
            sender,
            abort,
        } => {
            let c = Components::open(&config).await?;
            let payload = JobPayload::text(text).with_sender(sender);
            let routed = c
                .intake()
                .route_message(&project, &session, payload, abort)
                .await?;
            println!("{routed:?}");
            Ok(())
        }
        Commands::Workspace { action } => {
            let manager = WorkspaceManager::new(&config.repo_path, &config.worktrees_dir);
            match action {
                WorkspaceAction::List => {
                    for ws in manager.list().await? {
                        println!(
                            "{}\t{}\t{}",
                            ws.slug,
                            ws.branch.as_deref().unwrap_or("-"),
                            ws.path.display()
                        );
                    }
                }
                WorkspaceAction::Prune => {
                    let report = manager.prune().await?;
                    println!("Removed {} stale workspace(s)", report.removed_dirs.len());
                }
                WorkspaceAction::Remove {
                    slug,
                    delete_branch,
                } => {
                    manager.remove(&slug, delete_branch).await?;
                    println!("Removed {slug}");
                }
            }
            Ok(())
        }
        Commands::Supervise { once } => cmd_supervise(&config, once).await,
    }
}

async fn cmd_status(config: &RelayConfig, json: bool) -> anyhow::Result<()> {
    let c = Components::open(config).await?;
    let counts = c.queue.counts_by_key().await?;
    let active = c.tracker.list(SessionStatus::Active).await?;

    if json {
        let out = serde_json::json!({
            "queues": counts,
            "active_sessions": active,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if counts.is_empty() {
        println!("Queue empty");
    }
    for key in &counts {
        println!(
            "{:<24} pending={:<4} running={}",
            key.project_key, key.pending, key.running
        );
    }
    println!("Active sessions: {}", active.len());
    for session in &active {
        println!(
            "  {} ({}) since {}",
            session.session_id,
            session.project_key,
            session.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_supervise(config: &RelayConfig, once: bool) -> anyhow::Result<()> {
    let sup_config = SupervisorConfig::from_relay(config);
    let db = Components::open(config).await?.db;
    let notifier: Arc<dyn Notifier> = Arc::from(notifier_from_env()?);
    let supervisor = Supervisor::new(
        sup_config,
        Arc::new(DaemonControl::current_exe()?),
        notifier,
        db,
    );

    if once {
        let outcome = supervisor.check_once().await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        supervisor.run().await;
    }
    Ok(())
}

async fn cmd_run(config: RelayConfig) -> anyhow::Result<()> {
    let sup_config = SupervisorConfig::from_relay(&config);
    let components = Components::open(&config).await?;

    let lock_path = config.data_dir().join(DAEMON_LOCK);
    acquire_daemon_lock(&lock_path)?;
    write_pid(&sup_config.pid_file, std::process::id()).await?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %config.db_path.display(),
        pid = std::process::id(),
        "agent-relay starting"
    );

    let result = serve(config, components).await;

    for path in [&lock_path, &sup_config.pid_file] {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove runtime file");
        }
    }
    result
}

fn acquire_daemon_lock(path: &Path) -> anyhow::Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| {
            format!(
                "lock {} exists; another daemon is running or the last one crashed \
                 (agent-relay supervise --once clears stale locks)",
                path.display()
            )
        })?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

async fn serve(config: RelayConfig, c: Components) -> anyhow::Result<()> {
    let report = CrashRecovery::new(c.queue.clone(), c.tracker.clone(), config.health.clone())
        .run_startup()
        .await?;
    if !report.is_noop() {
        tracing::warn!(?report, "Recovered state from previous run");
    }

    if let Err(e) = c.queue.prune_finished(KEEP_FINISHED_DAYS).await {
        tracing::warn!(error = %e, "Failed to prune finished jobs");
    }

    let workspaces = Arc::new(WorkspaceManager::new(
        &config.repo_path,
        &config.worktrees_dir,
    ));
    match workspaces.prune().await {
        Ok(report) if !report.removed_dirs.is_empty() => {
            tracing::info!(removed = report.removed_dirs.len(), "Pruned stale workspaces");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Workspace prune failed"),
    }

    let notifier: Arc<dyn Notifier> = Arc::from(notifier_from_env()?);
    tracing::info!(notifier = notifier.name(), "Alerts configured");

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<OutboundSignal>();
    let signal_log = tokio::spawn(async move {
        while let Some(signal) = outbound_rx.recv().await {
            tracing::info!(job_id = %signal.job_id(), ?signal, "Outbound signal");
        }
    });

    let executor = Arc::new(ProcessExecutor::new(ProcessExecutorConfig::from_relay(
        &config,
    )));
    let scheduler = Arc::new(Scheduler::new(WorkerDeps {
        queue: c.queue.clone(),
        tracker: c.tracker.clone(),
        steering: c.steering.clone(),
        registry: c.registry.clone(),
        executor,
        workspaces: Some(workspaces),
        outbound,
        config: config.queue.clone(),
    }));

    for key in &config.project_keys {
        scheduler.ensure_worker(key).await;
    }
    let started = scheduler.ensure_workers_for_pending().await?;
    tracing::info!(
        configured = config.project_keys.len(),
        started,
        "Workers started"
    );

    let sweeper = spawn_queue_sweeper(scheduler.clone(), SWEEP_INTERVAL);
    let monitor = Arc::new(
        HealthMonitor::new(
            c.queue.clone(),
            c.tracker.clone(),
            c.registry.clone(),
            notifier,
            config.health.clone(),
        )
        .with_scheduler(scheduler.clone()),
    );
    let health = spawn_health_monitor(monitor, config.health.check_interval);

    wait_for_shutdown().await?;
    tracing::info!("Shutting down");

    sweeper.abort();
    health.abort();
    // Jobs cut off here are requeued by startup recovery on the next boot.
    scheduler.shutdown().await;
    signal_log.abort();
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
