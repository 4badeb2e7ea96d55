//! flotillad — the flotilla daemon.
//!
//! Wires the orchestrator core together and runs the scheduler loop
//! until shutdown: state store, repositories, task tracker, launch
//! queue, health manager, deployment manager, offer matcher.
//!
//! The wire transport to the resource master is injected by the
//! embedder: whatever speaks the master's protocol feeds
//! [`SchedulerEvent`]s into the channel returned at startup and
//! implements [`SchedulerDriver`] for the outbound direction. Without
//! a transport (a plain `flotillad run`) the daemon logs outbound
//! driver calls and idles, which is useful for poking at the state
//! store and the REST layers during development.
//!
//! ```text
//! flotillad run --store /var/lib/flotilla/state.redb
//! flotillad run --config /etc/flotilla/flotilla.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use flotilla_core::{EventBus, ServicePortRange, SystemClock};
use flotilla_deploy::{DeploymentConfig, DeploymentManager, DeploymentRepository, NoopResolver};
use flotilla_health::HealthCheckManager;
use flotilla_master::{DriverResult, SchedulerDriver, TaskLaunch, TaskStatus};
use flotilla_queue::{LaunchQueue, RateLimiter};
use flotilla_scheduler::{MatcherConfig, OfferMatcher, SchedulerConfig, SchedulerEvent, SchedulerLoop};
use flotilla_state::{AppRepository, FrameworkIdRepository, GroupRepository, StateStore};
use flotilla_tracker::{TaskRepository, TaskTracker};

use crate::config::{FlotillaConfig, Settings};

#[derive(Parser)]
#[command(name = "flotillad", about = "flotilla orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator core.
    Run {
        /// Optional flotilla.toml; CLI flags override file values.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path of the state store database.
        #[arg(long)]
        store: Option<PathBuf>,

        /// Lower bound of the dynamic service-port range.
        #[arg(long)]
        local_port_min: Option<u32>,

        /// Upper bound of the dynamic service-port range.
        #[arg(long)]
        local_port_max: Option<u32>,

        /// Seconds a task may stay staging before it is killed.
        #[arg(long)]
        task_launch_timeout: Option<u64>,

        /// Seconds between task reconciliation rounds.
        #[arg(long)]
        reconciliation_interval: Option<u64>,
    },
}

/// Stand-in driver for runs without a master transport. Outbound
/// calls are logged and dropped.
struct LoggingDriver;

impl SchedulerDriver for LoggingDriver {
    fn launch_tasks(&self, offer_id: &str, tasks: Vec<TaskLaunch>) -> DriverResult<()> {
        info!(offer = offer_id, count = tasks.len(), "driver: launch");
        Ok(())
    }
    fn kill_task(&self, task_id: &str) -> DriverResult<()> {
        info!(task = task_id, "driver: kill");
        Ok(())
    }
    fn decline_offer(&self, offer_id: &str) -> DriverResult<()> {
        info!(offer = offer_id, "driver: decline");
        Ok(())
    }
    fn revive_offers(&self) -> DriverResult<()> {
        info!("driver: revive");
        Ok(())
    }
    fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> DriverResult<()> {
        info!(count = statuses.len(), "driver: reconcile");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            store,
            local_port_min,
            local_port_max,
            task_launch_timeout,
            reconciliation_interval,
        } => {
            let mut settings = Settings::default();
            if let Some(path) = config {
                let file = FlotillaConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?;
                settings = file.apply(settings);
            }
            if let Some(path) = store {
                settings.store_path = path;
            }
            if let Some(min) = local_port_min {
                settings.local_port_min = min;
            }
            if let Some(max) = local_port_max {
                settings.local_port_max = max;
            }
            if let Some(secs) = task_launch_timeout {
                settings.task_launch_timeout = std::time::Duration::from_secs(secs);
            }
            if let Some(secs) = reconciliation_interval {
                settings.reconciliation_interval = std::time::Duration::from_secs(secs);
            }
            run(settings).await
        }
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    info!(store = %settings.store_path.display(), "flotillad starting");

    if let Some(parent) = settings.store_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = StateStore::open(&settings.store_path).context("opening state store")?;

    let clock = Arc::new(SystemClock);
    let events = EventBus::default();
    let driver: Arc<dyn SchedulerDriver> = Arc::new(LoggingDriver);

    let app_repo = AppRepository::new(store.clone());
    let group_repo = GroupRepository::new(store.clone());
    let framework_repo = FrameworkIdRepository::new(store.clone());
    let tracker = TaskTracker::new(TaskRepository::new(store.clone()), clock.clone());
    let queue = LaunchQueue::new();
    let limiter = RateLimiter::new(clock.clone());

    let health = Arc::new(HealthCheckManager::new(
        tracker.clone(),
        app_repo.clone(),
        driver.clone(),
        events.clone(),
        clock.clone(),
    ));

    let deployments = DeploymentManager::new(
        app_repo.clone(),
        group_repo.clone(),
        DeploymentRepository::new(store.clone()),
        tracker.clone(),
        queue.clone(),
        limiter.clone(),
        health.clone(),
        driver.clone(),
        Arc::new(NoopResolver),
        events.clone(),
        clock.clone(),
        DeploymentConfig {
            service_ports: ServicePortRange::new(
                settings.local_port_min,
                settings.local_port_max,
            ),
            kill_wait_timeout: settings.kill_wait_timeout,
            ..DeploymentConfig::default()
        },
    );

    let recovered_tasks = tracker.recover().await.context("recovering tasks")?;
    let resumed = deployments.recover().await?;
    info!(recovered_tasks, resumed_deployments = resumed, "state recovered");

    let matcher = OfferMatcher::new(
        queue.clone(),
        tracker.clone(),
        limiter.clone(),
        clock.clone(),
        MatcherConfig::default(),
    );
    let scheduler = SchedulerLoop::new(
        matcher,
        tracker,
        queue,
        limiter,
        health,
        app_repo,
        group_repo,
        framework_repo,
        deployments.locks(),
        driver,
        events,
        clock,
        SchedulerConfig {
            task_launch_timeout: settings.task_launch_timeout,
            reconciliation_interval: settings.reconciliation_interval,
        },
    );
    let mut fatal = scheduler.fatal_signal();

    // The transport feeds this channel; see the module docs.
    let (event_tx, event_rx) = mpsc::channel::<SchedulerEvent>(1024);

    // Periodic task reconciliation with the master.
    let reconcile_tx = event_tx.clone();
    let reconcile_every = settings.reconciliation_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reconcile_every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if reconcile_tx.send(SchedulerEvent::ReconcileTasks).await.is_err() {
                break;
            }
        }
    });

    let loop_handle = tokio::spawn(async move { scheduler.run(event_rx).await });
    info!("flotillad running, press ctrl-c to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
        _ = fatal.changed() => {
            warn!("fatal driver error, exiting so a fresh leader can register");
            drop(event_tx);
            let _ = loop_handle.await;
            std::process::exit(1);
        }
    }

    drop(event_tx);
    let _ = loop_handle.await;
    info!("flotillad stopped");
    Ok(())
}
