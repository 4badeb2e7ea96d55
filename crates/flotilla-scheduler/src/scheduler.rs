//! The central scheduler loop.
//!
//! One coordinator task owns the mutation order: every externally
//! driven event — offers, status updates, reconciliation requests,
//! driver lifecycle — funnels through an mpsc channel and is handled
//! to completion before the next one. Events for a single app are
//! therefore processed in driver-receipt order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use flotilla_core::{Clock, Event, EventBus, Group, PathId};
use flotilla_deploy::AppLockRegistry;
use flotilla_health::HealthCheckManager;
use flotilla_master::{Offer, SchedulerDriver, TaskStatus};
use flotilla_queue::{LaunchQueue, RateLimiter};
use flotilla_state::{with_retries, AppRepository, FrameworkIdRepository, GroupRepository};
use flotilla_tracker::{Task, TaskId, TaskTracker};

use crate::matcher::{is_current, OfferMatcher};

/// Scheduler loop tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Staging tasks older than this are killed on the next offer round.
    pub task_launch_timeout: Duration,
    /// How often the embedder should enqueue `ReconcileTasks`.
    pub reconciliation_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_launch_timeout: Duration::from_secs(300),
            reconciliation_interval: Duration::from_secs(600),
        }
    }
}

/// Everything the master-facing transport can tell the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Registered { framework_id: String, master: String },
    Reregistered { master: String },
    ResourceOffers { offers: Vec<Offer> },
    OfferRescinded { offer_id: String },
    StatusUpdate { status: TaskStatus },
    ReconcileTasks,
    Disconnected,
    Error { message: String },
}

/// The coordinator. `run` consumes events until the channel closes or
/// a fatal driver error arrives.
pub struct SchedulerLoop {
    matcher: OfferMatcher,
    tracker: TaskTracker,
    queue: LaunchQueue,
    limiter: RateLimiter,
    health: Arc<HealthCheckManager>,
    app_repo: AppRepository,
    group_repo: GroupRepository,
    framework_repo: FrameworkIdRepository,
    locks: AppLockRegistry,
    driver: Arc<dyn SchedulerDriver>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    fatal_tx: watch::Sender<bool>,
}

impl SchedulerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        matcher: OfferMatcher,
        tracker: TaskTracker,
        queue: LaunchQueue,
        limiter: RateLimiter,
        health: Arc<HealthCheckManager>,
        app_repo: AppRepository,
        group_repo: GroupRepository,
        framework_repo: FrameworkIdRepository,
        locks: AppLockRegistry,
        driver: Arc<dyn SchedulerDriver>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let (fatal_tx, _) = watch::channel(false);
        Self {
            matcher,
            tracker,
            queue,
            limiter,
            health,
            app_repo,
            group_repo,
            framework_repo,
            locks,
            driver,
            events,
            clock,
            config,
            fatal_tx,
        }
    }

    /// Fires `true` once a fatal driver error demands process exit.
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal_tx.subscribe()
    }

    pub async fn run(&self, mut rx: mpsc::Receiver<SchedulerEvent>) {
        info!("scheduler loop running");
        while let Some(event) = rx.recv().await {
            if !self.handle(event).await {
                break;
            }
        }
        info!("scheduler loop stopped");
    }

    /// Handle one event. Returns false when the loop must terminate.
    pub async fn handle(&self, event: SchedulerEvent) -> bool {
        match event {
            SchedulerEvent::Registered {
                framework_id,
                master,
            } => {
                self.on_registered(framework_id, master).await;
                true
            }
            SchedulerEvent::Reregistered { master } => {
                info!(%master, "reregistered with master");
                self.events
                    .publish(Event::SchedulerReregistered { master });
                true
            }
            SchedulerEvent::ResourceOffers { offers } => {
                self.on_offers(offers).await;
                true
            }
            SchedulerEvent::OfferRescinded { offer_id } => {
                // Matching is synchronous per offer; nothing in flight
                // can reference a rescinded id.
                debug!(offer = %offer_id, "offer rescinded");
                true
            }
            SchedulerEvent::StatusUpdate { status } => {
                self.on_status(status).await;
                true
            }
            SchedulerEvent::ReconcileTasks => {
                self.on_reconcile().await;
                true
            }
            SchedulerEvent::Disconnected => {
                warn!("disconnected from master");
                self.events.publish(Event::SchedulerDisconnected);
                true
            }
            SchedulerEvent::Error { message } => {
                self.on_fatal_error(message).await;
                false
            }
        }
    }

    async fn on_registered(&self, framework_id: String, master: String) {
        let stored = with_retries(3, Duration::from_millis(100), || {
            self.framework_repo.store(&framework_id)
        })
        .await;
        if let Err(e) = stored {
            error!(error = %e, "failed to persist framework id");
        }
        info!(%framework_id, %master, "registered with master");
        self.events.publish(Event::SchedulerRegistered {
            framework_id,
            master,
        });
        if let Err(e) = self.driver.revive_offers() {
            warn!(error = %e, "revive after registration failed");
        }
    }

    async fn on_offers(&self, offers: Vec<Offer>) {
        // Kill tasks stuck in staging past the launch timeout.
        for task in self
            .tracker
            .check_staged_tasks(self.config.task_launch_timeout)
            .await
        {
            warn!(task = %task.id, app = %task.app_id, "killing task staged too long");
            if let Err(e) = self.driver.kill_task(&task.id) {
                warn!(task = %task.id, error = %e, "failed to kill expired stager");
            }
        }

        // Prune queued launches whose app version is no longer current.
        let root = self.current_root();
        let dropped = self
            .queue
            .retain(|entry| is_current(&entry.app, root.find_app(&entry.app.id)))
            .await;
        if dropped > 0 {
            debug!(dropped, "stale queue entries pruned");
        }

        for offer in offers {
            let matched = self.matcher.match_offer(&offer).await;
            if matched.is_empty() {
                if let Err(e) = self.driver.decline_offer(&offer.id) {
                    warn!(offer = %offer.id, error = %e, "decline failed");
                }
                continue;
            }

            // Persist-before-launch: the tracker (and the store behind
            // it) knows the task before the master does.
            let mut infos = Vec::with_capacity(matched.len());
            for launch in matched {
                match self.tracker.created(launch.task).await {
                    Ok(()) => infos.push(launch.info),
                    Err(e) => error!(error = %e, "failed to record launch, skipping"),
                }
            }
            if infos.is_empty() {
                let _ = self.driver.decline_offer(&offer.id);
                continue;
            }
            info!(offer = %offer.id, launches = infos.len(), host = %offer.hostname, "launching");
            if let Err(e) = self.driver.launch_tasks(&offer.id, infos) {
                error!(offer = %offer.id, error = %e, "launch failed");
            }
        }
    }

    async fn on_status(&self, status: TaskStatus) {
        // Health bits ride on status updates; the manager routes them
        // to command checkers.
        self.health.update(&status).await;

        let Ok(app_id) = TaskId::app_id(&status.task_id) else {
            warn!(task = %status.task_id, "unparseable task id, killing");
            let _ = self.driver.kill_task(&status.task_id);
            return;
        };

        let root = self.current_root();
        let known_app = root.find_app(&app_id).is_some();
        let known_task = self.tracker.get_task(&app_id, &status.task_id).await.is_some();
        if !known_app && !known_task {
            if !status.state.is_terminal() {
                warn!(task = %status.task_id, app = %app_id, "status for unknown app, killing");
                let _ = self.driver.kill_task(&status.task_id);
            }
            return;
        }

        let mut host = String::new();
        if status.state.is_terminal() {
            match self.tracker.terminated(&status).await {
                Ok(Some(task)) => {
                    host = task.host.clone();
                    if status.is_failure() {
                        self.add_failure_delay(&app_id, &task).await;
                    }
                    self.reconcile_scale(&app_id, &root).await;
                }
                Ok(None) => {}
                Err(e) => error!(task = %status.task_id, error = %e, "terminate failed"),
            }
        } else if status.state == flotilla_master::TaskState::Running {
            let first_running = self
                .tracker
                .get_task(&app_id, &status.task_id)
                .await
                .map(|t| t.started_at.is_none())
                .unwrap_or(false);
            match self.tracker.running(&status).await {
                Ok(Some(task)) => {
                    host = task.host.clone();
                    if first_running {
                        self.limiter.reset_delay(&app_id, task.app_version).await;
                    }
                }
                Ok(None) => {}
                Err(e) => error!(task = %status.task_id, error = %e, "running update failed"),
            }
        } else {
            match self.tracker.status_update(&status).await {
                Ok(Some(task)) => host = task.host.clone(),
                Ok(None) => {}
                Err(e) => error!(task = %status.task_id, error = %e, "status update failed"),
            }
        }

        self.events.publish(Event::StatusUpdateEvent {
            app_id,
            task_id: status.task_id.clone(),
            state: format!("{:?}", status.state),
            host,
        });
    }

    async fn on_reconcile(&self) {
        let tasks = self.tracker.all().await;
        if !tasks.is_empty() {
            let statuses: Vec<TaskStatus> = tasks
                .iter()
                .map(|t| TaskStatus::new(&t.id, t.status, self.clock.now()))
                .collect();
            debug!(count = statuses.len(), "reconciling known tasks");
            if let Err(e) = self.driver.reconcile_tasks(statuses) {
                warn!(error = %e, "explicit reconciliation failed");
                return;
            }
        }
        // The empty reconcile asks the master for everything it knows
        // that we might not.
        if let Err(e) = self.driver.reconcile_tasks(Vec::new()) {
            warn!(error = %e, "implicit reconciliation failed");
        }
    }

    async fn on_fatal_error(&self, message: String) {
        error!(%message, "fatal driver error, abdicating leadership");
        match self.framework_repo.expunge() {
            Ok(_) => info!("framework id expunged"),
            Err(e) => error!(error = %e, "failed to expunge framework id"),
        }
        let _ = self.fatal_tx.send(true);
    }

    async fn add_failure_delay(&self, app_id: &PathId, task: &Task) {
        match self.app_repo.get(app_id, task.app_version) {
            Ok(Some(app)) => self.limiter.increase_delay(&app).await,
            Ok(None) => debug!(app = %app_id, "no stored definition for failed task"),
            Err(e) => warn!(app = %app_id, error = %e, "failed to load app for backoff"),
        }
    }

    /// Converge observed instance counts back to the declared count.
    /// Apps under a deployment lock are the executor's business.
    async fn reconcile_scale(&self, app_id: &PathId, root: &Group) {
        if self.locks.holder(app_id).await.is_some() {
            return;
        }
        let Some(app) = root.find_app(app_id) else {
            return;
        };
        let desired = app.instances as usize;
        let current = self.tracker.count(app_id).await + self.queue.count(app_id).await;

        if current < desired {
            let missing = (desired - current) as u32;
            info!(app = %app_id, current, desired, "relaunching lost capacity");
            self.limiter.add_delay(app).await;
            self.queue.add(app, missing, self.clock.now()).await;
        } else if current > desired {
            let mut surplus = current - desired;
            while surplus > 0 && self.queue.poll(app_id).await.is_some() {
                surplus -= 1;
            }
            if surplus > 0 {
                let mut tasks = self.tracker.get(app_id).await;
                tasks.sort_by(|a, b| {
                    a.is_healthy()
                        .cmp(&b.is_healthy())
                        .then(a.staged_at.cmp(&b.staged_at))
                });
                info!(app = %app_id, current, desired, kills = surplus, "killing surplus tasks");
                for task in tasks.iter().take(surplus) {
                    if let Err(e) = self.driver.kill_task(&task.id) {
                        warn!(task = %task.id, error = %e, "surplus kill failed");
                    }
                }
            }
        }
    }

    fn current_root(&self) -> Group {
        match self.group_repo.root() {
            Ok(Some(root)) => root,
            Ok(None) => Group::empty_root(),
            Err(e) => {
                error!(error = %e, "failed to load group root");
                Group::empty_root()
            }
        }
    }
}
