//! The deployment executor.
//!
//! [`DeploymentManager`] is the write path for declared state: group
//! and app updates are validated, given service ports, diffed into a
//! plan, persisted, and then driven to completion by a background task
//! per deployment. Affected apps stay locked for the duration; steps
//! run in order, actions inside a step concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flotilla_core::{
    assign_service_ports, AppDefinition, Clock, Event, EventBus, Group, PathId, ServicePortRange,
    Timestamp,
};
use flotilla_health::HealthCheckManager;
use flotilla_master::SchedulerDriver;
use flotilla_queue::{LaunchQueue, RateLimiter};
use flotilla_state::{AppRepository, GroupRepository};
use flotilla_tracker::{Task, TaskTracker};

use crate::artifacts::ArtifactResolver;
use crate::error::{DeployError, DeployResult};
use crate::lock::AppLockRegistry;
use crate::plan::{plan as compute_plan, Action, DeploymentPlan, DeploymentStep};
use crate::repo::DeploymentRepository;

/// Tunables for deployment execution.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    /// Range for dynamically assigned service ports.
    pub service_ports: ServicePortRange,
    /// How often progress of restarts and kill-waits is re-evaluated.
    pub poll_interval: Duration,
    /// How long a kill may take to reach a terminal status before the
    /// step fails.
    pub kill_wait_timeout: Duration,
    /// Attempts per artifact URL before the deployment fails.
    pub artifact_retries: u32,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            service_ports: ServicePortRange::new(10_000, 20_000),
            poll_interval: Duration::from_secs(1),
            kill_wait_timeout: Duration::from_secs(120),
            artifact_retries: 3,
        }
    }
}

struct RunningDeployment {
    plan: DeploymentPlan,
    current_step: Arc<AtomicUsize>,
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    app_repo: AppRepository,
    group_repo: GroupRepository,
    deploy_repo: DeploymentRepository,
    tracker: TaskTracker,
    queue: LaunchQueue,
    limiter: RateLimiter,
    health: Arc<HealthCheckManager>,
    driver: Arc<dyn SchedulerDriver>,
    artifacts: Arc<dyn ArtifactResolver>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    locks: AppLockRegistry,
    running: RwLock<HashMap<String, RunningDeployment>>,
    config: DeploymentConfig,
}

/// Drives deployments and serializes declared-state mutations.
#[derive(Clone)]
pub struct DeploymentManager {
    inner: Arc<Inner>,
}

impl DeploymentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_repo: AppRepository,
        group_repo: GroupRepository,
        deploy_repo: DeploymentRepository,
        tracker: TaskTracker,
        queue: LaunchQueue,
        limiter: RateLimiter,
        health: Arc<HealthCheckManager>,
        driver: Arc<dyn SchedulerDriver>,
        artifacts: Arc<dyn ArtifactResolver>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: DeploymentConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                app_repo,
                group_repo,
                deploy_repo,
                tracker,
                queue,
                limiter,
                health,
                driver,
                artifacts,
                events,
                clock,
                locks: AppLockRegistry::new(),
                running: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    /// The lock registry, shared with the scheduler loop so scale
    /// reconciliation stays away from apps mid-deployment.
    pub fn locks(&self) -> AppLockRegistry {
        self.inner.locks.clone()
    }

    /// The current declared root, an empty tree before first use.
    pub fn root(&self) -> DeployResult<Group> {
        Ok(self
            .inner
            .group_repo
            .root()?
            .unwrap_or_else(Group::empty_root))
    }

    /// Replace the declared tree. Validates, assigns service ports,
    /// plans the diff and starts executing it.
    pub async fn update_root(&self, target: Group, force: bool) -> DeployResult<DeploymentPlan> {
        match self.update_root_inner(target.clone(), force).await {
            Ok(plan) => {
                self.inner.events.publish(Event::GroupChangeSuccess {
                    group_id: target.id.clone(),
                    version: plan.version,
                });
                Ok(plan)
            }
            Err(e) => {
                self.inner.events.publish(Event::GroupChangeFailed {
                    group_id: target.id.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Compute the plan for a proposed tree without executing it
    /// (`PUT /v2/groups?dryRun=true` semantics).
    pub async fn dry_run(&self, mut target: Group) -> DeployResult<DeploymentPlan> {
        target.validate()?;
        let original = self.root()?;
        let now = self.inner.clock.now();
        target.update_version(now);
        normalize_versions(&original, &mut target, now)?;
        assign_service_ports(Some(&original), &mut target, &self.inner.config.service_ports)?;
        Ok(compute_plan(&original, &target, now)?)
    }

    /// Insert or replace a single app in the tree.
    pub async fn put_app(&self, app: AppDefinition, force: bool) -> DeployResult<DeploymentPlan> {
        app.validate()?;
        let mut target = self.root()?;
        let now = self.inner.clock.now();
        target.put_app(app, now)?;
        self.update_root(target, force).await
    }

    /// Remove an app (and kill its tasks).
    pub async fn delete_app(&self, id: &PathId, force: bool) -> DeployResult<DeploymentPlan> {
        let mut target = self.root()?;
        let now = self.inner.clock.now();
        if target.remove_app(id, now).is_none() {
            return Err(DeployError::UnknownApp(id.to_string()));
        }
        self.update_root(target, force).await
    }

    /// Remove a whole group subtree.
    pub async fn delete_group(&self, id: &PathId, force: bool) -> DeployResult<DeploymentPlan> {
        let mut target = self.root()?;
        let now = self.inner.clock.now();
        if target.remove_group(id, now).is_none() {
            return Err(DeployError::UnknownGroup(id.to_string()));
        }
        self.update_root(target, force).await
    }

    /// Force a rolling restart of an unchanged app by rebinding it to
    /// a fresh version.
    pub async fn restart_app(&self, id: &PathId, force: bool) -> DeployResult<DeploymentPlan> {
        let original = self.root()?;
        let Some(app) = original.find_app(id) else {
            return Err(DeployError::UnknownApp(id.to_string()));
        };
        let now = self.inner.clock.now();
        let mut app = app.clone();
        app.version = now;

        let mut target = original.clone();
        target.put_app(app.clone(), now)?;

        // The definition is unchanged, so the planner would see no
        // diff; the restart step is explicit.
        let plan = DeploymentPlan {
            id: Uuid::new_v4().to_string(),
            version: now,
            original,
            target: target.clone(),
            steps: vec![DeploymentStep {
                actions: vec![Action::RestartApplication { app }],
            }],
        };
        self.begin(plan, target, force).await
    }

    /// Plans currently executing.
    pub async fn deployments(&self) -> Vec<DeploymentPlan> {
        let running = self.inner.running.read().await;
        running.values().map(|r| r.plan.clone()).collect()
    }

    /// The actions of the step a deployment is currently executing.
    pub async fn current_actions(&self, id: &str) -> Option<Vec<Action>> {
        let running = self.inner.running.read().await;
        let deployment = running.get(id)?;
        let step = deployment.current_step.load(Ordering::SeqCst);
        deployment
            .plan
            .steps
            .get(step)
            .map(|s| s.actions.clone())
    }

    /// Cancel a running deployment. By default a rollback deployment
    /// to the canceled plan's original tree is created and returned;
    /// with `force` the plan is dropped where it stands.
    pub async fn cancel(&self, id: &str, force: bool) -> DeployResult<Option<DeploymentPlan>> {
        let Some(running) = self.inner.running.write().await.remove(id) else {
            return Err(DeployError::UnknownDeployment(id.to_string()));
        };
        let _ = running.cancel_tx.send(true);
        running.handle.abort();
        self.inner.locks.release(id).await;
        self.inner.deploy_repo.expunge(id)?;
        self.inner.events.publish(Event::DeploymentFailed {
            id: id.to_string(),
            reason: "canceled".to_string(),
        });
        info!(deployment = id, force, "deployment canceled");

        if force {
            return Ok(None);
        }
        let rollback = self
            .update_root_inner(running.plan.original.clone(), true)
            .await?;
        Ok(Some(rollback))
    }

    /// Resume persisted plans after a leader change. Locks are taken
    /// unconditionally; nothing else can be running yet.
    pub async fn recover(&self) -> DeployResult<usize> {
        let plans = self.inner.deploy_repo.all()?;
        let count = plans.len();
        for plan in plans {
            info!(deployment = %plan.id, "resuming persisted deployment");
            self.inner.locks.steal(&plan.affected_app_ids(), &plan.id).await;
            self.spawn_run(plan).await;
        }
        Ok(count)
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn update_root_inner(
        &self,
        mut target: Group,
        force: bool,
    ) -> DeployResult<DeploymentPlan> {
        target.validate()?;
        let original = self.root()?;
        let now = self.inner.clock.now();
        target.update_version(now);
        normalize_versions(&original, &mut target, now)?;
        assign_service_ports(Some(&original), &mut target, &self.inner.config.service_ports)?;

        let plan = compute_plan(&original, &target, now)?;
        self.begin(plan, target, force).await
    }

    async fn begin(
        &self,
        plan: DeploymentPlan,
        target: Group,
        force: bool,
    ) -> DeployResult<DeploymentPlan> {
        if plan.is_empty() {
            self.inner.group_repo.store_root(&target)?;
            return Ok(plan);
        }

        let affected = plan.affected_app_ids();
        if force {
            let losers = self.inner.locks.holders(&affected).await;
            for loser in losers {
                self.cancel_superseded(&loser, &plan.id).await?;
            }
            self.inner.locks.steal(&affected, &plan.id).await;
        } else if let Err(holders) = self.inner.locks.acquire(&affected, &plan.id).await {
            return Err(DeployError::AppLocked(holders));
        }

        // Persist before acting so a new leader can resume.
        if let Err(e) = self.inner.deploy_repo.store(&plan) {
            self.inner.locks.release(&plan.id).await;
            return Err(e.into());
        }
        self.inner.group_repo.store_root(&target)?;

        info!(
            deployment = %plan.id,
            steps = plan.steps.len(),
            force,
            "deployment starting"
        );
        self.spawn_run(plan.clone()).await;
        Ok(plan)
    }

    async fn cancel_superseded(&self, loser: &str, winner: &str) -> DeployResult<()> {
        let Some(running) = self.inner.running.write().await.remove(loser) else {
            return Ok(());
        };
        let _ = running.cancel_tx.send(true);
        running.handle.abort();
        self.inner.locks.release(loser).await;
        self.inner.deploy_repo.expunge(loser)?;
        self.inner.events.publish(Event::DeploymentFailed {
            id: loser.to_string(),
            reason: format!("superseded by deployment {winner}"),
        });
        warn!(deployment = loser, winner, "deployment superseded");
        Ok(())
    }

    async fn spawn_run(&self, plan: DeploymentPlan) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let current_step = Arc::new(AtomicUsize::new(0));
        let inner = self.inner.clone();
        let run_plan = plan.clone();
        let step_counter = current_step.clone();
        // Holding the map lock across the spawn keeps the task's own
        // cleanup from racing ahead of the insert.
        let mut running = self.inner.running.write().await;
        let handle = tokio::spawn(async move {
            run_deployment(inner, run_plan, step_counter, cancel_rx).await;
        });
        running.insert(
            plan.id.clone(),
            RunningDeployment {
                plan,
                current_step,
                cancel_tx,
                handle,
            },
        );
    }
}

/// Keep original versions on apps the update does not change, so
/// their tasks and launch delays stay attached.
fn normalize_versions(
    original: &Group,
    target: &mut Group,
    now: Timestamp,
) -> DeployResult<()> {
    let ids: Vec<PathId> = target
        .transitive_apps()
        .iter()
        .map(|a| a.id.clone())
        .collect();
    for id in ids {
        let Some(old) = original.find_app(&id) else {
            continue;
        };
        let app = target.find_app(&id).expect("id from target");
        if !old.is_upgrade(app) {
            let mut kept = app.clone();
            kept.version = old.version;
            target.put_app(kept, now)?;
        }
    }
    Ok(())
}

async fn run_deployment(
    inner: Arc<Inner>,
    plan: DeploymentPlan,
    current_step: Arc<AtomicUsize>,
    mut cancel: watch::Receiver<bool>,
) {
    let id = plan.id.clone();
    for (index, step) in plan.steps.iter().enumerate() {
        if *cancel.borrow() {
            finish(&inner, &id, Err(DeployError::Canceled(id.clone()))).await;
            return;
        }
        current_step.store(index, Ordering::SeqCst);
        inner.events.publish(Event::DeploymentInfo {
            id: id.clone(),
            step: index,
        });
        debug!(deployment = %id, step = index, actions = step.actions.len(), "step starting");

        let results = join_all(
            step.actions
                .iter()
                .map(|action| run_action(&inner, action, &plan, cancel.clone())),
        )
        .await;

        if let Some(err) = results.into_iter().find_map(Result::err) {
            error!(deployment = %id, step = index, error = %err, "step failed");
            inner.events.publish(Event::DeploymentStepFailure {
                id: id.clone(),
                step: index,
                reason: err.to_string(),
            });
            finish(&inner, &id, Err(err)).await;
            return;
        }
        inner.events.publish(Event::DeploymentStepSuccess {
            id: id.clone(),
            step: index,
        });
    }
    finish(&inner, &id, Ok(())).await;
}

async fn finish(inner: &Arc<Inner>, id: &str, result: DeployResult<()>) {
    inner.locks.release(id).await;
    inner.running.write().await.remove(id);
    if let Err(e) = inner.deploy_repo.expunge(id) {
        warn!(deployment = id, error = %e, "failed to expunge finished plan");
    }
    match result {
        Ok(()) => {
            info!(deployment = id, "deployment succeeded");
            inner
                .events
                .publish(Event::DeploymentSuccess { id: id.to_string() });
        }
        Err(e) => {
            inner.events.publish(Event::DeploymentFailed {
                id: id.to_string(),
                reason: e.to_string(),
            });
        }
    }
}

async fn run_action(
    inner: &Arc<Inner>,
    action: &Action,
    plan: &DeploymentPlan,
    cancel: watch::Receiver<bool>,
) -> DeployResult<()> {
    match action {
        Action::StartApplication { app } => start_app(inner, app).await,
        Action::ScaleApplication { app, to } => scale_app(inner, app, *to, cancel, &plan.id).await,
        Action::RestartApplication { app } => restart_app(inner, app, cancel, &plan.id).await,
        Action::StopApplication { app } => stop_app(inner, app, cancel, &plan.id).await,
        Action::ResolveArtifacts { app_id, urls } => resolve_artifacts(inner, app_id, urls).await,
    }
}

async fn start_app(inner: &Arc<Inner>, app: &AppDefinition) -> DeployResult<()> {
    inner.app_repo.store_version(app)?;
    if !app.health_checks.is_empty() {
        inner.health.add(app).await;
    }
    inner.limiter.add_delay(app).await;
    inner
        .queue
        .add(app, app.instances, inner.clock.now())
        .await;
    info!(app = %app.id, instances = app.instances, "app started");
    Ok(())
}

async fn scale_app(
    inner: &Arc<Inner>,
    app: &AppDefinition,
    to: u32,
    mut cancel: watch::Receiver<bool>,
    plan_id: &str,
) -> DeployResult<()> {
    inner.app_repo.store_version(app)?;
    let tasks = inner.tracker.get(&app.id).await;
    let queued = inner.queue.count(&app.id).await;
    let current = tasks.len() + queued;
    let target = to as usize;

    if target > current {
        let missing = (target - current) as u32;
        inner.limiter.add_delay(app).await;
        inner.queue.add(app, missing, inner.clock.now()).await;
        info!(app = %app.id, from = current, to, "scaling up");
        return Ok(());
    }

    if target < current {
        let mut surplus = current - target;
        // Queued launches are the cheapest thing to drop.
        while surplus > 0 && inner.queue.poll(&app.id).await.is_some() {
            surplus -= 1;
        }
        let victims = pick_victims(&tasks, surplus);
        let victim_ids: Vec<String> = victims.iter().map(|t| t.id.clone()).collect();
        for id in &victim_ids {
            inner.driver.kill_task(id)?;
        }
        info!(app = %app.id, from = current, to, kills = victim_ids.len(), "scaling down");
        await_removed(inner, &app.id, &victim_ids, &mut cancel, plan_id).await?;
    }
    Ok(())
}

async fn restart_app(
    inner: &Arc<Inner>,
    app: &AppDefinition,
    mut cancel: watch::Receiver<bool>,
    plan_id: &str,
) -> DeployResult<()> {
    inner.app_repo.store_version(app)?;
    if !app.health_checks.is_empty() {
        inner.health.add(app).await;
    }
    // Launches of the previous version still waiting for offers would
    // only fight the replacement.
    inner.queue.purge(&app.id).await;

    let n = app.instances as usize;
    let strategy = app.upgrade_strategy;
    let min_healthy = (n as f64 * strategy.minimum_health_capacity).ceil() as usize;
    let max_over = (n as f64 * strategy.maximum_over_capacity).floor() as usize;
    let max_total = n + max_over;

    info!(
        app = %app.id,
        version = %app.version,
        instances = n,
        min_healthy,
        max_over,
        "rolling restart starting"
    );

    let mut killed: HashSet<String> = HashSet::new();
    loop {
        if *cancel.borrow() {
            return Err(DeployError::Canceled(plan_id.to_string()));
        }

        let tasks = inner.tracker.get(&app.id).await;
        let old: Vec<&Task> = tasks.iter().filter(|t| t.app_version != app.version).collect();
        let new_total = tasks.len() - old.len();
        let new_healthy = inner.health.alive_tasks(&app.id, app.version).await.len();

        if old.is_empty() && new_healthy >= n {
            break;
        }

        // Kill as many old tasks as the health floor allows. Tasks we
        // already told the driver to kill no longer count toward it.
        let pending_old: Vec<&Task> = old
            .iter()
            .copied()
            .filter(|t| !killed.contains(&t.id))
            .collect();
        let floor_budget = (pending_old.len() + new_healthy).saturating_sub(min_healthy);
        let kill_now = floor_budget.min(pending_old.len());
        if kill_now > 0 {
            let candidates: Vec<Task> = pending_old.iter().map(|t| (*t).clone()).collect();
            for victim in pick_victims(&candidates, kill_now) {
                inner.driver.kill_task(&victim.id)?;
                killed.insert(victim.id.clone());
            }
        }

        // Launch replacements within the over-capacity ceiling.
        let queued = inner.queue.count(&app.id).await;
        let total = tasks.len() + queued;
        let missing = n.saturating_sub(new_total + queued);
        let capacity = max_total.saturating_sub(total);
        let to_launch = missing.min(capacity);
        if to_launch > 0 {
            inner.limiter.add_delay(app).await;
            inner
                .queue
                .add(app, to_launch as u32, inner.clock.now())
                .await;
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
            _ = cancel.changed() => {}
        }
    }

    // Old versions have no tasks left; drop their checkers.
    inner.health.reconcile_with(&app.id).await?;
    info!(app = %app.id, version = %app.version, "rolling restart complete");
    Ok(())
}

async fn stop_app(
    inner: &Arc<Inner>,
    app: &AppDefinition,
    mut cancel: watch::Receiver<bool>,
    plan_id: &str,
) -> DeployResult<()> {
    inner.queue.purge(&app.id).await;
    let tasks = inner.tracker.get(&app.id).await;
    let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    for id in &ids {
        inner.driver.kill_task(id)?;
    }
    await_removed(inner, &app.id, &ids, &mut cancel, plan_id).await?;

    inner.limiter.reset_delays_for(&app.id).await;
    inner.health.remove_all(&app.id).await;
    inner.app_repo.expunge(&app.id)?;
    info!(app = %app.id, killed = ids.len(), "app stopped");
    Ok(())
}

async fn resolve_artifacts(
    inner: &Arc<Inner>,
    app_id: &PathId,
    urls: &[String],
) -> DeployResult<()> {
    for url in urls {
        let mut attempt = 0;
        loop {
            match inner.artifacts.resolve(url) {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt >= inner.config.artifact_retries {
                        error!(app = %app_id, url, error = %e, "artifact resolution failed");
                        return Err(DeployError::ResolveArtifactFailed(url.clone()));
                    }
                    warn!(app = %app_id, url, attempt, error = %e, "artifact fetch retry");
                    tokio::time::sleep(inner.config.poll_interval).await;
                }
            }
        }
    }
    Ok(())
}

/// Scale-down victims: unhealthy first, then oldest `staged_at`.
fn pick_victims(tasks: &[Task], count: usize) -> Vec<&Task> {
    let mut candidates: Vec<&Task> = tasks.iter().collect();
    candidates.sort_by(|a, b| {
        a.is_healthy()
            .cmp(&b.is_healthy())
            .then(a.staged_at.cmp(&b.staged_at))
            .then(a.id.cmp(&b.id))
    });
    candidates.truncate(count);
    candidates
}

/// Wait until none of `ids` is tracked anymore.
async fn await_removed(
    inner: &Arc<Inner>,
    app_id: &PathId,
    ids: &[String],
    cancel: &mut watch::Receiver<bool>,
    plan_id: &str,
) -> DeployResult<()> {
    let mut waited = Duration::ZERO;
    loop {
        let tasks = inner.tracker.get(app_id).await;
        if ids.iter().all(|id| !tasks.iter().any(|t| &t.id == id)) {
            return Ok(());
        }
        if *cancel.borrow() {
            return Err(DeployError::Canceled(plan_id.to_string()));
        }
        if waited >= inner.config.kill_wait_timeout {
            return Err(DeployError::Timeout(format!(
                "tasks of {app_id} did not reach a terminal status"
            )));
        }
        tokio::select! {
            _ = tokio::time::sleep(inner.config.poll_interval) => {
                waited += inner.config.poll_interval;
            }
            _ = cancel.changed() => {}
        }
    }
}
