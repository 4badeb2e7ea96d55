//! The health check manager.
//!
//! Owns the `app → version → checkers` map behind a reader/writer
//! lock: status readers share the read lock, add/remove/reconcile take
//! the write lock. One checker exists per `(app, version, check)`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use flotilla_core::{AppDefinition, Clock, Event, EventBus, PathId, Timestamp};
use flotilla_master::{SchedulerDriver, TaskStatus};
use flotilla_state::{AppRepository, StateResult};
use flotilla_tracker::{HealthResult, TaskId, TaskTracker};

use crate::checker::Checker;

/// Aggregated per-app health tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthCounts {
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

/// Manages all health checkers and aggregates their verdicts.
pub struct HealthCheckManager {
    tracker: TaskTracker,
    app_repo: AppRepository,
    driver: Arc<dyn SchedulerDriver>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    checks: Arc<RwLock<HashMap<PathId, HashMap<Timestamp, Vec<Checker>>>>>,
}

impl HealthCheckManager {
    pub fn new(
        tracker: TaskTracker,
        app_repo: AppRepository,
        driver: Arc<dyn SchedulerDriver>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracker,
            app_repo,
            driver,
            events,
            clock,
            checks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start checkers for every health check of this app version.
    /// Replaces existing checkers for the same version.
    pub async fn add(&self, app: &AppDefinition) {
        let mut checkers = Vec::new();
        for (index, spec) in app.health_checks.iter().enumerate() {
            checkers.push(Checker::start(
                app.id.clone(),
                app.version,
                index,
                spec.clone(),
                self.tracker.clone(),
                self.driver.clone(),
                self.events.clone(),
                self.clock.clone(),
            ));
        }
        if checkers.is_empty() {
            return;
        }
        let count = checkers.len();
        let mut checks = self.checks.write().await;
        checks
            .entry(app.id.clone())
            .or_default()
            .insert(app.version, checkers);
        drop(checks);
        debug!(app = %app.id, version = %app.version, count, "health checkers started");
        self.events.publish(Event::AddHealthCheckEvent {
            app_id: app.id.clone(),
            version: app.version,
        });
    }

    /// Stop checkers for one app version.
    pub async fn remove(&self, app_id: &PathId, version: Timestamp) {
        let removed = {
            let mut checks = self.checks.write().await;
            let removed = checks.get_mut(app_id).and_then(|v| v.remove(&version));
            if checks.get(app_id).is_some_and(|v| v.is_empty()) {
                checks.remove(app_id);
            }
            removed
        };
        if let Some(mut checkers) = removed {
            for checker in &mut checkers {
                checker.stop();
            }
            self.events.publish(Event::RemoveHealthCheckEvent {
                app_id: app_id.clone(),
                version,
            });
        }
    }

    /// Stop every checker of an app (app stopped).
    pub async fn remove_all(&self, app_id: &PathId) {
        let mut checks = self.checks.write().await;
        if let Some(mut versions) = checks.remove(app_id) {
            for (version, checkers) in versions.iter_mut() {
                for checker in checkers.iter_mut() {
                    checker.stop();
                }
                self.events.publish(Event::RemoveHealthCheckEvent {
                    app_id: app_id.clone(),
                    version: *version,
                });
            }
            info!(app = %app_id, "all health checkers removed");
        }
    }

    /// Align checkers with the versions that actually have tasks:
    /// prune dead versions, start checkers for live ones.
    pub async fn reconcile_with(&self, app_id: &PathId) -> StateResult<()> {
        let tasks = self.tracker.get(app_id).await;
        let mut live_versions: Vec<Timestamp> = tasks.iter().map(|t| t.app_version).collect();
        live_versions.sort();
        live_versions.dedup();

        // Prune checkers for versions with no surviving tasks.
        let stale: Vec<Timestamp> = {
            let checks = self.checks.read().await;
            checks
                .get(app_id)
                .map(|versions| {
                    versions
                        .keys()
                        .filter(|v| !live_versions.contains(v))
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        for version in stale {
            self.remove(app_id, version).await;
        }

        // Start checkers for live versions we are not yet watching.
        for version in live_versions {
            let already = {
                let checks = self.checks.read().await;
                checks
                    .get(app_id)
                    .is_some_and(|versions| versions.contains_key(&version))
            };
            if already {
                continue;
            }
            if let Some(app) = self.app_repo.get(app_id, version)? {
                self.add(&app).await;
            }
        }
        Ok(())
    }

    /// Forward the healthy bit of a task status update to the matching
    /// COMMAND checkers.
    pub async fn update(&self, status: &TaskStatus) {
        let Some(healthy) = status.healthy else {
            return;
        };
        let Ok(app_id) = TaskId::app_id(&status.task_id) else {
            return;
        };
        let Some(task) = self.tracker.get_task(&app_id, &status.task_id).await else {
            return;
        };

        let checks = self.checks.read().await;
        let Some(checkers) = checks
            .get(&app_id)
            .and_then(|versions| versions.get(&task.app_version))
        else {
            return;
        };
        for checker in checkers {
            if checker.spec.is_command() {
                checker
                    .record_command_result(
                        &task,
                        healthy,
                        self.clock.now(),
                        &self.events,
                        &self.driver,
                    )
                    .await;
            }
        }
    }

    /// Verdicts for one task across all checks of its app.
    pub async fn status(&self, app_id: &PathId, task_id: &str) -> Vec<HealthResult> {
        let checks = self.checks.read().await;
        let mut out = Vec::new();
        if let Some(versions) = checks.get(app_id) {
            for checkers in versions.values() {
                for checker in checkers {
                    if let Some(result) = checker.results().await.get(task_id) {
                        out.push(result.clone());
                    }
                }
            }
        }
        out.sort_by_key(|h| h.check_index);
        out
    }

    /// Verdicts for every task of an app.
    pub async fn statuses(&self, app_id: &PathId) -> HashMap<String, Vec<HealthResult>> {
        let checks = self.checks.read().await;
        let mut out: HashMap<String, Vec<HealthResult>> = HashMap::new();
        if let Some(versions) = checks.get(app_id) {
            for checkers in versions.values() {
                for checker in checkers {
                    for (task_id, result) in checker.results().await {
                        out.entry(task_id).or_default().push(result);
                    }
                }
            }
        }
        for results in out.values_mut() {
            results.sort_by_key(|h| h.check_index);
        }
        out
    }

    /// Healthy / unhealthy / unknown tally over the app's tasks.
    ///
    /// Apps without health checks count running tasks as healthy.
    pub async fn health_counts(&self, app_id: &PathId) -> HealthCounts {
        let tasks = self.tracker.get(app_id).await;
        let statuses = self.statuses(app_id).await;
        let has_checks = {
            let checks = self.checks.read().await;
            checks.get(app_id).is_some_and(|v| !v.is_empty())
        };

        let mut counts = HealthCounts::default();
        for task in &tasks {
            if !has_checks {
                if task.is_running() {
                    counts.healthy += 1;
                } else {
                    counts.unknown += 1;
                }
                continue;
            }
            match statuses.get(&task.id) {
                Some(results) if results.iter().any(|r| r.is_known()) => {
                    if results.iter().all(|r| r.alive) {
                        counts.healthy += 1;
                    } else {
                        counts.unhealthy += 1;
                    }
                }
                _ => counts.unknown += 1,
            }
        }
        counts
    }

    /// Task ids of one app version that count as healthy for capacity
    /// math: all checks alive, or simply running when the version has
    /// no checks.
    pub async fn alive_tasks(&self, app_id: &PathId, version: Timestamp) -> Vec<String> {
        let tasks = self.tracker.get(app_id).await;
        let has_checks = {
            let checks = self.checks.read().await;
            checks
                .get(app_id)
                .is_some_and(|versions| versions.contains_key(&version))
        };
        if !has_checks {
            return tasks
                .iter()
                .filter(|t| t.app_version == version && t.is_running())
                .map(|t| t.id.clone())
                .collect();
        }
        let statuses = self.statuses(app_id).await;
        tasks
            .iter()
            .filter(|t| t.app_version == version && t.is_running())
            .filter(|t| {
                statuses
                    .get(&t.id)
                    .is_some_and(|results| !results.is_empty() && results.iter().all(|r| r.alive))
            })
            .map(|t| t.id.clone())
            .collect()
    }
}
