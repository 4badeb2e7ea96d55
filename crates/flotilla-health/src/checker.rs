//! One checker per `(app, version, check)`.
//!
//! HTTP and TCP checkers run a probe loop in a background task
//! (shut down through a watch channel). COMMAND checkers are passive:
//! the agent-side executor probes and the verdicts arrive as healthy
//! bits on task status updates.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flotilla_core::{
    Clock, Event, EventBus, HealthCheckProtocol, HealthCheckSpec, PathId, Timestamp,
};
use flotilla_master::SchedulerDriver;
use flotilla_tracker::{HealthResult, Task, TaskTracker};

use crate::probe::{http_probe, tcp_probe, ProbeOutcome};

/// What applying a probe outcome did to the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Unchanged,
    BecameHealthy,
    BecameUnhealthy,
}

/// Fold one probe outcome into a task's result. `in_grace` suppresses
/// failures until the first success or the grace period elapses.
pub(crate) fn apply_outcome(
    result: &mut HealthResult,
    outcome: &ProbeOutcome,
    now: Timestamp,
    in_grace: bool,
) -> Transition {
    match outcome {
        ProbeOutcome::Success => {
            let was_alive = result.alive;
            if result.first_success.is_none() {
                result.first_success = Some(now);
            }
            result.last_success = Some(now);
            result.consecutive_failures = 0;
            result.alive = true;
            if was_alive {
                Transition::Unchanged
            } else {
                Transition::BecameHealthy
            }
        }
        ProbeOutcome::Failure(_) => {
            if in_grace {
                return Transition::Unchanged;
            }
            let was_alive = result.alive || !result.is_known();
            result.last_failure = Some(now);
            result.consecutive_failures += 1;
            result.alive = false;
            if was_alive {
                Transition::BecameUnhealthy
            } else {
                Transition::Unchanged
            }
        }
        // 1xx with ignore_http_1xx: no effect either way.
        ProbeOutcome::Ignored => Transition::Unchanged,
    }
}

/// A live checker for one health check of one app version.
pub struct Checker {
    pub app_id: PathId,
    pub app_version: Timestamp,
    pub check_index: usize,
    pub spec: HealthCheckSpec,
    results: Arc<RwLock<HashMap<String, HealthResult>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Checker {
    /// Spawn an active (HTTP/TCP) probe loop, or create a passive
    /// holder for COMMAND checks.
    pub fn start(
        app_id: PathId,
        app_version: Timestamp,
        check_index: usize,
        spec: HealthCheckSpec,
        tracker: TaskTracker,
        driver: Arc<dyn SchedulerDriver>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let results: Arc<RwLock<HashMap<String, HealthResult>>> =
            Arc::new(RwLock::new(HashMap::new()));

        if spec.is_command() {
            return Self {
                app_id,
                app_version,
                check_index,
                spec,
                results,
                shutdown_tx: None,
                handle: None,
            };
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_ctx = CheckLoop {
            app_id: app_id.clone(),
            app_version,
            check_index,
            spec: spec.clone(),
            tracker,
            driver,
            events,
            clock,
            results: results.clone(),
        };
        let handle = tokio::spawn(loop_ctx.run(shutdown_rx));

        Self {
            app_id,
            app_version,
            check_index,
            spec,
            results,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Snapshot of per-task verdicts.
    pub async fn results(&self) -> HashMap<String, HealthResult> {
        self.results.read().await.clone()
    }

    /// Feed a command-check verdict from a task status update.
    pub async fn record_command_result(
        &self,
        task: &Task,
        healthy: bool,
        now: Timestamp,
        events: &EventBus,
        driver: &Arc<dyn SchedulerDriver>,
    ) {
        let outcome = if healthy {
            ProbeOutcome::Success
        } else {
            ProbeOutcome::Failure("command reported unhealthy".to_string())
        };
        let mut results = self.results.write().await;
        let result = results
            .entry(task.id.clone())
            .or_insert_with(|| HealthResult::unknown(self.check_index));
        let in_grace = in_grace_period(&self.spec, task, result, now);
        let transition = apply_outcome(result, &outcome, now, in_grace);
        let failures = result.consecutive_failures;
        drop(results);

        publish_transition(events, &self.app_id, &task.id, transition);
        if !healthy {
            events.publish(Event::FailedHealthCheckEvent {
                app_id: self.app_id.clone(),
                task_id: task.id.clone(),
            });
        }
        maybe_kill(driver, &self.app_id, &task.id, &self.spec, failures);
    }

    /// Stop the probe loop, if any.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Checker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn in_grace_period(
    spec: &HealthCheckSpec,
    task: &Task,
    result: &HealthResult,
    now: Timestamp,
) -> bool {
    if result.first_success.is_some() {
        return false;
    }
    let started = task.started_at.unwrap_or(task.staged_at);
    now.since(started) < spec.grace_period()
}

fn publish_transition(events: &EventBus, app_id: &PathId, task_id: &str, transition: Transition) {
    match transition {
        Transition::BecameHealthy => events.publish(Event::HealthStatusChangedEvent {
            app_id: app_id.clone(),
            task_id: task_id.to_string(),
            alive: true,
        }),
        Transition::BecameUnhealthy => events.publish(Event::HealthStatusChangedEvent {
            app_id: app_id.clone(),
            task_id: task_id.to_string(),
            alive: false,
        }),
        Transition::Unchanged => {}
    }
}

fn maybe_kill(
    driver: &Arc<dyn SchedulerDriver>,
    app_id: &PathId,
    task_id: &str,
    spec: &HealthCheckSpec,
    consecutive_failures: u32,
) {
    if spec.max_consecutive_failures > 0 && consecutive_failures == spec.max_consecutive_failures {
        info!(
            app = %app_id,
            task = task_id,
            failures = consecutive_failures,
            "killing task after consecutive health check failures"
        );
        if let Err(e) = driver.kill_task(task_id) {
            warn!(task = task_id, error = %e, "failed to kill unhealthy task");
        }
    }
}

/// The probe loop for one active checker.
struct CheckLoop {
    app_id: PathId,
    app_version: Timestamp,
    check_index: usize,
    spec: HealthCheckSpec,
    tracker: TaskTracker,
    driver: Arc<dyn SchedulerDriver>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    results: Arc<RwLock<HashMap<String, HealthResult>>>,
}

impl CheckLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(
            app = %self.app_id,
            version = %self.app_version,
            check = self.check_index,
            "health check loop starting"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.spec.interval()) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    debug!(app = %self.app_id, check = self.check_index, "health check loop stopping");
                    break;
                }
            }
        }
    }

    async fn tick(&self) {
        let tasks: Vec<Task> = self
            .tracker
            .get(&self.app_id)
            .await
            .into_iter()
            .filter(|t| t.app_version == self.app_version && t.is_running())
            .collect();

        // Forget verdicts for tasks that went away.
        {
            let mut results = self.results.write().await;
            results.retain(|task_id, _| tasks.iter().any(|t| &t.id == task_id));
        }

        for task in &tasks {
            let outcome = self.probe(task).await;
            let now = self.clock.now();

            let (transition, failures, snapshot) = {
                let mut results = self.results.write().await;
                let result = results
                    .entry(task.id.clone())
                    .or_insert_with(|| HealthResult::unknown(self.check_index));
                let in_grace = in_grace_period(&self.spec, task, result, now);
                let transition = apply_outcome(result, &outcome, now, in_grace);
                (transition, result.consecutive_failures, result.clone())
            };

            publish_transition(&self.events, &self.app_id, &task.id, transition);
            // failures == 0 after a failure outcome means the grace
            // period swallowed it.
            if matches!(outcome, ProbeOutcome::Failure(_)) && failures > 0 {
                self.events.publish(Event::FailedHealthCheckEvent {
                    app_id: self.app_id.clone(),
                    task_id: task.id.clone(),
                });
            }
            maybe_kill(&self.driver, &self.app_id, &task.id, &self.spec, failures);

            let mut merged = task.health_results.clone();
            merged.retain(|h| h.check_index != self.check_index);
            merged.push(snapshot);
            merged.sort_by_key(|h| h.check_index);
            if let Err(e) = self
                .tracker
                .set_health_results(&self.app_id, &task.id, merged)
                .await
            {
                warn!(task = %task.id, error = %e, "failed to mirror health results");
            }
        }
    }

    async fn probe(&self, task: &Task) -> ProbeOutcome {
        let port = task
            .host_ports
            .get(self.spec.port_index)
            .copied()
            .unwrap_or(0);
        if port == 0 {
            return ProbeOutcome::Failure(format!(
                "no host port at index {}",
                self.spec.port_index
            ));
        }
        match &self.spec.protocol {
            HealthCheckProtocol::Http {
                path,
                ignore_http_1xx,
            } => {
                http_probe(&task.host, port, path, self.spec.timeout(), *ignore_http_1xx).await
            }
            HealthCheckProtocol::Tcp => tcp_probe(&task.host, port, self.spec.timeout()).await,
            HealthCheckProtocol::Command { .. } => {
                unreachable!("command checks have no probe loop")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> HealthResult {
        HealthResult::unknown(0)
    }

    fn t(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn first_success_marks_healthy() {
        let mut r = result();
        let tr = apply_outcome(&mut r, &ProbeOutcome::Success, t(100), false);
        assert_eq!(tr, Transition::BecameHealthy);
        assert!(r.alive);
        assert_eq!(r.first_success, Some(t(100)));
        assert_eq!(r.consecutive_failures, 0);
    }

    #[test]
    fn success_after_failures_resets_streak() {
        let mut r = result();
        apply_outcome(&mut r, &ProbeOutcome::Failure("x".into()), t(1), false);
        apply_outcome(&mut r, &ProbeOutcome::Failure("x".into()), t(2), false);
        assert_eq!(r.consecutive_failures, 2);

        let tr = apply_outcome(&mut r, &ProbeOutcome::Success, t(3), false);
        assert_eq!(tr, Transition::BecameHealthy);
        assert_eq!(r.consecutive_failures, 0);
    }

    #[test]
    fn repeat_success_is_unchanged() {
        let mut r = result();
        apply_outcome(&mut r, &ProbeOutcome::Success, t(1), false);
        let tr = apply_outcome(&mut r, &ProbeOutcome::Success, t(2), false);
        assert_eq!(tr, Transition::Unchanged);
    }

    #[test]
    fn failure_flips_to_unhealthy_once() {
        let mut r = result();
        apply_outcome(&mut r, &ProbeOutcome::Success, t(1), false);
        let tr = apply_outcome(&mut r, &ProbeOutcome::Failure("x".into()), t(2), false);
        assert_eq!(tr, Transition::BecameUnhealthy);
        let tr = apply_outcome(&mut r, &ProbeOutcome::Failure("x".into()), t(3), false);
        assert_eq!(tr, Transition::Unchanged);
        assert_eq!(r.consecutive_failures, 2);
    }

    #[test]
    fn grace_period_suppresses_failures() {
        let mut r = result();
        let tr = apply_outcome(&mut r, &ProbeOutcome::Failure("x".into()), t(1), true);
        assert_eq!(tr, Transition::Unchanged);
        assert_eq!(r.consecutive_failures, 0);
        assert!(r.last_failure.is_none());
    }

    #[test]
    fn ignored_outcome_keeps_the_streak() {
        let mut r = result();
        apply_outcome(&mut r, &ProbeOutcome::Failure("x".into()), t(1), false);
        let before = r.clone();
        let tr = apply_outcome(&mut r, &ProbeOutcome::Ignored, t(2), false);
        assert_eq!(tr, Transition::Unchanged);
        assert_eq!(r, before, "1xx neither fails nor resets");
    }

    #[test]
    fn grace_ends_on_first_success() {
        use flotilla_master::TaskState;

        let spec = HealthCheckSpec::http("/health");
        let task = Task {
            id: "web.1".to_string(),
            app_id: PathId::parse("/web").unwrap(),
            app_version: t(1),
            host: "node-1".to_string(),
            agent_id: "agent-1".to_string(),
            attributes: Default::default(),
            host_ports: vec![31_000],
            staged_at: t(0),
            started_at: Some(t(0)),
            status: TaskState::Running,
            health_results: Vec::new(),
        };

        let mut r = result();
        // Still inside the 15s grace window.
        assert!(in_grace_period(&spec, &task, &r, t(5_000)));

        apply_outcome(&mut r, &ProbeOutcome::Success, t(5_000), false);
        // First success ends the grace period immediately.
        assert!(!in_grace_period(&spec, &task, &r, t(6_000)));

        // Without a success, grace runs out on its own.
        let r2 = result();
        assert!(!in_grace_period(&spec, &task, &r2, t(16_000)));
    }
}
