//! The offer matcher.
//!
//! For each offer the queue is walked in priority order (oldest app
//! version first, then FIFO). Apps in launch backoff are skipped.
//! Every successful match deducts its resources from the offer and
//! matching continues against the residual, so one large offer can
//! carry several launches.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::debug;

use flotilla_core::{AppDefinition, Clock, HealthCheckSpec};
use flotilla_master::{consume, Offer, Resource, TaskLaunch, TaskState, ValueRange};
use flotilla_queue::{LaunchQueue, RateLimiter};
use flotilla_tracker::{Task, TaskId, TaskTracker};

use crate::constraints::meets_constraints;

/// Matcher tunables.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Roles apps without `accepted_resource_roles` may consume.
    pub default_accepted_roles: BTreeSet<String>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            default_accepted_roles: BTreeSet::from(["*".to_string()]),
        }
    }
}

/// One matched launch: the tracker-side task and the wire-side launch
/// description. Both refer to the same task id.
#[derive(Debug, Clone)]
pub struct MatchedLaunch {
    pub task: Task,
    pub info: TaskLaunch,
}

/// Matches queued launches against offers.
#[derive(Clone)]
pub struct OfferMatcher {
    queue: LaunchQueue,
    tracker: TaskTracker,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    config: MatcherConfig,
}

impl OfferMatcher {
    pub fn new(
        queue: LaunchQueue,
        tracker: TaskTracker,
        limiter: RateLimiter,
        clock: Arc<dyn Clock>,
        config: MatcherConfig,
    ) -> Self {
        Self {
            queue,
            tracker,
            limiter,
            clock,
            config,
        }
    }

    /// Produce as many launches as the offer can carry.
    pub async fn match_offer(&self, offer: &Offer) -> Vec<MatchedLaunch> {
        let mut launches: Vec<MatchedLaunch> = Vec::new();
        let mut remaining: Vec<Resource> = offer.resources.clone();

        let mut entries = self.queue.list().await;
        entries.sort_by(|a, b| {
            a.app
                .version
                .cmp(&b.app.version)
                .then(a.launch_by.cmp(&b.launch_by))
        });

        for entry in entries {
            let app = &entry.app;
            if self.limiter.has_time_left(&app.id, app.version).await {
                debug!(app = %app.id, "skipping launch, backoff active");
                continue;
            }

            // Placed tasks include the ones matched earlier in this
            // very offer.
            let mut placed = self.tracker.get(&app.id).await;
            placed.extend(
                launches
                    .iter()
                    .filter(|l| l.task.app_id == app.id)
                    .map(|l| l.task.clone()),
            );

            let Some((matched, used)) = self.try_match(app, offer, &remaining, &placed) else {
                continue;
            };
            // Commit: consume the queue entry and the resources.
            if self
                .queue
                .poll_matching(&app.id, app.version)
                .await
                .is_none()
            {
                continue;
            }
            remaining = consume(&remaining, &used);
            debug!(
                app = %app.id,
                task = %matched.task.id,
                host = %offer.hostname,
                "launch matched"
            );
            launches.push(matched);
        }
        launches
    }

    fn try_match(
        &self,
        app: &AppDefinition,
        offer: &Offer,
        remaining: &[Resource],
        placed: &[Task],
    ) -> Option<(MatchedLaunch, Vec<Resource>)> {
        let roles = app
            .accepted_resource_roles
            .clone()
            .unwrap_or_else(|| self.config.default_accepted_roles.clone());

        if !meets_constraints(app, offer, placed) {
            return None;
        }

        let mut used: Vec<Resource> = Vec::new();

        // Scalars, greedily across accepted roles.
        for (name, need) in [("cpus", app.cpus), ("mem", app.mem), ("disk", app.disk)] {
            if need <= 0.0 {
                continue;
            }
            let mut left = need;
            for resource in remaining
                .iter()
                .filter(|r| r.name == name && roles.contains(&r.role))
            {
                if left <= 1e-9 {
                    break;
                }
                let take = resource.scalar_value().min(left);
                if take > 0.0 {
                    used.push(Resource::scalar(name, &resource.role, take));
                    left -= take;
                }
            }
            if left > 1e-9 {
                debug!(app = %app.id, resource = name, missing = left, "offer too small");
                return None;
            }
        }

        // Host ports: literals must be offered, zeros take anything.
        let wanted = app.required_host_ports();
        let available: Vec<(String, ValueRange)> = remaining
            .iter()
            .filter(|r| roles.contains(&r.role))
            .flat_map(|r| {
                let mut ranges = Vec::new();
                if r.name == "ports" {
                    if let flotilla_master::ResourceValue::Ranges { ranges: rs } = &r.value {
                        for range in rs {
                            ranges.push((r.role.clone(), *range));
                        }
                    }
                }
                ranges
            })
            .collect();

        let mut allocated: Vec<(String, u32)> = Vec::with_capacity(wanted.len());
        let mut in_use: HashSet<u32> = HashSet::new();
        for &port in &wanted {
            let pick = if port != 0 {
                available
                    .iter()
                    .find(|(_, range)| range.contains(port as u64))
                    .filter(|_| !in_use.contains(&port))
                    .map(|(role, _)| (role.clone(), port))
            } else {
                pick_any_port(&available, &in_use)
            };
            let (role, port) = pick?;
            in_use.insert(port);
            allocated.push((role, port));
        }
        for (role, port) in &allocated {
            used.push(Resource::ranges(
                "ports",
                role,
                vec![ValueRange::new(*port as u64, *port as u64)],
            ));
        }

        let host_ports: Vec<u32> = allocated.iter().map(|(_, p)| *p).collect();
        let task_id = TaskId::generate(&app.id);
        let now = self.clock.now();

        let task = Task {
            id: task_id.clone(),
            app_id: app.id.clone(),
            app_version: app.version,
            host: offer.hostname.clone(),
            agent_id: offer.agent_id.clone(),
            attributes: offer.attributes.clone(),
            host_ports: host_ports.clone(),
            staged_at: now,
            started_at: None,
            status: TaskState::Staging,
            health_results: Vec::new(),
        };
        let info = TaskLaunch {
            task_id,
            app_id: app.id.clone(),
            app_version: app.version,
            agent_id: offer.agent_id.clone(),
            hostname: offer.hostname.clone(),
            cmd: app.cmd.clone(),
            args: app.args.clone(),
            container: app.container.clone(),
            env: app.env.clone(),
            host_ports,
            resources: used.clone(),
            command_health_check: command_check(app),
        };
        Some((MatchedLaunch { task, info }, used))
    }
}

/// Command checks ride on the launch; HTTP and TCP are probed from the
/// orchestrator and stay out of the task description.
fn command_check(app: &AppDefinition) -> Option<HealthCheckSpec> {
    app.health_checks.iter().find(|c| c.is_command()).cloned()
}

fn pick_any_port(
    available: &[(String, ValueRange)],
    in_use: &HashSet<u32>,
) -> Option<(String, u32)> {
    for (role, range) in available {
        let mut port = range.begin;
        while port <= range.end {
            let candidate = port as u32;
            if !in_use.contains(&candidate) {
                return Some((role.clone(), candidate));
            }
            port += 1;
        }
    }
    None
}

/// Queued launches whose app id or version is no longer current are
/// dropped before matching; the scheduler loop calls this on every
/// offer round.
pub fn is_current(app: &AppDefinition, current: Option<&AppDefinition>) -> bool {
    current.is_some_and(|c| c.version == app.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use flotilla_core::{Constraint, ConstraintOp, ManualClock, PathId, Timestamp};
    use flotilla_state::StateStore;
    use flotilla_tracker::TaskRepository;

    struct Fixture {
        matcher: OfferMatcher,
        queue: LaunchQueue,
        tracker: TaskTracker,
        limiter: RateLimiter,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(Timestamp::from_millis(1_000_000));
        let tracker = TaskTracker::new(TaskRepository::new(store), clock.clone());
        let queue = LaunchQueue::new();
        let limiter = RateLimiter::new(clock.clone());
        let matcher = OfferMatcher::new(
            queue.clone(),
            tracker.clone(),
            limiter.clone(),
            clock.clone(),
            MatcherConfig::default(),
        );
        Fixture {
            matcher,
            queue,
            tracker,
            limiter,
            clock,
        }
    }

    fn app(id: &str) -> AppDefinition {
        let mut app = AppDefinition::new(PathId::parse(id).unwrap());
        app.cmd = Some("serve".to_string());
        app.cpus = 1.0;
        app.mem = 128.0;
        app.version = Timestamp::from_millis(5);
        app
    }

    fn offer(cpus: f64, mem: f64, ports: Vec<ValueRange>) -> Offer {
        Offer {
            id: "offer-1".to_string(),
            agent_id: "agent-1".to_string(),
            hostname: "node-1".to_string(),
            attributes: BTreeMap::new(),
            resources: vec![
                Resource::scalar("cpus", "*", cpus),
                Resource::scalar("mem", "*", mem),
                Resource::ranges("ports", "*", ports),
            ],
        }
    }

    #[tokio::test]
    async fn matches_a_simple_app() {
        let fx = fixture();
        let mut a = app("/web");
        a.ports = vec![0, 0];
        fx.queue.add(&a, 1, fx.clock.now()).await;

        let launches = fx
            .matcher
            .match_offer(&offer(4.0, 1024.0, vec![ValueRange::new(31_000, 31_009)]))
            .await;

        assert_eq!(launches.len(), 1);
        let launch = &launches[0];
        assert_eq!(launch.task.host_ports, vec![31_000, 31_001]);
        assert_eq!(launch.info.host_ports, launch.task.host_ports);
        assert_eq!(launch.task.status, TaskState::Staging);
        assert!(fx.queue.is_empty().await, "entry consumed");
        assert_eq!(TaskId::app_id(&launch.task.id).unwrap(), a.id);
    }

    #[tokio::test]
    async fn insufficient_resources_match_nothing() {
        let fx = fixture();
        let a = app("/web");
        fx.queue.add(&a, 1, fx.clock.now()).await;

        let launches = fx.matcher.match_offer(&offer(0.5, 1024.0, vec![])).await;
        assert!(launches.is_empty());
        assert_eq!(fx.queue.len().await, 1, "entry stays queued");
    }

    #[tokio::test]
    async fn one_offer_carries_several_launches() {
        let fx = fixture();
        let a = app("/web");
        fx.queue.add(&a, 3, fx.clock.now()).await;

        // Room for exactly two.
        let launches = fx.matcher.match_offer(&offer(2.0, 4096.0, vec![])).await;
        assert_eq!(launches.len(), 2);
        assert_eq!(fx.queue.len().await, 1);
    }

    #[tokio::test]
    async fn backoff_delays_are_respected() {
        let fx = fixture();
        let mut a = app("/web");
        a.backoff_seconds = 30;
        fx.queue.add(&a, 1, fx.clock.now()).await;
        fx.limiter.add_delay(&a).await;

        assert!(fx.matcher.match_offer(&offer(4.0, 1024.0, vec![])).await.is_empty());

        fx.clock.advance(Duration::from_secs(31));
        assert_eq!(fx.matcher.match_offer(&offer(4.0, 1024.0, vec![])).await.len(), 1);
    }

    #[tokio::test]
    async fn required_literal_ports_must_be_offered() {
        let fx = fixture();
        let mut a = app("/web");
        a.ports = vec![8_080];
        a.require_ports = true;
        fx.queue.add(&a, 1, fx.clock.now()).await;

        let miss = fx
            .matcher
            .match_offer(&offer(4.0, 1024.0, vec![ValueRange::new(31_000, 31_009)]))
            .await;
        assert!(miss.is_empty());

        let hit = fx
            .matcher
            .match_offer(&offer(4.0, 1024.0, vec![ValueRange::new(8_000, 9_000)]))
            .await;
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].task.host_ports, vec![8_080]);
    }

    #[tokio::test]
    async fn service_port_labels_do_not_bind_host_ports() {
        let fx = fixture();
        let mut a = app("/web");
        a.ports = vec![8_080];
        a.require_ports = false;
        fx.queue.add(&a, 1, fx.clock.now()).await;

        let launches = fx
            .matcher
            .match_offer(&offer(4.0, 1024.0, vec![ValueRange::new(31_000, 31_009)]))
            .await;
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].task.host_ports, vec![31_000]);
    }

    #[tokio::test]
    async fn accepted_roles_filter_resources() {
        let fx = fixture();
        let mut a = app("/web");
        a.accepted_resource_roles = Some(BTreeSet::from(["prod".to_string()]));
        fx.queue.add(&a, 1, fx.clock.now()).await;

        // Only "*" resources: nothing for a prod-only app.
        assert!(fx.matcher.match_offer(&offer(4.0, 1024.0, vec![])).await.is_empty());

        let mut prod_offer = offer(0.0, 0.0, vec![]);
        prod_offer.resources = vec![
            Resource::scalar("cpus", "prod", 2.0),
            Resource::scalar("mem", "prod", 512.0),
        ];
        let launches = fx.matcher.match_offer(&prod_offer).await;
        assert_eq!(launches.len(), 1);
        assert!(launches[0].info.resources.iter().all(|r| r.role == "prod"));
    }

    #[tokio::test]
    async fn unique_constraint_limits_one_per_host() {
        let fx = fixture();
        let mut a = app("/web");
        a.constraints = vec![Constraint {
            field: "hostname".to_string(),
            op: ConstraintOp::Unique,
            value: None,
        }];
        fx.queue.add(&a, 2, fx.clock.now()).await;

        // Both entries target the same host; only one may land.
        let launches = fx.matcher.match_offer(&offer(8.0, 8192.0, vec![])).await;
        assert_eq!(launches.len(), 1);
        assert_eq!(fx.queue.len().await, 1);
    }

    #[tokio::test]
    async fn placed_tasks_block_unique_hosts_across_offers() {
        let fx = fixture();
        let mut a = app("/web");
        a.constraints = vec![Constraint {
            field: "hostname".to_string(),
            op: ConstraintOp::Unique,
            value: None,
        }];
        fx.queue.add(&a, 1, fx.clock.now()).await;

        let first = fx.matcher.match_offer(&offer(8.0, 8192.0, vec![])).await;
        fx.tracker.created(first[0].task.clone()).await.unwrap();

        fx.queue.add(&a, 1, fx.clock.now()).await;
        let second = fx.matcher.match_offer(&offer(8.0, 8192.0, vec![])).await;
        assert!(second.is_empty(), "node-1 already hosts this app");
    }

    #[tokio::test]
    async fn oldest_version_matches_first() {
        let fx = fixture();
        let mut v2 = app("/web");
        v2.version = Timestamp::from_millis(10);
        let v1 = app("/web");
        fx.queue.add(&v2, 1, fx.clock.now()).await;
        fx.queue.add(&v1, 1, fx.clock.now()).await;

        // Offer fits exactly one task.
        let launches = fx.matcher.match_offer(&offer(1.0, 128.0, vec![])).await;
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].task.app_version, v1.version);
    }

    #[tokio::test]
    async fn command_checks_ride_on_the_launch() {
        use flotilla_core::{HealthCheckProtocol, HealthCheckSpec};

        let fx = fixture();
        let mut a = app("/web");
        a.health_checks = vec![
            HealthCheckSpec::http("/ping"),
            HealthCheckSpec {
                protocol: HealthCheckProtocol::Command {
                    value: "check.sh".to_string(),
                },
                ..HealthCheckSpec::http("/")
            },
        ];
        fx.queue.add(&a, 1, fx.clock.now()).await;

        let launches = fx.matcher.match_offer(&offer(4.0, 1024.0, vec![])).await;
        let check = launches[0].info.command_health_check.as_ref().unwrap();
        assert!(check.is_command());
    }
}
