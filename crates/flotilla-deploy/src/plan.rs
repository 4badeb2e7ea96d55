//! The deployment planner — diffing group trees into ordered steps.
//!
//! Apps are classified Start / Stop / Restart / Scale by comparing the
//! original and target trees. Affected apps are topologically sorted
//! into generations along their (resolved) dependencies; each
//! generation emits one step per action kind. Stops come last, in
//! reverse dependency order, so nothing loses a dependency while it is
//! still running.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use flotilla_core::{AppDefinition, Group, PathId, Timestamp};

use crate::error::{DeployError, DeployResult};

/// One unit of work inside a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    StartApplication { app: AppDefinition },
    StopApplication { app: AppDefinition },
    ScaleApplication { app: AppDefinition, to: u32 },
    RestartApplication { app: AppDefinition },
    ResolveArtifacts { app_id: PathId, urls: Vec<String> },
}

impl Action {
    pub fn app_id(&self) -> &PathId {
        match self {
            Action::StartApplication { app }
            | Action::StopApplication { app }
            | Action::ScaleApplication { app, .. }
            | Action::RestartApplication { app } => &app.id,
            Action::ResolveArtifacts { app_id, .. } => app_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::StartApplication { .. } => "start",
            Action::StopApplication { .. } => "stop",
            Action::ScaleApplication { .. } => "scale",
            Action::RestartApplication { .. } => "restart",
            Action::ResolveArtifacts { .. } => "resolve_artifacts",
        }
    }
}

/// Actions that may run in parallel. Steps run in sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub actions: Vec<Action>,
}

/// A computed deployment converging `original` onto `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: String,
    pub version: Timestamp,
    pub original: Group,
    pub target: Group,
    pub steps: Vec<DeploymentStep>,
}

impl DeploymentPlan {
    /// Ids of every app any action touches.
    pub fn affected_app_ids(&self) -> Vec<PathId> {
        let mut ids: Vec<PathId> = self
            .steps
            .iter()
            .flat_map(|s| s.actions.iter().map(|a| a.app_id().clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Start,
    Stop,
    Scale,
    Restart,
}

/// Diff `original` against `target` and emit an ordered plan.
pub fn plan(original: &Group, target: &Group, version: Timestamp) -> DeployResult<DeploymentPlan> {
    let original_apps: HashMap<PathId, &AppDefinition> = original
        .transitive_apps()
        .into_iter()
        .map(|a| (a.id.clone(), a))
        .collect();
    let target_apps: HashMap<PathId, &AppDefinition> = target
        .transitive_apps()
        .into_iter()
        .map(|a| (a.id.clone(), a))
        .collect();

    // Classification.
    let mut kinds: HashMap<PathId, Kind> = HashMap::new();
    for (id, app) in &target_apps {
        match original_apps.get(id) {
            None => {
                kinds.insert(id.clone(), Kind::Start);
            }
            Some(old) if old.is_upgrade(app) => {
                kinds.insert(id.clone(), Kind::Restart);
            }
            Some(old) if old.instances != app.instances => {
                kinds.insert(id.clone(), Kind::Scale);
            }
            Some(_) => {}
        }
    }
    for id in original_apps.keys() {
        if !target_apps.contains_key(id) {
            kinds.insert(id.clone(), Kind::Stop);
        }
    }

    // Dependency edges among affected apps. A dependency on a group
    // expands to that group's transitive apps.
    let affected: Vec<PathId> = {
        let mut ids: Vec<PathId> = kinds.keys().cloned().collect();
        ids.sort();
        ids
    };
    let mut edges: HashMap<PathId, Vec<PathId>> = HashMap::new();
    for id in &affected {
        let tree = if kinds[id] == Kind::Stop { original } else { target };
        let mut deps = Vec::new();
        for dep in tree
            .resolved_dependencies(id)
            .map_err(DeployError::ValidationFailed)?
        {
            if let Some(group) = tree.find_group(&dep) {
                for app in group.transitive_apps() {
                    if kinds.contains_key(&app.id) && &app.id != id {
                        deps.push(app.id.clone());
                    }
                }
            } else if kinds.contains_key(&dep) && &dep != id {
                deps.push(dep);
            }
        }
        deps.sort();
        deps.dedup();
        edges.insert(id.clone(), deps);
    }

    // Generations: an app sits one past its deepest dependency.
    let generations = assign_generations(&affected, &edges)?;
    let generation_count = generations.values().copied().max().map_or(0, |g| g + 1);

    // Leading artifact-resolution step for apps about to (re)start.
    let mut steps = Vec::new();
    let mut artifact_actions = Vec::new();
    for id in &affected {
        if matches!(kinds[id], Kind::Start | Kind::Restart) {
            let app = target_apps[id];
            if !app.store_urls.is_empty() {
                artifact_actions.push(Action::ResolveArtifacts {
                    app_id: id.clone(),
                    urls: app.store_urls.clone(),
                });
            }
        }
    }
    if !artifact_actions.is_empty() {
        steps.push(DeploymentStep {
            actions: artifact_actions,
        });
    }

    // Start, then Scale, then Restart per generation; Stops last in
    // reverse dependency order.
    for generation in 0..generation_count {
        for (kind, make) in [
            (Kind::Start, make_start as fn(&AppDefinition) -> Action),
            (Kind::Scale, make_scale),
            (Kind::Restart, make_restart),
        ] {
            let actions: Vec<Action> = affected
                .iter()
                .filter(|id| kinds[*id] == kind && generations[*id] == generation)
                .map(|id| make(target_apps[id]))
                .collect();
            if !actions.is_empty() {
                steps.push(DeploymentStep { actions });
            }
        }
    }
    for generation in (0..generation_count).rev() {
        let actions: Vec<Action> = affected
            .iter()
            .filter(|id| kinds[*id] == Kind::Stop && generations[*id] == generation)
            .map(|id| Action::StopApplication {
                app: original_apps[id].clone(),
            })
            .collect();
        if !actions.is_empty() {
            steps.push(DeploymentStep { actions });
        }
    }

    let plan = DeploymentPlan {
        id: Uuid::new_v4().to_string(),
        version,
        original: original.clone(),
        target: target.clone(),
        steps,
    };
    debug!(
        deployment = %plan.id,
        steps = plan.steps.len(),
        affected = plan.affected_app_ids().len(),
        "deployment planned"
    );
    Ok(plan)
}

fn make_start(app: &AppDefinition) -> Action {
    Action::StartApplication { app: app.clone() }
}

fn make_scale(app: &AppDefinition) -> Action {
    Action::ScaleApplication {
        app: app.clone(),
        to: app.instances,
    }
}

fn make_restart(app: &AppDefinition) -> Action {
    Action::RestartApplication { app: app.clone() }
}

/// Longest-path layering over the dependency DAG. Cycles are fatal.
fn assign_generations(
    affected: &[PathId],
    edges: &HashMap<PathId, Vec<PathId>>,
) -> DeployResult<HashMap<PathId, usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done(usize),
    }

    fn visit(
        id: &PathId,
        edges: &HashMap<PathId, Vec<PathId>>,
        marks: &mut HashMap<PathId, Mark>,
    ) -> DeployResult<usize> {
        match marks.get(id) {
            Some(Mark::Done(g)) => return Ok(*g),
            Some(Mark::Visiting) => {
                return Err(DeployError::ValidationFailed(
                    flotilla_core::ValidationError(format!("dependency cycle through {id}")),
                ))
            }
            None => {}
        }
        marks.insert(id.clone(), Mark::Visiting);
        let mut generation = 0;
        if let Some(deps) = edges.get(id) {
            for dep in deps {
                generation = generation.max(visit(dep, edges, marks)? + 1);
            }
        }
        marks.insert(id.clone(), Mark::Done(generation));
        Ok(generation)
    }

    let mut marks = HashMap::new();
    let mut out = HashMap::new();
    for id in affected {
        let generation = visit(id, edges, &mut marks)?;
        out.insert(id.clone(), generation);
    }
    Ok(out)
}
