//! The task tracker — authoritative map of observed tasks per app.
//!
//! Mutations go through the single write lock, which serializes them,
//! and are mirrored to the task repository before the in-memory state
//! changes. Reads snapshot under the read lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use flotilla_core::{Clock, PathId, Timestamp};
use flotilla_master::{TaskState, TaskStatus};
use flotilla_state::StateResult;

use crate::repo::TaskRepository;
use crate::task::{Task, TaskId};

/// In-memory index of tasks per app, mirrored to the store.
#[derive(Clone)]
pub struct TaskTracker {
    tasks: Arc<RwLock<HashMap<PathId, HashMap<String, Task>>>>,
    repo: TaskRepository,
    clock: Arc<dyn Clock>,
}

impl TaskTracker {
    pub fn new(repo: TaskRepository, clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            repo,
            clock,
        }
    }

    /// Load persisted tasks into memory, e.g. after leader failover.
    pub async fn recover(&self) -> StateResult<usize> {
        let persisted = self.repo.all()?;
        let count = persisted.len();
        let mut tasks = self.tasks.write().await;
        for task in persisted {
            tasks
                .entry(task.app_id.clone())
                .or_default()
                .insert(task.id.clone(), task);
        }
        debug!(count, "tracker recovered from store");
        Ok(count)
    }

    /// Record a freshly launched task (state `Staging`). Persisted
    /// before it becomes visible.
    pub async fn created(&self, task: Task) -> StateResult<()> {
        self.repo.store(&task)?;
        let mut tasks = self.tasks.write().await;
        tasks
            .entry(task.app_id.clone())
            .or_default()
            .insert(task.id.clone(), task);
        Ok(())
    }

    /// Promote a task to `Running` on its first running status.
    /// Returns the updated task, or `None` for unknown ids.
    pub async fn running(&self, status: &TaskStatus) -> StateResult<Option<Task>> {
        let app_id = match TaskId::app_id(&status.task_id) {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&app_id).and_then(|m| m.get_mut(&status.task_id)) else {
            return Ok(None);
        };
        if task.started_at.is_none() {
            task.started_at = Some(status.timestamp);
        }
        task.status = TaskState::Running;
        self.repo.store(task)?;
        Ok(Some(task.clone()))
    }

    /// Apply a non-terminal status mutation.
    pub async fn status_update(&self, status: &TaskStatus) -> StateResult<Option<Task>> {
        let app_id = match TaskId::app_id(&status.task_id) {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&app_id).and_then(|m| m.get_mut(&status.task_id)) else {
            return Ok(None);
        };
        task.status = status.state;
        self.repo.store(task)?;
        Ok(Some(task.clone()))
    }

    /// Remove a task on a terminal status. Returns the removed task.
    pub async fn terminated(&self, status: &TaskStatus) -> StateResult<Option<Task>> {
        let app_id = match TaskId::app_id(&status.task_id) {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        let mut tasks = self.tasks.write().await;
        let Some(app_tasks) = tasks.get_mut(&app_id) else {
            return Ok(None);
        };
        let removed = app_tasks.remove(&status.task_id);
        if removed.is_some() {
            self.repo.expunge(&app_id, &status.task_id)?;
            if app_tasks.is_empty() {
                tasks.remove(&app_id);
            }
        } else {
            warn!(task = %status.task_id, "terminal status for unknown task");
        }
        Ok(removed)
    }

    /// Attach the latest health verdicts to a task.
    pub async fn set_health_results(
        &self,
        app_id: &PathId,
        task_id: &str,
        results: Vec<crate::task::HealthResult>,
    ) -> StateResult<()> {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(app_id).and_then(|m| m.get_mut(task_id)) {
            task.health_results = results;
            self.repo.store(task)?;
        }
        Ok(())
    }

    /// Tasks still staging past the launch timeout; the scheduler
    /// kills these.
    pub async fn check_staged_tasks(&self, launch_timeout: Duration) -> Vec<Task> {
        let cutoff = self.clock.now().minus(launch_timeout);
        let tasks = self.tasks.read().await;
        tasks
            .values()
            .flat_map(|m| m.values())
            .filter(|t| t.is_staging() && t.staged_at <= cutoff)
            .cloned()
            .collect()
    }

    pub async fn get(&self, app_id: &PathId) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        tasks
            .get(app_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_task(&self, app_id: &PathId, task_id: &str) -> Option<Task> {
        let tasks = self.tasks.read().await;
        tasks.get(app_id).and_then(|m| m.get(task_id)).cloned()
    }

    pub async fn contains(&self, app_id: &PathId) -> bool {
        let tasks = self.tasks.read().await;
        tasks.get(app_id).is_some_and(|m| !m.is_empty())
    }

    pub async fn count(&self, app_id: &PathId) -> usize {
        let tasks = self.tasks.read().await;
        tasks.get(app_id).map(|m| m.len()).unwrap_or(0)
    }

    pub async fn app_ids(&self) -> Vec<PathId> {
        let tasks = self.tasks.read().await;
        tasks.keys().cloned().collect()
    }

    /// The app version a task was launched from.
    pub async fn get_version(&self, app_id: &PathId, task_id: &str) -> Option<Timestamp> {
        let tasks = self.tasks.read().await;
        tasks
            .get(app_id)
            .and_then(|m| m.get(task_id))
            .map(|t| t.app_version)
    }

    /// Every task across all apps.
    pub async fn all(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        tasks.values().flat_map(|m| m.values().cloned()).collect()
    }
}
