//! Observed task state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flotilla_core::{PathId, PathError, Timestamp};
use flotilla_master::TaskState;

/// Task id helpers. Ids embed the owning app so a bare status update
/// can be routed: `<safe_app_id>.<uuid>`. The safe path uses `_` as
/// separator and app segments never contain `_`, while the uuid never
/// contains `.`, so both directions are unambiguous.
pub struct TaskId;

impl TaskId {
    pub fn generate(app_id: &PathId) -> String {
        format!("{}.{}", app_id.safe_path(), Uuid::new_v4())
    }

    /// Recover the app id from a task id.
    pub fn app_id(task_id: &str) -> Result<PathId, PathError> {
        let safe = task_id.rsplit_once('.').map(|(head, _)| head).unwrap_or("");
        PathId::from_safe_path(safe)
    }
}

/// One health verdict for a task, as aggregated by the health manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    /// Index of the health check in the app definition.
    pub check_index: usize,
    pub alive: bool,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub first_success: Option<Timestamp>,
    #[serde(default)]
    pub last_success: Option<Timestamp>,
    #[serde(default)]
    pub last_failure: Option<Timestamp>,
}

impl HealthResult {
    pub fn unknown(check_index: usize) -> Self {
        Self {
            check_index,
            alive: false,
            consecutive_failures: 0,
            first_success: None,
            last_success: None,
            last_failure: None,
        }
    }

    /// Whether any probe has ever answered.
    pub fn is_known(&self) -> bool {
        self.first_success.is_some() || self.last_failure.is_some()
    }
}

/// A single observed instance of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub app_id: PathId,
    /// The definition version this task was launched from.
    pub app_version: Timestamp,
    pub host: String,
    pub agent_id: String,
    /// Agent attributes copied from the matched offer; constraint
    /// evaluation for later placements reads them back.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub host_ports: Vec<u32>,
    pub staged_at: Timestamp,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    pub status: TaskState,
    #[serde(default)]
    pub health_results: Vec<HealthResult>,
}

impl Task {
    pub fn is_running(&self) -> bool {
        self.status == TaskState::Running
    }

    pub fn is_staging(&self) -> bool {
        matches!(self.status, TaskState::Staging | TaskState::Starting)
    }

    /// Healthy means every recorded check is alive. A task with no
    /// recorded results is not (yet) healthy.
    pub fn is_healthy(&self) -> bool {
        !self.health_results.is_empty() && self.health_results.iter().all(|h| h.alive)
    }

    /// The value constraint fields see on this task: the host for
    /// `hostname`, an agent attribute otherwise.
    pub fn field_value(&self, field: &str) -> Option<String> {
        if field == "hostname" {
            return Some(self.host.clone());
        }
        self.attributes.get(field).cloned()
    }
}
