//! Task status updates from the master.

use serde::{Deserialize, Serialize};

use flotilla_core::Timestamp;

/// Lifecycle state reported for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
}

impl TaskState {
    /// Terminal states remove the task from the tracker.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Lost
                | TaskState::Error
        )
    }
}

/// One status update as received from the master, plus the `healthy`
/// bit piggy-backed by command health checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub healthy: Option<bool>,
    pub timestamp: Timestamp,
}

impl TaskStatus {
    pub fn new(task_id: &str, state: TaskState, timestamp: Timestamp) -> Self {
        Self {
            task_id: task_id.to_string(),
            state,
            message: None,
            healthy: None,
            timestamp,
        }
    }

    /// Whether this terminal update counts as a launch failure for
    /// backoff purposes: failed, errored, or killed while unhealthy.
    pub fn is_failure(&self) -> bool {
        match self.state {
            TaskState::Failed | TaskState::Error => true,
            TaskState::Killed => !self.healthy.unwrap_or(false),
            _ => false,
        }
    }
}
