//! The driver — the orchestrator's handle on the resource master.
//!
//! Calls are commands, not queries: the master answers asynchronously
//! through status updates and new offers. Implementations wrap the
//! actual wire transport; tests use an in-memory recorder.

use thiserror::Error;

use crate::launch::TaskLaunch;
use crate::status::TaskStatus;

/// Driver failures. A failed driver is fatal to the scheduler, which
/// abdicates leadership rather than run split-brained.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver error: {0}")]
    Failed(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Outbound interface to the resource master.
pub trait SchedulerDriver: Send + Sync {
    /// Launch tasks against a (possibly partially consumed) offer.
    fn launch_tasks(&self, offer_id: &str, tasks: Vec<TaskLaunch>) -> DriverResult<()>;

    fn kill_task(&self, task_id: &str) -> DriverResult<()>;

    fn decline_offer(&self, offer_id: &str) -> DriverResult<()>;

    /// Ask the master to resume sending offers after a quiet period.
    fn revive_offers(&self) -> DriverResult<()>;

    /// Ask the master to re-send the current state of the given tasks.
    /// An empty list requests the master's full view.
    fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> DriverResult<()>;
}
