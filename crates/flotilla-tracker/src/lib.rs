//! flotilla-tracker — the observed side of the world.
//!
//! The [`TaskTracker`] is the authoritative in-memory index of tasks
//! per app, mirrored to the `tasks` table of the state store on every
//! mutation. The scheduler loop is the only writer; deployment and
//! health code read through it.

pub mod repo;
pub mod task;
pub mod tracker;

pub use repo::TaskRepository;
pub use task::{HealthResult, Task, TaskId};
pub use tracker::TaskTracker;
