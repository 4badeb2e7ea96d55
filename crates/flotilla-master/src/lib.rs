//! flotilla-master — what the orchestrator and the resource master
//! exchange.
//!
//! The wire transport itself is out of scope; this crate defines the
//! in-memory shapes — offers with role-tagged resources, task status
//! updates, launch descriptions — plus the resource arithmetic used by
//! the offer matcher and the [`SchedulerDriver`] trait the rest of the
//! workspace talks through.

pub mod arithmetic;
pub mod driver;
pub mod launch;
pub mod offer;
pub mod status;

pub use arithmetic::consume;
pub use driver::{DriverError, DriverResult, SchedulerDriver};
pub use launch::TaskLaunch;
pub use offer::{Offer, Resource, ResourceValue, ValueRange};
pub use status::{TaskState, TaskStatus};
