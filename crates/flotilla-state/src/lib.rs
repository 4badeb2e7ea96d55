//! flotilla-state — persistence for the orchestrator.
//!
//! A thin, linearizable key-value layout over redb:
//!
//! | table         | key                              | value                |
//! |---------------|----------------------------------|----------------------|
//! | `apps`        | `<safe-app-id>:<version-millis>` | `AppDefinition` JSON |
//! | `groups`      | `root`                           | `Group` JSON         |
//! | `deployments` | `<deployment-id>`                | plan JSON            |
//! | `tasks`       | `<safe-app-id>:<task-id>`        | task JSON            |
//! | `framework`   | `framework-id`                   | raw id bytes         |
//!
//! Everything is persist-before-act: deployments, task creations and
//! the framework id hit the store before the driver hears about them.

pub mod error;
pub mod repos;
pub mod retry;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use repos::{AppRepository, FrameworkIdRepository, GroupRepository};
pub use retry::with_retries;
pub use store::StateStore;
pub use tables::Table;
