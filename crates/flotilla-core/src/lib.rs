//! flotilla-core — the declared-state model of the orchestrator.
//!
//! Everything the rest of the workspace agrees on lives here:
//!
//! - [`PathId`] hierarchical identifiers and relative-path resolution
//! - [`Timestamp`] version instants plus the injectable [`Clock`]
//! - [`AppDefinition`] and [`Group`] — the declared state tree
//! - [`HealthCheckSpec`] — per-app health probe declarations
//! - service-port assignment over a group tree
//! - the [`Event`] taxonomy published on the [`EventBus`]
//!
//! Nothing in this crate performs I/O beyond reading the system clock.

pub mod app;
pub mod clock;
pub mod event;
pub mod group;
pub mod health;
pub mod path;
pub mod ports;

pub use app::{
    AppDefinition, Constraint, ConstraintOp, Container, ContainerEngine, PortMapping,
    UpgradeStrategy, ValidationError, Volume,
};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use event::{Event, EventBus};
pub use group::Group;
pub use health::{HealthCheckProtocol, HealthCheckSpec};
pub use path::{PathError, PathId};
pub use ports::{assign_service_ports, PortError, ServicePortRange};
