//! flotilla-health — decides whether tasks are alive.
//!
//! The [`HealthCheckManager`] keeps one checker per
//! `(app, version, check)` triple. HTTP and TCP checks probe from
//! here; COMMAND checks run on the agent and report back through task
//! status updates. Aggregated verdicts feed the deployment executor's
//! capacity math, and tasks failing too often are killed through the
//! driver.

pub mod checker;
pub mod manager;
pub mod probe;

pub use checker::Checker;
pub use manager::{HealthCounts, HealthCheckManager};
pub use probe::{http_probe, tcp_probe, ProbeOutcome};
