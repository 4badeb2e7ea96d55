//! flotilla-deploy — converging declared state onto the cluster.
//!
//! The planner diffs two group trees into a partially ordered sequence
//! of steps; the [`DeploymentManager`] drives a plan to completion
//! while holding advisory locks on every affected app. Steps run
//! sequentially, the actions inside a step concurrently.

pub mod artifacts;
pub mod error;
pub mod executor;
pub mod lock;
pub mod plan;
pub mod repo;

pub use artifacts::{ArtifactError, ArtifactResolver, NoopResolver};
pub use error::{DeployError, DeployResult};
pub use executor::{DeploymentConfig, DeploymentManager};
pub use lock::AppLockRegistry;
pub use plan::{plan, Action, DeploymentPlan, DeploymentStep};
pub use repo::DeploymentRepository;
