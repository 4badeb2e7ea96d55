//! Launch descriptions handed to the master.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use flotilla_core::{Container, HealthCheckSpec, PathId, Timestamp};

use crate::offer::Resource;

/// Everything the master needs to start one task on an agent.
///
/// Command health checks ride along so the executor on the agent can
/// run them; HTTP and TCP checks are probed from the orchestrator and
/// are not part of the launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLaunch {
    pub task_id: String,
    pub app_id: PathId,
    pub app_version: Timestamp,
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub container: Option<Container>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Host ports allocated out of the offer, in declaration order.
    pub host_ports: Vec<u32>,
    /// The resources consumed from the offer, role tags intact.
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub command_health_check: Option<HealthCheckSpec>,
}
