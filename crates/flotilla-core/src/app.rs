//! App definitions — the declared state of one replicated service.
//!
//! An `AppDefinition` is immutable once versioned: updates produce a
//! new definition under a newer [`Timestamp`] and the deployment
//! machinery converges running tasks toward it.

use std::collections::{BTreeSet, HashMap};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Timestamp;
use crate::health::HealthCheckSpec;
use crate::path::PathId;

/// Validation failure over a declared app or group.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("validation failed: {0}")]
pub struct ValidationError(pub String);

/// Container engine kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerEngine {
    Docker,
    /// The cluster's built-in containerizer.
    Native,
}

/// A host-path volume mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub container_path: String,
    pub host_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// A container port exposed on the host.
///
/// `host_port = 0` asks the offer matcher to pick any offered port.
/// `service_port = 0` asks the group submission path to assign a
/// cluster-wide service port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u32,
    #[serde(default)]
    pub host_port: u32,
    #[serde(default)]
    pub service_port: u32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Container runtime description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub engine: ContainerEngine,
    pub image: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub parameters: Vec<(String, String)>,
}

/// Placement constraint operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintOp {
    Unique,
    Cluster,
    GroupBy,
    Like,
    Unlike,
}

/// A placement constraint `(field, op, value?)` evaluated against an
/// offer and the app's already-placed tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub field: String,
    pub op: ConstraintOp,
    #[serde(default)]
    pub value: Option<String>,
}

/// Bounds on how far a rolling restart may dip below or overshoot the
/// desired instance count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    pub minimum_health_capacity: f64,
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 1.0,
        }
    }
}

/// Declared specification for one replicated long-running service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub id: PathId,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub container: Option<Container>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub instances: u32,
    pub cpus: f64,
    pub mem: f64,
    #[serde(default)]
    pub disk: f64,
    /// Declared service ports; `0` means "assign dynamically".
    #[serde(default)]
    pub ports: Vec<u32>,
    /// When set, non-zero `ports` entries must be present in the offer
    /// as host ports. Otherwise they are service-port labels only.
    #[serde(default)]
    pub require_ports: bool,
    /// Assigned service ports, same length as `ports` once a group
    /// submission has run. Never contains zeros after assignment.
    #[serde(default)]
    pub service_ports: Vec<u32>,
    #[serde(default)]
    pub accepted_resource_roles: Option<BTreeSet<String>>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub health_checks: Vec<HealthCheckSpec>,
    /// Artifact URLs fetched to the shared store before launch.
    #[serde(default)]
    pub store_urls: Vec<String>,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_launch_delay")]
    pub max_launch_delay_seconds: u64,
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,
    /// Ids of apps or groups that must be deployed before this app,
    /// absolute or relative to the enclosing group.
    #[serde(default)]
    pub dependencies: Vec<PathId>,
    pub version: Timestamp,
}

fn default_backoff_seconds() -> u64 {
    1
}

fn default_backoff_factor() -> f64 {
    1.15
}

fn default_max_launch_delay() -> u64 {
    3600
}

impl AppDefinition {
    /// A minimal runnable app, mostly for tests and builders.
    pub fn new(id: PathId) -> Self {
        Self {
            id,
            cmd: None,
            args: None,
            container: None,
            env: HashMap::new(),
            instances: 1,
            cpus: 1.0,
            mem: 128.0,
            disk: 0.0,
            ports: Vec::new(),
            require_ports: false,
            service_ports: Vec::new(),
            accepted_resource_roles: None,
            constraints: Vec::new(),
            health_checks: Vec::new(),
            store_urls: Vec::new(),
            backoff_seconds: default_backoff_seconds(),
            backoff_factor: default_backoff_factor(),
            max_launch_delay_seconds: default_max_launch_delay(),
            upgrade_strategy: UpgradeStrategy::default(),
            dependencies: Vec::new(),
            version: Timestamp::ZERO,
        }
    }

    /// Validate the declared fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let has_cmd = self.cmd.as_deref().is_some_and(|c| !c.trim().is_empty());
        let has_args = self.args.as_ref().is_some_and(|a| !a.is_empty());
        let has_image = self
            .container
            .as_ref()
            .is_some_and(|c| !c.image.trim().is_empty());
        if has_cmd && has_args {
            return Err(ValidationError(format!(
                "app {}: 'cmd' and 'args' are mutually exclusive",
                self.id
            )));
        }
        if !has_cmd && !has_args && !has_image {
            return Err(ValidationError(format!(
                "app {}: must either contain one of 'cmd' or 'args', and/or a 'container'",
                self.id
            )));
        }
        if self.cpus < 0.0 || self.mem < 0.0 || self.disk < 0.0 {
            return Err(ValidationError(format!(
                "app {}: resources must be non-negative",
                self.id
            )));
        }
        let strategy = &self.upgrade_strategy;
        if !(0.0..=1.0).contains(&strategy.minimum_health_capacity)
            || !(0.0..=1.0).contains(&strategy.maximum_over_capacity)
        {
            return Err(ValidationError(format!(
                "app {}: upgrade strategy capacities must lie in [0, 1]",
                self.id
            )));
        }
        if self.backoff_factor < 1.0 {
            return Err(ValidationError(format!(
                "app {}: backoff factor must be >= 1.0",
                self.id
            )));
        }
        for constraint in &self.constraints {
            if matches!(constraint.op, ConstraintOp::Like | ConstraintOp::Unlike) {
                let pattern = constraint.value.as_deref().unwrap_or("");
                if Regex::new(pattern).is_err() {
                    return Err(ValidationError(format!(
                        "app {}: constraint regex {:?} does not compile",
                        self.id, pattern
                    )));
                }
            }
        }
        for check in &self.health_checks {
            if !check.is_command() && check.port_index >= self.host_port_count().max(1) {
                return Err(ValidationError(format!(
                    "app {}: health check port index {} out of range",
                    self.id, check.port_index
                )));
            }
        }
        Ok(())
    }

    /// Host ports this app needs from an offer, `0` meaning "any".
    pub fn required_host_ports(&self) -> Vec<u32> {
        if let Some(container) = &self.container {
            if !container.port_mappings.is_empty() {
                return container.port_mappings.iter().map(|m| m.host_port).collect();
            }
        }
        if self.require_ports {
            self.ports.clone()
        } else {
            vec![0; self.ports.len()]
        }
    }

    fn host_port_count(&self) -> usize {
        self.required_host_ports().len()
    }

    /// Declared service-port slots: container mapping `service_port`s
    /// when mappings exist, the `ports` list otherwise.
    pub fn declared_service_ports(&self) -> Vec<u32> {
        if let Some(container) = &self.container {
            if !container.port_mappings.is_empty() {
                return container.port_mappings.iter().map(|m| m.service_port).collect();
            }
        }
        self.ports.clone()
    }

    /// Assigned service ports after group submission.
    pub fn assigned_service_ports(&self) -> Vec<u32> {
        if let Some(container) = &self.container {
            if !container.port_mappings.is_empty() {
                return container.port_mappings.iter().map(|m| m.service_port).collect();
            }
        }
        self.service_ports.clone()
    }

    /// Write assigned service ports back into the definition.
    pub fn with_assigned_service_ports(mut self, assigned: Vec<u32>) -> Self {
        if let Some(container) = &mut self.container {
            if !container.port_mappings.is_empty() {
                for (mapping, port) in container.port_mappings.iter_mut().zip(assigned) {
                    mapping.service_port = port;
                }
                return self;
            }
        }
        self.service_ports = assigned;
        self
    }

    /// Canonical form for change detection: version, instance count
    /// and service-port assignments are masked out. Service ports are
    /// routing labels, never task properties, so changing them must
    /// not restart tasks.
    pub fn comparable(&self) -> AppDefinition {
        let mut app = self.clone();
        app.version = Timestamp::ZERO;
        app.instances = 0;
        app.service_ports = Vec::new();
        if !app.require_ports {
            // Without require_ports the declared ports are labels only.
            app.ports = app.ports.iter().map(|_| 0).collect();
        }
        if let Some(container) = &mut app.container {
            for mapping in &mut container.port_mappings {
                mapping.service_port = 0;
            }
        }
        app
    }

    /// Whether converging from `self` to `to` requires replacing
    /// running tasks (anything but a pure scale changed).
    pub fn is_upgrade(&self, to: &AppDefinition) -> bool {
        self.comparable() != to.comparable()
    }

    /// Whether `to` only changes the instance count.
    pub fn is_only_scale_change(&self, to: &AppDefinition) -> bool {
        !self.is_upgrade(to) && self.instances != to.instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthCheckProtocol;

    fn app(id: &str) -> AppDefinition {
        let mut app = AppDefinition::new(PathId::parse(id).unwrap());
        app.cmd = Some("sleep 3600".to_string());
        app
    }

    #[test]
    fn validates_cmd_args_container_rule() {
        let mut a = app("/a");
        assert!(a.validate().is_ok());

        a.cmd = None;
        assert!(a.validate().is_err());

        a.args = Some(vec!["run".to_string()]);
        assert!(a.validate().is_ok());

        a.cmd = Some("x".to_string());
        assert!(a.validate().is_err(), "cmd and args are exclusive");

        a.cmd = None;
        a.args = None;
        a.container = Some(Container {
            engine: ContainerEngine::Docker,
            image: "nginx:1.27".to_string(),
            network: None,
            port_mappings: Vec::new(),
            volumes: Vec::new(),
            parameters: Vec::new(),
        });
        assert!(a.validate().is_ok());
    }

    #[test]
    fn validates_upgrade_strategy_bounds() {
        let mut a = app("/a");
        a.upgrade_strategy.minimum_health_capacity = 1.5;
        assert!(a.validate().is_err());
        a.upgrade_strategy.minimum_health_capacity = 0.5;
        a.upgrade_strategy.maximum_over_capacity = -0.1;
        assert!(a.validate().is_err());
    }

    #[test]
    fn validates_constraint_regexes() {
        let mut a = app("/a");
        a.constraints.push(Constraint {
            field: "hostname".to_string(),
            op: ConstraintOp::Like,
            value: Some("rack-[0-9]+".to_string()),
        });
        assert!(a.validate().is_ok());
        a.constraints[0].value = Some("(".to_string());
        assert!(a.validate().is_err());
    }

    #[test]
    fn validates_health_check_port_index() {
        let mut a = app("/a");
        a.ports = vec![0, 0];
        a.health_checks.push(HealthCheckSpec {
            port_index: 1,
            ..HealthCheckSpec::http("/ping")
        });
        assert!(a.validate().is_ok());
        a.health_checks[0].port_index = 2;
        assert!(a.validate().is_err());
    }

    #[test]
    fn required_host_ports_respect_require_ports() {
        let mut a = app("/a");
        a.ports = vec![8080, 0];
        assert_eq!(a.required_host_ports(), vec![0, 0]);
        a.require_ports = true;
        assert_eq!(a.required_host_ports(), vec![8080, 0]);
    }

    #[test]
    fn container_mappings_override_port_list() {
        let mut a = app("/a");
        a.ports = vec![8080];
        a.container = Some(Container {
            engine: ContainerEngine::Docker,
            image: "nginx".to_string(),
            network: Some("BRIDGE".to_string()),
            port_mappings: vec![PortMapping {
                container_port: 80,
                host_port: 0,
                service_port: 0,
                protocol: "tcp".to_string(),
            }],
            volumes: Vec::new(),
            parameters: Vec::new(),
        });
        assert_eq!(a.required_host_ports(), vec![0]);
        assert_eq!(a.declared_service_ports(), vec![0]);
    }

    #[test]
    fn scale_change_is_not_an_upgrade() {
        let v1 = app("/a");
        let mut v2 = v1.clone();
        v2.instances = 5;
        v2.version = Timestamp::from_millis(10);
        assert!(!v1.is_upgrade(&v2));
        assert!(v1.is_only_scale_change(&v2));
    }

    #[test]
    fn cmd_change_is_an_upgrade() {
        let v1 = app("/a");
        let mut v2 = v1.clone();
        v2.cmd = Some("sleep 60".to_string());
        assert!(v1.is_upgrade(&v2));
        assert!(!v1.is_only_scale_change(&v2));
    }

    #[test]
    fn service_port_assignment_is_not_an_upgrade() {
        let mut v1 = app("/a");
        v1.ports = vec![0, 0];
        let v2 = v1.clone().with_assigned_service_ports(vec![10_001, 10_002]);
        assert!(!v1.is_upgrade(&v2));
    }

    #[test]
    fn serde_round_trip() {
        let mut a = app("/prod/web");
        a.ports = vec![0, 443];
        a.health_checks.push(HealthCheckSpec {
            protocol: HealthCheckProtocol::Tcp,
            ..HealthCheckSpec::http("/")
        });
        let json = serde_json::to_string(&a).unwrap();
        let back: AppDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}
