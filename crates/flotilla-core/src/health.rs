//! Health check declarations attached to an app.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a check probes a task. The protocol tag dispatches the checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckProtocol {
    /// GET `http://<host>:<hostPort[portIndex]><path>`; 2xx/3xx within
    /// the timeout counts as success.
    Http {
        path: String,
        /// When set, 1xx responses neither fail nor reset the streak.
        #[serde(default)]
        ignore_http_1xx: bool,
    },
    /// Connect-and-close within the timeout.
    Tcp,
    /// Run on the task's host by the executor; results arrive as
    /// healthy bits on task status updates.
    Command { value: String },
}

/// One health check declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(flatten)]
    pub protocol: HealthCheckProtocol,
    /// Index into the task's allocated host ports.
    #[serde(default)]
    pub port_index: usize,
    /// Failures are ignored until the first success or until this much
    /// time has passed since the task started, whichever comes first.
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Consecutive failures before the task is killed.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

fn default_grace_period() -> u64 {
    15
}

fn default_interval() -> u64 {
    10
}

fn default_timeout() -> u64 {
    20
}

fn default_max_failures() -> u32 {
    3
}

impl HealthCheckSpec {
    /// An HTTP check on `/` with default thresholds.
    pub fn http(path: &str) -> Self {
        Self {
            protocol: HealthCheckProtocol::Http {
                path: path.to_string(),
                ignore_http_1xx: false,
            },
            port_index: 0,
            grace_period_seconds: default_grace_period(),
            interval_seconds: default_interval(),
            timeout_seconds: default_timeout(),
            max_consecutive_failures: default_max_failures(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn is_command(&self) -> bool {
        matches!(self.protocol, HealthCheckProtocol::Command { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_constructor_uses_defaults() {
        let check = HealthCheckSpec::http("/ping");
        assert_eq!(check.interval(), Duration::from_secs(10));
        assert_eq!(check.timeout(), Duration::from_secs(20));
        assert_eq!(check.max_consecutive_failures, 3);
        assert!(!check.is_command());
    }

    #[test]
    fn protocol_tag_round_trips() {
        let check = HealthCheckSpec {
            protocol: HealthCheckProtocol::Command {
                value: "curl -f localhost".to_string(),
            },
            ..HealthCheckSpec::http("/")
        };
        let json = serde_json::to_string(&check).unwrap();
        assert!(json.contains("\"protocol\":\"COMMAND\""));
        let back: HealthCheckSpec = serde_json::from_str(&json).unwrap();
        assert!(back.is_command());
        assert_eq!(back, check);
    }

    #[test]
    fn missing_optional_fields_get_defaults() {
        let json = r#"{"protocol":"TCP"}"#;
        let check: HealthCheckSpec = serde_json::from_str(json).unwrap();
        assert_eq!(check.protocol, HealthCheckProtocol::Tcp);
        assert_eq!(check.port_index, 0);
        assert_eq!(check.grace_period_seconds, 15);
    }
}
