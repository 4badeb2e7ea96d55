//! The internal event taxonomy and the in-process bus.
//!
//! Subsystems publish [`Event`]s; transports (SSE, HTTP callbacks)
//! subscribe and fan out. Publishing never blocks and silently drops
//! when nobody listens.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::Timestamp;
use crate::path::PathId;

/// Everything the orchestrator announces to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum Event {
    SchedulerRegistered {
        framework_id: String,
        master: String,
    },
    SchedulerReregistered {
        master: String,
    },
    SchedulerDisconnected,
    DeploymentInfo {
        id: String,
        step: usize,
    },
    DeploymentSuccess {
        id: String,
    },
    DeploymentFailed {
        id: String,
        reason: String,
    },
    DeploymentStepSuccess {
        id: String,
        step: usize,
    },
    DeploymentStepFailure {
        id: String,
        step: usize,
        reason: String,
    },
    GroupChangeSuccess {
        group_id: PathId,
        version: Timestamp,
    },
    GroupChangeFailed {
        group_id: PathId,
        reason: String,
    },
    AddHealthCheckEvent {
        app_id: PathId,
        version: Timestamp,
    },
    RemoveHealthCheckEvent {
        app_id: PathId,
        version: Timestamp,
    },
    FailedHealthCheckEvent {
        app_id: PathId,
        task_id: String,
    },
    HealthStatusChangedEvent {
        app_id: PathId,
        task_id: String,
        alive: bool,
    },
    StatusUpdateEvent {
        app_id: PathId,
        task_id: String,
        state: String,
        host: String,
    },
}

impl Event {
    /// The wire tag of this event, e.g. `deployment_step_success`.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::SchedulerRegistered { .. } => "scheduler_registered",
            Event::SchedulerReregistered { .. } => "scheduler_reregistered",
            Event::SchedulerDisconnected => "scheduler_disconnected",
            Event::DeploymentInfo { .. } => "deployment_info",
            Event::DeploymentSuccess { .. } => "deployment_success",
            Event::DeploymentFailed { .. } => "deployment_failed",
            Event::DeploymentStepSuccess { .. } => "deployment_step_success",
            Event::DeploymentStepFailure { .. } => "deployment_step_failure",
            Event::GroupChangeSuccess { .. } => "group_change_success",
            Event::GroupChangeFailed { .. } => "group_change_failed",
            Event::AddHealthCheckEvent { .. } => "add_health_check_event",
            Event::RemoveHealthCheckEvent { .. } => "remove_health_check_event",
            Event::FailedHealthCheckEvent { .. } => "failed_health_check_event",
            Event::HealthStatusChangedEvent { .. } => "health_status_changed_event",
            Event::StatusUpdateEvent { .. } => "status_update_event",
        }
    }
}

/// Broadcast bus for [`Event`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Lagging or absent subscribers are not an
    /// error; the bus is fire-and-forget.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(512)
    }
}
