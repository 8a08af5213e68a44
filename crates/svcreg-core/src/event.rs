//! Messages carried on the `EventBus`.

use serde::{Deserialize, Serialize};

use crate::types::{InstanceId, MicroserviceInstance, MicroserviceKey, ServiceId};

/// What happened to an instance, as reported by a watch push.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchAction {
    Create,
    Update,
    Delete,
    /// Registry-side filtering changed; everything must be re-read.
    Expire,
}

/// A watch push about one microservice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceChangedEvent {
    pub action: WatchAction,
    pub key: MicroserviceKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<MicroserviceInstance>,
}

/// Lifecycle state of a registration task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting for its predecessor.
    Init,
    /// Allowed to run on the next tick.
    Ready,
    /// Done until something resets it.
    Finished,
}

/// Which registration stage a completion refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    RegisterMicroservice,
    RegisterInstance,
    Watch,
    Heartbeat,
}

/// Outcome of one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HeartbeatResult {
    /// No heartbeat sent yet.
    #[default]
    Init,
    Success,
    /// No reply; network failure.
    Disconnected,
    /// The registry no longer has our instance record.
    InstanceNotRegistered,
}

/// Published once every time a READY task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub kind: TaskKind,
    /// Status after the run.
    pub status: TaskStatus,
    /// Set for heartbeat completions only.
    pub heartbeat: Option<HeartbeatResult>,
    pub service_id: Option<ServiceId>,
    pub instance_id: Option<InstanceId>,
}

/// Discriminant used to key subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MicroserviceCreated,
    MicroserviceDestroyed,
    SafeModeChanged,
    InstanceChanged,
    WatchException,
    WatchRecovery,
    HeartbeatFailed,
    TaskCompleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    MicroserviceCreated { app_id: String, service_name: String },
    MicroserviceDestroyed { app_id: String, service_name: String },
    /// Registry instability flag; while on, instances are never removed.
    SafeModeChanged { enabled: bool },
    InstanceChanged(InstanceChangedEvent),
    WatchException { message: String },
    WatchRecovery,
    HeartbeatFailed { result: HeartbeatResult },
    TaskCompleted(TaskCompletion),
}

impl RegistryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RegistryEvent::MicroserviceCreated { .. } => EventKind::MicroserviceCreated,
            RegistryEvent::MicroserviceDestroyed { .. } => EventKind::MicroserviceDestroyed,
            RegistryEvent::SafeModeChanged { .. } => EventKind::SafeModeChanged,
            RegistryEvent::InstanceChanged(_) => EventKind::InstanceChanged,
            RegistryEvent::WatchException { .. } => EventKind::WatchException,
            RegistryEvent::WatchRecovery => EventKind::WatchRecovery,
            RegistryEvent::HeartbeatFailed { .. } => EventKind::HeartbeatFailed,
            RegistryEvent::TaskCompleted(_) => EventKind::TaskCompleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_event_json_shape() {
        let json = r#"{"action":"DELETE","key":{"appId":"app","serviceName":"orders","version":"1.0"}}"#;
        let event: InstanceChangedEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.action, WatchAction::Delete);
        assert_eq!(event.key.service_name, "orders");
        assert!(event.instance.is_none());
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(RegistryEvent::WatchRecovery.kind(), EventKind::WatchRecovery);
        assert_eq!(
            RegistryEvent::SafeModeChanged { enabled: true }.kind(),
            EventKind::SafeModeChanged
        );
    }
}
