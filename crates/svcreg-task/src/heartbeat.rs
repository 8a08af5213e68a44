//! Liveness heartbeats for the registered instance.

use async_trait::async_trait;
use tracing::{debug, warn};

use svcreg_client::RegistryContext;
use svcreg_core::{HeartbeatResult, Microservice, RegistryEvent, TaskKind, TaskStatus};

use crate::task::Task;

/// Sends one heartbeat per run once the watch stage is reached.
pub struct MicroserviceInstanceHeartbeatTask {
    ctx: RegistryContext,
    status: TaskStatus,
    result: HeartbeatResult,
}

impl MicroserviceInstanceHeartbeatTask {
    pub fn new(ctx: RegistryContext) -> Self {
        Self {
            ctx,
            status: TaskStatus::Init,
            result: HeartbeatResult::Init,
        }
    }

    pub fn result(&self) -> HeartbeatResult {
        self.result
    }

    async fn heartbeat(&self, microservice: &Microservice) -> HeartbeatResult {
        let (Some(service_id), Some(instance_id)) = (
            microservice.service_id.as_deref(),
            microservice.instance.instance_id.as_deref(),
        ) else {
            return HeartbeatResult::InstanceNotRegistered;
        };

        match self.ctx.client.heartbeat(service_id, instance_id).await {
            Ok(Some(response)) if response.ok => {
                debug!(%service_id, %instance_id, "heartbeat ok");
                HeartbeatResult::Success
            }
            Ok(Some(_)) => {
                warn!(%service_id, %instance_id, "registry no longer knows this instance");
                HeartbeatResult::InstanceNotRegistered
            }
            Ok(None) => {
                warn!(%service_id, %instance_id, "heartbeat got no reply");
                HeartbeatResult::Disconnected
            }
            Err(e) => {
                warn!(%service_id, %instance_id, error = %e, "heartbeat failed");
                HeartbeatResult::Disconnected
            }
        }
    }
}

#[async_trait]
impl Task for MicroserviceInstanceHeartbeatTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Heartbeat
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    fn heartbeat_result(&self) -> Option<HeartbeatResult> {
        Some(self.result)
    }

    async fn do_run(&mut self, microservice: &mut Microservice) {
        self.result = self.heartbeat(microservice).await;
        if self.result != HeartbeatResult::Success {
            self.ctx
                .bus
                .post(&RegistryEvent::HeartbeatFailed { result: self.result });
        }
    }
}
