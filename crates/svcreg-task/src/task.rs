//! The unit of registration work.

use async_trait::async_trait;
use tracing::trace;

use svcreg_core::{
    EventBus, HeartbeatResult, Microservice, RegistryEvent, TaskCompletion, TaskKind, TaskStatus,
};

/// One stage of the registration chain.
///
/// A task only runs its body while READY; its status is otherwise moved
/// by the chain in reaction to other tasks' completions.
#[async_trait]
pub trait Task: Send + Sync {
    fn kind(&self) -> TaskKind;

    fn status(&self) -> TaskStatus;

    fn set_status(&mut self, status: TaskStatus);

    /// Heartbeat outcome, for heartbeat tasks.
    fn heartbeat_result(&self) -> Option<HeartbeatResult> {
        None
    }

    /// The task body. Only called when READY.
    async fn do_run(&mut self, microservice: &mut Microservice);

    fn completion(&self, microservice: &Microservice) -> TaskCompletion {
        TaskCompletion {
            kind: self.kind(),
            status: self.status(),
            heartbeat: self.heartbeat_result(),
            service_id: microservice.service_id.clone(),
            instance_id: microservice.instance.instance_id.clone(),
        }
    }

    /// Run the body if READY and publish exactly one completion.
    /// Does nothing, and publishes nothing, in any other status.
    async fn run(
        &mut self,
        microservice: &mut Microservice,
        bus: &EventBus,
    ) -> Option<TaskCompletion> {
        if self.status() != TaskStatus::Ready {
            trace!(kind = ?self.kind(), status = ?self.status(), "task not ready");
            return None;
        }

        self.do_run(microservice).await;

        let completion = self.completion(microservice);
        bus.post(&RegistryEvent::TaskCompleted(completion.clone()));
        Some(completion)
    }
}
