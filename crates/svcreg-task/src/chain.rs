//! The registration chain as an explicit state machine.
//!
//! ```text
//!   register ──FINISHED──▶ instance ──FINISHED──▶ watch ──READY──▶ heartbeat
//!      ▲                      │                                       │
//!      └──── not FINISHED ────┘                                       │
//!      └──────────────────── INSTANCE_NOT_REGISTERED ─────────────────┘
//! ```
//!
//! Each tick runs the four tasks in order. A task runs only if READY;
//! after every run the transition table below moves the other tasks, so
//! a single tick can carry a fresh process from registration all the
//! way to its first heartbeat.

use std::sync::Arc;

use tracing::{info, warn};

use svcreg_client::RegistryContext;
use svcreg_core::{HeartbeatResult, Microservice, TaskCompletion, TaskKind, TaskStatus};

use crate::heartbeat::MicroserviceInstanceHeartbeatTask;
use crate::instance_register::MicroserviceInstanceRegisterTask;
use crate::register::MicroserviceRegisterTask;
use crate::task::Task;
use crate::watch::MicroserviceWatchTask;

/// Where the chain currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStage {
    RegisteringMicroservice,
    RegisteringInstance,
    Watching,
    Heartbeating,
}

pub struct RegistrationChain {
    ctx: RegistryContext,
    microservice: Microservice,
    register: MicroserviceRegisterTask,
    instance: MicroserviceInstanceRegisterTask,
    watch: MicroserviceWatchTask,
    heartbeat: MicroserviceInstanceHeartbeatTask,
}

impl RegistrationChain {
    pub fn new(ctx: RegistryContext, microservice: Microservice) -> Self {
        Self {
            register: MicroserviceRegisterTask::new(ctx.clone()),
            instance: MicroserviceInstanceRegisterTask::new(ctx.clone()),
            watch: MicroserviceWatchTask::new(ctx.clone()),
            heartbeat: MicroserviceInstanceHeartbeatTask::new(ctx.clone()),
            ctx,
            microservice,
        }
    }

    pub fn microservice(&self) -> &Microservice {
        &self.microservice
    }

    pub fn service_id(&self) -> Option<&str> {
        self.microservice.service_id.as_deref()
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.microservice.instance.instance_id.as_deref()
    }

    pub fn status(&self, kind: TaskKind) -> TaskStatus {
        match kind {
            TaskKind::RegisterMicroservice => self.register.status(),
            TaskKind::RegisterInstance => self.instance.status(),
            TaskKind::Watch => self.watch.status(),
            TaskKind::Heartbeat => self.heartbeat.status(),
        }
    }

    pub fn heartbeat_result(&self) -> HeartbeatResult {
        self.heartbeat.result()
    }

    pub fn is_watching(&self) -> bool {
        self.watch.is_active()
    }

    pub fn stage(&self) -> ChainStage {
        if self.register.status() != TaskStatus::Finished {
            ChainStage::RegisteringMicroservice
        } else if self.instance.status() != TaskStatus::Finished {
            ChainStage::RegisteringInstance
        } else if self.heartbeat.status() == TaskStatus::Init {
            ChainStage::Watching
        } else {
            ChainStage::Heartbeating
        }
    }

    /// Run every READY task once, in chain order. Returns the completions
    /// of the tasks that ran.
    pub async fn tick(&mut self) -> Vec<TaskCompletion> {
        let bus = Arc::clone(&self.ctx.bus);
        let mut completions = Vec::new();

        if let Some(c) = self.register.run(&mut self.microservice, &bus).await {
            self.apply(&c);
            completions.push(c);
        }

        if let Some(c) = self.instance.run(&mut self.microservice, &bus).await {
            self.apply(&c);
            completions.push(c);
        }

        if let Some(c) = self.watch.run(&mut self.microservice, &bus).await {
            self.apply(&c);
            completions.push(c);
        }

        if let Some(c) = self.heartbeat.run(&mut self.microservice, &bus).await {
            self.apply(&c);
            completions.push(c);
        }
        completions
    }

    /// The transition table.
    fn apply(&mut self, completion: &TaskCompletion) {
        match (completion.kind, completion.status) {
            (TaskKind::RegisterMicroservice, TaskStatus::Finished) => {
                self.instance.set_status(TaskStatus::Ready);
            }
            (TaskKind::RegisterInstance, TaskStatus::Finished) => {
                self.watch.set_status(TaskStatus::Ready);
            }
            (TaskKind::RegisterInstance, _) => {
                self.register.reset();
            }
            (TaskKind::Watch, TaskStatus::Ready) => {
                self.heartbeat.set_status(TaskStatus::Ready);
            }
            (TaskKind::Heartbeat, _)
                if completion.heartbeat == Some(HeartbeatResult::InstanceNotRegistered) =>
            {
                warn!(
                    service_id = ?completion.service_id,
                    instance_id = ?completion.instance_id,
                    "instance lost by the registry, restarting registration"
                );
                self.reset();
            }
            _ => {}
        }
    }

    /// Send the chain back to microservice registration. Registration
    /// reuses an existing service id, so this is safe to repeat.
    pub fn reset(&mut self) {
        self.register.reset();
        self.instance.set_status(TaskStatus::Init);
        self.watch.set_status(TaskStatus::Init);
        self.heartbeat.set_status(TaskStatus::Init);
    }

    /// Close the watch stream, if one was opened.
    pub async fn stop(&mut self) {
        if let Some(service_id) = self.microservice.service_id.clone() {
            info!(%service_id, "stopping registration chain");
            self.watch.stop(&service_id).await;
        }
    }
}
