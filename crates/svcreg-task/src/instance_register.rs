//! Registration of this process's instance.

use async_trait::async_trait;
use tracing::{error, info};

use svcreg_client::{IpPort, RegistryContext};
use svcreg_core::{
    HealthCheck, HealthCheckMode, Microservice, MicroserviceInstance, TaskKind, TaskStatus,
};

use crate::error::{TaskError, TaskResult};
use crate::task::Task;

pub struct MicroserviceInstanceRegisterTask {
    ctx: RegistryContext,
    status: TaskStatus,
}

impl MicroserviceInstanceRegisterTask {
    pub fn new(ctx: RegistryContext) -> Self {
        Self {
            ctx,
            status: TaskStatus::Init,
        }
    }

    /// The instance record as it will be sent to the registry.
    pub fn prepare(&self, microservice: &Microservice) -> MicroserviceInstance {
        let config = &self.ctx.config;
        let mut instance = microservice.instance.clone();
        instance.service_id = microservice.service_id.clone();

        if config.prefer_ip_address {
            if let Some(address) = instance
                .endpoints
                .first()
                .and_then(|e| IpPort::parse(e).ok())
            {
                instance.host_name = address.host;
            }
        }

        instance.health_check = Some(HealthCheck {
            mode: HealthCheckMode::Push,
            interval: config.heartbeat_interval_secs,
            times: config.heartbeat_resend_times,
        });
        instance
    }

    pub async fn register(&self, microservice: &mut Microservice) -> TaskResult<String> {
        let instance = self.prepare(microservice);
        let instance_id = self
            .ctx
            .client
            .register_instance(&instance)
            .await?
            .ok_or(TaskError::MissingId("instance id"))?;

        info!(
            service_id = %instance.owner(),
            %instance_id,
            host_name = %instance.host_name,
            endpoints = ?instance.endpoints,
            "instance registered"
        );
        microservice.instance = MicroserviceInstance {
            instance_id: Some(instance_id.clone()),
            ..instance
        };
        Ok(instance_id)
    }
}

#[async_trait]
impl Task for MicroserviceInstanceRegisterTask {
    fn kind(&self) -> TaskKind {
        TaskKind::RegisterInstance
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    async fn do_run(&mut self, microservice: &mut Microservice) {
        match self.register(microservice).await {
            Ok(_) => self.status = TaskStatus::Finished,
            Err(e) => {
                error!(
                    service_id = ?microservice.service_id,
                    error = %e,
                    "instance registration failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use svcreg_client::InMemoryRegistry;
    use svcreg_core::RegistryConfig;

    fn setup(
        config: RegistryConfig,
    ) -> (Arc<InMemoryRegistry>, MicroserviceInstanceRegisterTask) {
        let registry = Arc::new(InMemoryRegistry::new());
        let ctx = RegistryContext::new(config, registry.clone());
        (registry, MicroserviceInstanceRegisterTask::new(ctx))
    }

    fn registered(registry: &InMemoryRegistry) -> Microservice {
        let mut ms = Microservice::new("app", "orders", "1.0.0");
        ms.service_id = Some(registry.add_microservice(&ms));
        ms.instance.host_name = "orders-host".to_string();
        ms.instance.endpoints = vec!["rest://10.1.2.3:8080?sslEnabled=false".to_string()];
        ms
    }

    #[tokio::test]
    async fn registers_with_push_health_check() {
        let config = RegistryConfig {
            heartbeat_interval_secs: 15,
            heartbeat_resend_times: 5,
            ..Default::default()
        };
        let (registry, mut task) = setup(config);
        task.set_status(TaskStatus::Ready);
        let mut ms = registered(&registry);

        task.do_run(&mut ms).await;

        assert_eq!(task.status(), TaskStatus::Finished);
        let iid = ms.instance.instance_id.clone().unwrap();
        let stored = registry.instance(&iid).unwrap();
        assert_eq!(stored.service_id, ms.service_id);
        assert_eq!(stored.host_name, "orders-host");
        assert_eq!(
            stored.health_check,
            Some(HealthCheck {
                mode: HealthCheckMode::Push,
                interval: 15,
                times: 5,
            })
        );
    }

    #[tokio::test]
    async fn prefer_ip_uses_endpoint_host() {
        let config = RegistryConfig {
            prefer_ip_address: true,
            ..Default::default()
        };
        let (registry, task) = setup(config);
        let ms = registered(&registry);
        assert_eq!(task.prepare(&ms).host_name, "10.1.2.3");
    }

    #[tokio::test]
    async fn unknown_microservice_keeps_task_ready() {
        let (_registry, mut task) = setup(RegistryConfig::default());
        task.set_status(TaskStatus::Ready);
        let mut ms = Microservice::new("app", "orders", "1.0.0");
        ms.service_id = Some("missing".to_string());

        task.do_run(&mut ms).await;
        assert_eq!(task.status(), TaskStatus::Ready);
        assert!(ms.instance.instance_id.is_none());
    }
}
