//! Microservice registration, including its schema documents.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use svcreg_client::RegistryContext;
use svcreg_core::{schema_summary, Microservice, TaskKind, TaskStatus};

use crate::error::{TaskError, TaskResult};
use crate::task::Task;

pub struct MicroserviceRegisterTask {
    ctx: RegistryContext,
    status: TaskStatus,
    registered: bool,
}

impl MicroserviceRegisterTask {
    /// Starts READY: registration is the first stage.
    pub fn new(ctx: RegistryContext) -> Self {
        Self {
            ctx,
            status: TaskStatus::Ready,
            registered: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Force a full re-registration on the next run.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Ready;
        self.registered = false;
    }

    /// Register (or reuse) the microservice and bring its schemas in line.
    pub async fn register(&self, microservice: &mut Microservice) -> TaskResult<String> {
        let client = &self.ctx.client;
        let existing = client
            .get_microservice_id(
                &microservice.app_id,
                &microservice.service_name,
                &microservice.version,
                &microservice.environment,
            )
            .await?;

        let service_id = match existing {
            Some(service_id) => {
                info!(
                    %service_id,
                    service = %microservice.service_name,
                    version = %microservice.version,
                    "microservice already registered, reusing service id"
                );
                self.check_schema_ids(microservice, &service_id).await?;
                service_id
            }
            None => {
                let service_id = client
                    .register_microservice(microservice)
                    .await?
                    .ok_or(TaskError::MissingId("service id"))?;
                info!(
                    %service_id,
                    service = %microservice.service_name,
                    version = %microservice.version,
                    "microservice registered"
                );
                // A new microservice never keeps an old instance id.
                microservice.instance.instance_id = None;
                service_id
            }
        };

        microservice.service_id = Some(service_id.clone());
        microservice.instance.service_id = Some(service_id.clone());

        self.register_schemas(microservice, &service_id).await?;
        Ok(service_id)
    }

    async fn check_schema_ids(
        &self,
        microservice: &Microservice,
        service_id: &str,
    ) -> TaskResult<()> {
        let remote = self
            .ctx
            .client
            .get_microservice(service_id)
            .await?
            .ok_or_else(|| TaskError::MicroserviceNotFound(service_id.to_string()))?;
        if remote.schemas == microservice.schemas {
            return Ok(());
        }

        let local: Vec<String> = microservice.schemas.iter().cloned().collect();
        let registry: Vec<String> = remote.schemas.iter().cloned().collect();
        if self.ctx.config.is_dev_mode() {
            warn!(
                %service_id,
                ?local,
                ?registry,
                "schema ids differ from the registry, overwriting in development mode"
            );
            return Ok(());
        }
        Err(TaskError::SchemaIdSetMismatch {
            service_id: service_id.to_string(),
            local,
            registry,
        })
    }

    async fn register_schemas(
        &self,
        microservice: &Microservice,
        service_id: &str,
    ) -> TaskResult<()> {
        let client = &self.ctx.client;
        let remote: BTreeMap<String, Option<String>> = client
            .get_schema_summaries(service_id)
            .await?
            .into_iter()
            .map(|s| (s.schema_id, s.summary))
            .collect();

        for (schema_id, content) in &microservice.schema_contents {
            let remote_summary = match remote.get(schema_id) {
                None => None,
                Some(Some(summary)) => Some(summary.clone()),
                Some(None) => self.fetch_summary(service_id, schema_id).await?,
            };

            match remote_summary {
                None => self.register_schema(service_id, schema_id, content).await?,
                Some(summary) if summary == schema_summary(content) => {
                    debug!(%service_id, %schema_id, "schema unchanged");
                }
                Some(_) => self.on_schema_changed(service_id, schema_id, content).await?,
            }
        }

        let undeclared: Vec<String> = remote
            .keys()
            .filter(|id| !microservice.schemas.contains(*id))
            .cloned()
            .collect();
        if undeclared.is_empty() {
            return Ok(());
        }
        if self.ctx.config.is_dev_mode() {
            warn!(
                %service_id,
                schema_ids = ?undeclared,
                "registry keeps schemas this microservice no longer declares"
            );
            return Ok(());
        }
        Err(TaskError::UndeclaredRegistrySchemas {
            service_id: service_id.to_string(),
            schema_ids: undeclared,
        })
    }

    /// Summary computed from registry-side content, when there is any.
    async fn fetch_summary(
        &self,
        service_id: &str,
        schema_id: &str,
    ) -> TaskResult<Option<String>> {
        let client = &self.ctx.client;
        if !client.is_schema_exist(service_id, schema_id).await? {
            return Ok(None);
        }
        Ok(client
            .get_schema(service_id, schema_id)
            .await?
            .map(|content| schema_summary(&content)))
    }

    async fn on_schema_changed(
        &self,
        service_id: &str,
        schema_id: &str,
        content: &str,
    ) -> TaskResult<()> {
        let config = &self.ctx.config;
        if config.is_dev_mode() {
            info!(%service_id, %schema_id, "schema changed, overwriting in development mode");
            return self.register_schema(service_id, schema_id, content).await;
        }
        if config.ignore_schema_difference {
            warn!(
                %service_id,
                %schema_id,
                "schema differs from the registry copy, keeping the registry copy"
            );
            return Ok(());
        }
        Err(TaskError::SchemaContentChanged {
            service_id: service_id.to_string(),
            schema_id: schema_id.to_string(),
        })
    }

    async fn register_schema(
        &self,
        service_id: &str,
        schema_id: &str,
        content: &str,
    ) -> TaskResult<()> {
        if self
            .ctx
            .client
            .register_schema(service_id, schema_id, content)
            .await?
        {
            info!(%service_id, %schema_id, "schema registered");
            return Ok(());
        }
        Err(TaskError::SchemaRejected {
            service_id: service_id.to_string(),
            schema_id: schema_id.to_string(),
        })
    }
}

#[async_trait]
impl Task for MicroserviceRegisterTask {
    fn kind(&self) -> TaskKind {
        TaskKind::RegisterMicroservice
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    async fn do_run(&mut self, microservice: &mut Microservice) {
        if self.registered {
            self.status = TaskStatus::Finished;
            return;
        }

        match self.register(microservice).await {
            Ok(_) => {
                self.registered = true;
                self.status = TaskStatus::Finished;
            }
            Err(e) => {
                error!(
                    service = %microservice.service_name,
                    version = %microservice.version,
                    error = %e,
                    "microservice registration failed"
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
    use svcreg_core::{EventBus, RegistryConfig};

    fn setup(config: RegistryConfig) -> (Arc<InMemoryRegistry>, MicroserviceRegisterTask) {
        let registry = Arc::new(InMemoryRegistry::new());
        let ctx = RegistryContext::new(config, registry.clone());
        (registry, MicroserviceRegisterTask::new(ctx))
    }

    fn dev_config() -> RegistryConfig {
        RegistryConfig {
            environment: "Development".to_string(),
            ..Default::default()
        }
    }

    fn local(schemas: &[(&str, &str)]) -> Microservice {
        let mut ms = Microservice::new("app", "orders", "1.0.0");
        for (id, content) in schemas {
            ms.add_schema(id, content);
        }
        ms
    }

    /// Registry already holds (app, orders, 1.0.0) with schema s1 = "old".
    fn seed(registry: &InMemoryRegistry) -> String {
        let sid = registry.add_microservice(&local(&[("s1", "old")]));
        registry.set_schema(&sid, "s1", "old");
        sid
    }

    #[tokio::test]
    async fn fresh_registration_registers_schemas_and_clears_instance_id() {
        let (registry, mut task) = setup(RegistryConfig::default());
        let mut ms = local(&[("s1", "a"), ("s2", "b")]);
        ms.instance.instance_id = Some("stale".to_string());

        task.do_run(&mut ms).await;

        assert_eq!(task.status(), TaskStatus::Finished);
        assert!(task.is_registered());
        let sid = ms.service_id.clone().unwrap();
        assert_eq!(ms.instance.service_id.as_deref(), Some(sid.as_str()));
        assert!(ms.instance.instance_id.is_none());
        assert_eq!(registry.schema(&sid, "s1").as_deref(), Some("a"));
        assert_eq!(registry.schema(&sid, "s2").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn existing_service_is_reused() {
        let (registry, mut task) = setup(RegistryConfig::default());
        let sid = seed(&registry);
        let mut ms = local(&[("s1", "old")]);
        ms.instance.instance_id = Some("kept".to_string());

        task.do_run(&mut ms).await;

        assert_eq!(task.status(), TaskStatus::Finished);
        assert_eq!(ms.service_id.as_deref(), Some(sid.as_str()));
        assert_eq!(ms.instance.instance_id.as_deref(), Some("kept"));
        assert_eq!(registry.microservice_count(), 1);
    }

    #[tokio::test]
    async fn schema_id_mismatch_fails_outside_dev_mode() {
        let (registry, mut task) = setup(RegistryConfig::default());
        seed(&registry);
        let mut ms = local(&[("s1", "new"), ("s2", "b")]);

        let err = task.register(&mut ms).await.unwrap_err();
        assert!(matches!(err, TaskError::SchemaIdSetMismatch { .. }));

        task.do_run(&mut ms).await;
        assert_eq!(task.status(), TaskStatus::Ready);
        assert!(!task.is_registered());
    }

    #[tokio::test]
    async fn schema_id_mismatch_overwrites_in_dev_mode() {
        let (registry, mut task) = setup(dev_config());
        let sid = seed(&registry);
        let mut ms = local(&[("s1", "new"), ("s2", "b")]);

        task.do_run(&mut ms).await;

        assert_eq!(task.status(), TaskStatus::Finished);
        assert_eq!(registry.schema(&sid, "s1").as_deref(), Some("new"));
        assert_eq!(registry.schema(&sid, "s2").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn changed_content_fails_outside_dev_mode() {
        let (registry, task) = setup(RegistryConfig::default());
        let sid = seed(&registry);
        let mut ms = local(&[("s1", "new")]);

        let err = task.register(&mut ms).await.unwrap_err();
        assert!(matches!(err, TaskError::SchemaContentChanged { .. }));
        assert_eq!(registry.schema(&sid, "s1").as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn changed_content_tolerated_when_ignoring_differences() {
        let config = RegistryConfig {
            ignore_schema_difference: true,
            ..Default::default()
        };
        let (registry, task) = setup(config);
        let sid = seed(&registry);
        let mut ms = local(&[("s1", "new")]);

        task.register(&mut ms).await.unwrap();
        assert_eq!(registry.schema(&sid, "s1").as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn always_override_enables_overwrite() {
        let config = RegistryConfig {
            always_override_schema: true,
            ..Default::default()
        };
        let (registry, task) = setup(config);
        let sid = seed(&registry);
        let mut ms = local(&[("s1", "new")]);

        task.register(&mut ms).await.unwrap();
        assert_eq!(registry.schema(&sid, "s1").as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn schema_without_registry_content_is_registered() {
        let (registry, task) = setup(RegistryConfig::default());
        let sid = registry.add_microservice(&local(&[("s1", "x")]));
        let mut ms = local(&[("s1", "x")]);

        task.register(&mut ms).await.unwrap();
        assert_eq!(registry.schema(&sid, "s1").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn registry_only_schemas_tolerated_in_dev_mode() {
        let (registry, task) = setup(dev_config());
        let sid = seed(&registry);
        registry.set_schema(&sid, "retired", "y");
        let mut ms = local(&[("s1", "old")]);

        task.register(&mut ms).await.unwrap();
        assert_eq!(registry.schema(&sid, "retired").as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn offline_registry_leaves_task_ready() {
        let (registry, mut task) = setup(RegistryConfig::default());
        registry.set_available(false);
        let mut ms = local(&[]);
        let bus = EventBus::new();

        let completion = task.run(&mut ms, &bus).await.unwrap();
        assert_eq!(completion.status, TaskStatus::Ready);
        assert!(ms.service_id.is_none());
    }

    #[tokio::test]
    async fn registered_task_finishes_without_calls() {
        let (registry, mut task) = setup(RegistryConfig::default());
        let mut ms = local(&[]);
        task.do_run(&mut ms).await;
        assert_eq!(registry.microservice_count(), 1);

        registry.set_available(false);
        task.set_status(TaskStatus::Ready);
        task.do_run(&mut ms).await;
        assert_eq!(task.status(), TaskStatus::Finished);

        task.reset();
        task.do_run(&mut ms).await;
        assert_eq!(task.status(), TaskStatus::Ready);
    }
}
