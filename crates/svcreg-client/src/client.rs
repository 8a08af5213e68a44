//! The registry facade.
//!
//! Everything the core needs from the registry, expressed as one async
//! trait. The wire transport (HTTP, gRPC, ...) lives behind it and owns
//! call timeouts; the core never cancels a call itself.

use std::sync::Arc;

use async_trait::async_trait;

use svcreg_core::{InstanceChangedEvent, Microservice, MicroserviceInstance};

use crate::error::{RegistryError, RegistryResult};

/// Answer to an instance query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MicroserviceInstances {
    /// Opaque token for this instance-list snapshot.
    pub revision: Option<String>,
    pub instances: Vec<MicroserviceInstance>,
    /// The registry no longer knows the microservice.
    pub microservice_not_exist: bool,
}

impl MicroserviceInstances {
    pub fn not_exist() -> Self {
        Self {
            microservice_not_exist: true,
            ..Default::default()
        }
    }
}

/// Answer to a heartbeat. `ok == false` means the instance record is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub ok: bool,
}

/// Registry-side view of one schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSummary {
    pub schema_id: String,
    /// Content hash, when the registry has content for the schema.
    pub summary: Option<String>,
}

/// Receives watch-stream callbacks. Called from the transport's I/O
/// task, so implementations must not block.
pub trait WatchListener: Send + Sync {
    fn on_event(&self, event: Result<InstanceChangedEvent, RegistryError>);

    fn on_open(&self);

    fn on_close(&self);
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// All instances of (app, service) selected by `version_rule`.
    ///
    /// `Ok(None)` and `Err` both mean the call produced nothing usable.
    async fn find_service_instances(
        &self,
        app_id: &str,
        service_name: &str,
        version_rule: &str,
        revision: Option<&str>,
    ) -> RegistryResult<Option<MicroserviceInstances>>;

    async fn get_microservice_id(
        &self,
        app_id: &str,
        service_name: &str,
        version: &str,
        environment: &str,
    ) -> RegistryResult<Option<String>>;

    async fn get_microservice(&self, service_id: &str) -> RegistryResult<Option<Microservice>>;

    /// Register a microservice; returns the assigned service id.
    async fn register_microservice(&self, microservice: &Microservice)
        -> RegistryResult<Option<String>>;

    /// Register an instance; returns the assigned instance id.
    async fn register_instance(
        &self,
        instance: &MicroserviceInstance,
    ) -> RegistryResult<Option<String>>;

    /// `Ok(None)` means no reply.
    async fn heartbeat(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> RegistryResult<Option<HeartbeatResponse>>;

    /// Open a long-lived watch for `service_id`. Events, open and close
    /// are delivered to `listener`.
    async fn watch(&self, service_id: &str, listener: Arc<dyn WatchListener>)
        -> RegistryResult<()>;

    async fn stop_watch(&self, service_id: &str);

    async fn is_schema_exist(&self, service_id: &str, schema_id: &str) -> RegistryResult<bool>;

    async fn register_schema(
        &self,
        service_id: &str,
        schema_id: &str,
        content: &str,
    ) -> RegistryResult<bool>;

    async fn get_schema_summaries(&self, service_id: &str) -> RegistryResult<Vec<SchemaSummary>>;

    async fn get_schema(&self, service_id: &str, schema_id: &str)
        -> RegistryResult<Option<String>>;
}
