//! One registered (serviceId, version) pair and its instances.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use svcreg_client::RegistryClient;
use svcreg_core::{Microservice, MicroserviceInstance, Version};

use crate::error::{ConsumerError, ConsumerResult};

pub struct MicroserviceVersion {
    microservice: Microservice,
    version: Version,
    instances: ArcSwap<Vec<Arc<MicroserviceInstance>>>,
}

impl MicroserviceVersion {
    /// Load the registry's record for `service_id`.
    pub async fn create(client: &dyn RegistryClient, service_id: &str) -> ConsumerResult<Self> {
        let microservice = client
            .get_microservice(service_id)
            .await?
            .ok_or_else(|| ConsumerError::MicroserviceNotFound(service_id.to_string()))?;
        let mut created = Self::from_microservice(microservice)?;
        if created.microservice.service_id.is_none() {
            created.microservice.service_id = Some(service_id.to_string());
        }
        debug!(
            service_id,
            service = %created.microservice.service_name,
            version = %created.version,
            "created microservice version"
        );
        Ok(created)
    }

    pub fn from_microservice(microservice: Microservice) -> ConsumerResult<Self> {
        let version = Version::parse(&microservice.version)?;
        Ok(Self {
            microservice,
            version,
            instances: ArcSwap::from_pointee(Vec::new()),
        })
    }

    pub fn service_id(&self) -> &str {
        self.microservice.service_id.as_deref().unwrap_or("")
    }

    pub fn microservice(&self) -> &Microservice {
        &self.microservice
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Current instance list snapshot.
    pub fn instances(&self) -> Arc<Vec<Arc<MicroserviceInstance>>> {
        self.instances.load_full()
    }

    pub fn set_instances(&self, instances: Vec<Arc<MicroserviceInstance>>) {
        self.instances.store(Arc::new(instances));
    }

    pub fn destroy(&self) {
        self.set_instances(Vec::new());
    }
}

impl std::fmt::Debug for MicroserviceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroserviceVersion")
            .field("service_id", &self.service_id())
            .field("version", &self.version)
            .field("instances", &self.instances.load().len())
            .finish()
    }
}
