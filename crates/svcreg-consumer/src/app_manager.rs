//! Owner of every `MicroserviceVersions` in the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use svcreg_client::RegistryContext;
use svcreg_core::{InstanceChangedEvent, MicroserviceName, RegistryEvent};

use crate::error::ConsumerResult;
use crate::rule::MicroserviceVersionRule;
use crate::versions::MicroserviceVersions;

/// (app id, service name)
type ServiceKey = (String, String);

pub struct AppManager {
    ctx: RegistryContext,
    services: RwLock<HashMap<ServiceKey, Arc<MicroserviceVersions>>>,
    safe_mode: AtomicBool,
}

impl AppManager {
    pub fn new(ctx: RegistryContext) -> Self {
        Self {
            ctx,
            services: RwLock::new(HashMap::new()),
            safe_mode: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &RegistryContext {
        &self.ctx
    }

    fn key(app_id: &str, service_name: &str) -> ServiceKey {
        let name = MicroserviceName::parse(app_id, service_name);
        (name.app_id, name.short_name)
    }

    /// Existing entry for (app, service), without creating one.
    pub fn microservice_versions(
        &self,
        app_id: &str,
        service_name: &str,
    ) -> Option<Arc<MicroserviceVersions>> {
        let services = self
            .services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        services.get(&Self::key(app_id, service_name)).cloned()
    }

    /// Entry for (app, service), created and pulled on first access.
    ///
    /// A freshly created entry that the registry does not know is dropped
    /// again right after its first pull; the caller still gets it back,
    /// empty and marked waiting-delete.
    pub async fn get_or_create_microservice_versions(
        &self,
        app_id: &str,
        service_name: &str,
    ) -> Arc<MicroserviceVersions> {
        let key = Self::key(app_id, service_name);
        if let Some(existing) = self.microservice_versions(&key.0, &key.1) {
            return existing;
        }

        let (versions, created) = {
            let mut services = self
                .services
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match services.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let versions =
                        Arc::new(MicroserviceVersions::new(self.ctx.clone(), &key.0, &key.1));
                    versions.on_safe_mode_changed(self.safe_mode.load(Ordering::Acquire));
                    services.insert(key.clone(), Arc::clone(&versions));
                    (versions, true)
                }
            }
        };
        if !created {
            return versions;
        }

        info!(app_id = %key.0, service = %key.1, "microservice versions created");
        self.ctx.bus.post(&RegistryEvent::MicroserviceCreated {
            app_id: key.0.clone(),
            service_name: key.1.clone(),
        });

        versions.pull_instances().await;
        if versions.is_waiting_delete() {
            self.remove_if_same(&key, &versions);
            versions.destroy().await;
        }
        versions
    }

    pub async fn get_or_create_version_rule(
        &self,
        app_id: &str,
        service_name: &str,
        rule: &str,
    ) -> ConsumerResult<Arc<MicroserviceVersionRule>> {
        self.get_or_create_microservice_versions(app_id, service_name)
            .await
            .get_or_create_version_rule(rule)
            .await
    }

    fn snapshot(&self) -> Vec<Arc<MicroserviceVersions>> {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn remove_if_same(&self, key: &ServiceKey, versions: &Arc<MicroserviceVersions>) -> bool {
        let mut services = self
            .services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match services.get(key) {
            Some(current) if Arc::ptr_eq(current, versions) => {
                services.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Pull every entry, then garbage-collect those waiting for deletion.
    pub async fn pull_instances(&self) {
        let all = self.snapshot();
        debug!(services = all.len(), "pulling instances");
        for versions in &all {
            versions.pull_instances().await;
        }

        for versions in all {
            if !versions.is_waiting_delete() {
                continue;
            }
            let key = (
                versions.app_id().to_string(),
                versions.service_name().to_string(),
            );
            if self.remove_if_same(&key, &versions) {
                info!(app_id = %key.0, service = %key.1, "removing deleted microservice");
                versions.destroy().await;
            }
        }
    }

    pub async fn on_instance_changed(&self, event: InstanceChangedEvent) {
        for versions in self.snapshot() {
            versions.on_microservice_instance_changed(&event).await;
        }
    }

    /// Applies to every current entry and to entries created later.
    pub fn on_safe_mode_changed(&self, enabled: bool) {
        let previous = self.safe_mode.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(enabled, "registry safe mode changed");
        }
        for versions in self.snapshot() {
            versions.on_safe_mode_changed(enabled);
        }
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn destroy(&self) {
        let drained: Vec<Arc<MicroserviceVersions>> = {
            let mut services = self
                .services
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            services.drain().map(|(_, v)| v).collect()
        };
        for versions in drained {
            versions.destroy().await;
        }
    }
}
