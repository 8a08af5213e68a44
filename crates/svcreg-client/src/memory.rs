//! In-process registry.
//!
//! Implements `RegistryClient` over plain maps so the whole client can
//! run without a registry server. Every instance mutation bumps the
//! revision. Availability can be toggled to simulate an unreachable
//! registry, and watch listeners can be driven by hand.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use svcreg_core::{
    schema_summary, InstanceChangedEvent, Microservice, MicroserviceInstance, Version,
    VersionRule,
};

use crate::client::{
    HeartbeatResponse, MicroserviceInstances, RegistryClient, SchemaSummary, WatchListener,
};
use crate::error::{RegistryError, RegistryResult};

#[derive(Default)]
struct Tables {
    microservices: HashMap<String, Microservice>,
    /// (service_id, schema_id) → content
    schemas: HashMap<(String, String), String>,
    instances: BTreeMap<String, MicroserviceInstance>,
    watchers: Vec<(String, Arc<dyn WatchListener>)>,
    revision: u64,
    next_id: u64,
}

impl Tables {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn bump_revision(&mut self) {
        self.revision += 1;
    }
}

#[derive(Default)]
pub struct InMemoryRegistry {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    find_calls: AtomicU64,
    heartbeat_calls: AtomicU64,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> RegistryResult<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(RegistryError::Unavailable("in-memory registry is offline".to_string()));
        }
        Ok(())
    }

    /// Make every facade call fail (`false`) or succeed again (`true`).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
        info!(available, "in-memory registry availability changed");
    }

    /// Insert a microservice record directly; returns its service id.
    pub fn add_microservice(&self, microservice: &Microservice) -> String {
        let mut tables = self.tables();
        let service_id = microservice
            .service_id
            .clone()
            .unwrap_or_else(|| tables.next_id("svc"));
        let mut record = microservice.clone();
        record.service_id = Some(service_id.clone());
        record.schema_contents.clear();
        record.instance = MicroserviceInstance::default();
        tables.microservices.insert(service_id.clone(), record);
        service_id
    }

    /// Remove a microservice and all of its instances.
    pub fn remove_microservice(&self, service_id: &str) -> bool {
        let mut tables = self.tables();
        let existed = tables.microservices.remove(service_id).is_some();
        tables.instances.retain(|_, i| i.owner() != service_id);
        tables.schemas.retain(|(sid, _), _| sid != service_id);
        tables.bump_revision();
        existed
    }

    /// Insert or replace an instance directly; returns its instance id.
    pub fn add_instance(&self, instance: &MicroserviceInstance) -> String {
        let mut tables = self.tables();
        let instance_id = instance
            .instance_id
            .clone()
            .unwrap_or_else(|| tables.next_id("inst"));
        let mut record = instance.clone();
        record.instance_id = Some(instance_id.clone());
        tables.instances.insert(instance_id.clone(), record);
        tables.bump_revision();
        instance_id
    }

    pub fn remove_instance(&self, instance_id: &str) -> bool {
        let mut tables = self.tables();
        let existed = tables.instances.remove(instance_id).is_some();
        if existed {
            tables.bump_revision();
        }
        existed
    }

    /// Store schema content as if another process had registered it.
    pub fn set_schema(&self, service_id: &str, schema_id: &str, content: &str) {
        let mut tables = self.tables();
        if let Some(ms) = tables.microservices.get_mut(service_id) {
            ms.schemas.insert(schema_id.to_string());
        }
        tables
            .schemas
            .insert((service_id.to_string(), schema_id.to_string()), content.to_string());
    }

    pub fn schema(&self, service_id: &str, schema_id: &str) -> Option<String> {
        self.tables()
            .schemas
            .get(&(service_id.to_string(), schema_id.to_string()))
            .cloned()
    }

    pub fn microservice(&self, service_id: &str) -> Option<Microservice> {
        self.tables().microservices.get(service_id).cloned()
    }

    pub fn microservice_count(&self) -> usize {
        self.tables().microservices.len()
    }

    pub fn instance(&self, instance_id: &str) -> Option<MicroserviceInstance> {
        self.tables().instances.get(instance_id).cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.tables().instances.len()
    }

    pub fn revision(&self) -> String {
        self.tables().revision.to_string()
    }

    pub fn find_calls(&self) -> u64 {
        self.find_calls.load(Ordering::Relaxed)
    }

    pub fn heartbeat_calls(&self) -> u64 {
        self.heartbeat_calls.load(Ordering::Relaxed)
    }

    pub fn watcher_count(&self) -> usize {
        self.tables().watchers.len()
    }

    /// Deliver `event` to every open watch.
    pub fn notify_watchers(&self, event: &InstanceChangedEvent) {
        for listener in self.listeners() {
            listener.on_event(Ok(event.clone()));
        }
    }

    /// Break every open watch with a stream error. Broken streams are
    /// dropped, as a real transport would.
    pub fn fail_watchers(&self, message: &str) {
        let watchers = std::mem::take(&mut self.tables().watchers);
        for (_, listener) in watchers {
            listener.on_event(Err(RegistryError::Watch(message.to_string())));
        }
    }

    /// Close every open watch.
    pub fn close_watchers(&self) {
        let watchers = std::mem::take(&mut self.tables().watchers);
        for (_, listener) in watchers {
            listener.on_close();
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn WatchListener>> {
        self.tables()
            .watchers
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn find_service_instances(
        &self,
        app_id: &str,
        service_name: &str,
        version_rule: &str,
        _revision: Option<&str>,
    ) -> RegistryResult<Option<MicroserviceInstances>> {
        self.find_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let rule = VersionRule::parse(version_rule).map_err(|e| RegistryError::Rejected {
            status: 400,
            message: e.to_string(),
        })?;

        let tables = self.tables();
        let candidates: Vec<(&String, Version)> = tables
            .microservices
            .iter()
            .filter(|(_, ms)| ms.app_id == app_id && ms.service_name == service_name)
            .filter_map(|(id, ms)| Version::parse(&ms.version).ok().map(|v| (id, v)))
            .collect();
        if candidates.is_empty() {
            return Ok(Some(MicroserviceInstances::not_exist()));
        }

        let selected: Vec<&String> = if rule.is_latest() {
            candidates
                .iter()
                .max_by_key(|(_, v)| *v)
                .map(|(id, _)| *id)
                .into_iter()
                .collect()
        } else {
            candidates
                .iter()
                .filter(|(_, v)| rule.is_accept(v))
                .map(|(id, _)| *id)
                .collect()
        };

        let instances = tables
            .instances
            .values()
            .filter(|i| selected.iter().any(|id| id.as_str() == i.owner()))
            .cloned()
            .collect();

        Ok(Some(MicroserviceInstances {
            revision: Some(tables.revision.to_string()),
            instances,
            microservice_not_exist: false,
        }))
    }

    async fn get_microservice_id(
        &self,
        app_id: &str,
        service_name: &str,
        version: &str,
        environment: &str,
    ) -> RegistryResult<Option<String>> {
        self.check_available()?;
        let tables = self.tables();
        Ok(tables
            .microservices
            .iter()
            .find(|(_, ms)| {
                ms.app_id == app_id
                    && ms.service_name == service_name
                    && ms.version == version
                    && ms.environment == environment
            })
            .map(|(id, _)| id.clone()))
    }

    async fn get_microservice(&self, service_id: &str) -> RegistryResult<Option<Microservice>> {
        self.check_available()?;
        Ok(self.microservice(service_id))
    }

    async fn register_microservice(
        &self,
        microservice: &Microservice,
    ) -> RegistryResult<Option<String>> {
        self.check_available()?;
        let existing = self
            .get_microservice_id(
                &microservice.app_id,
                &microservice.service_name,
                &microservice.version,
                &microservice.environment,
            )
            .await?;
        if existing.is_some() {
            return Ok(existing);
        }

        let mut record = microservice.clone();
        record.service_id = None;
        let service_id = self.add_microservice(&record);
        debug!(%service_id, service = %microservice.service_name, "microservice registered");
        Ok(Some(service_id))
    }

    async fn register_instance(
        &self,
        instance: &MicroserviceInstance,
    ) -> RegistryResult<Option<String>> {
        self.check_available()?;
        if self.microservice(instance.owner()).is_none() {
            return Err(RegistryError::Rejected {
                status: 400,
                message: format!("microservice {} does not exist", instance.owner()),
            });
        }
        let instance_id = self.add_instance(instance);
        debug!(%instance_id, service_id = %instance.owner(), "instance registered");
        Ok(Some(instance_id))
    }

    async fn heartbeat(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> RegistryResult<Option<HeartbeatResponse>> {
        self.heartbeat_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        let ok = self
            .tables()
            .instances
            .get(instance_id)
            .is_some_and(|i| i.owner() == service_id);
        Ok(Some(HeartbeatResponse { ok }))
    }

    async fn watch(
        &self,
        service_id: &str,
        listener: Arc<dyn WatchListener>,
    ) -> RegistryResult<()> {
        self.check_available()?;
        self.tables()
            .watchers
            .push((service_id.to_string(), Arc::clone(&listener)));
        listener.on_open();
        Ok(())
    }

    async fn stop_watch(&self, service_id: &str) {
        let stopped: Vec<Arc<dyn WatchListener>> = {
            let mut tables = self.tables();
            let (stopped, kept) = std::mem::take(&mut tables.watchers)
                .into_iter()
                .partition(|(sid, _)| sid == service_id);
            tables.watchers = kept;
            stopped.into_iter().map(|(_, l)| l).collect()
        };
        for listener in stopped {
            listener.on_close();
        }
    }

    async fn is_schema_exist(&self, service_id: &str, schema_id: &str) -> RegistryResult<bool> {
        self.check_available()?;
        Ok(self.schema(service_id, schema_id).is_some())
    }

    async fn register_schema(
        &self,
        service_id: &str,
        schema_id: &str,
        content: &str,
    ) -> RegistryResult<bool> {
        self.check_available()?;
        if self.microservice(service_id).is_none() {
            return Ok(false);
        }
        self.set_schema(service_id, schema_id, content);
        Ok(true)
    }

    async fn get_schema_summaries(&self, service_id: &str) -> RegistryResult<Vec<SchemaSummary>> {
        self.check_available()?;
        let tables = self.tables();
        let Some(ms) = tables.microservices.get(service_id) else {
            return Err(RegistryError::Rejected {
                status: 404,
                message: format!("microservice {service_id} does not exist"),
            });
        };
        Ok(ms
            .schemas
            .iter()
            .map(|schema_id| SchemaSummary {
                schema_id: schema_id.clone(),
                summary: tables
                    .schemas
                    .get(&(service_id.to_string(), schema_id.clone()))
                    .map(|content| schema_summary(content)),
            })
            .collect())
    }

    async fn get_schema(
        &self,
        service_id: &str,
        schema_id: &str,
    ) -> RegistryResult<Option<String>> {
        self.check_available()?;
        Ok(self.schema(service_id, schema_id))
    }
}
