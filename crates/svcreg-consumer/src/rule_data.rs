//! Immutable per-rule snapshot.
//!
//! A `MicroserviceVersionRuleData` is built once from a (versions,
//! instances) pair and never mutated afterwards; a rule publishes a new
//! one by swapping its pointer. Readers holding an old snapshot keep a
//! consistent view for as long as they hold it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use svcreg_core::MicroserviceInstance;

use crate::version::MicroserviceVersion;

/// instance id → instance, ordered by id.
pub type InstanceMap = BTreeMap<String, Arc<MicroserviceInstance>>;

/// service id → version.
pub type VersionMap = BTreeMap<String, Arc<MicroserviceVersion>>;

static NEXT_CACHE_VERSION: AtomicU64 = AtomicU64::new(1);

/// Instances of one rule with their endpoints grouped by transport.
#[derive(Debug, Clone, Default)]
pub struct InstanceCache {
    pub app_id: String,
    pub service_name: String,
    pub version_rule: String,
    instances: Arc<InstanceMap>,
    /// transport scheme (`rest`, `highway`, ...) → endpoint URIs
    endpoints: BTreeMap<String, Vec<String>>,
}

impl InstanceCache {
    pub fn new(
        app_id: &str,
        service_name: &str,
        version_rule: &str,
        instances: Arc<InstanceMap>,
    ) -> Self {
        let mut endpoints: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for instance in instances.values() {
            for endpoint in &instance.endpoints {
                let Some((scheme, _)) = endpoint.split_once("://") else {
                    continue;
                };
                endpoints
                    .entry(scheme.to_string())
                    .or_default()
                    .push(endpoint.clone());
            }
        }
        Self {
            app_id: app_id.to_string(),
            service_name: service_name.to_string(),
            version_rule: version_rule.to_string(),
            instances,
            endpoints,
        }
    }

    pub fn instances(&self) -> &InstanceMap {
        &self.instances
    }

    /// Endpoints for `transport`; empty when none publish it.
    pub fn endpoints(&self, transport: &str) -> &[String] {
        self.endpoints
            .get(transport)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn transports(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}

/// A named instance map stamped with a process-wide cache version.
///
/// Every construction takes a fresh, strictly larger version, so a load
/// balancer can tell a new snapshot from one it has already seen.
#[derive(Debug, Clone)]
pub struct VersionedCache {
    name: String,
    cache_version: u64,
    data: Arc<InstanceMap>,
}

impl VersionedCache {
    pub fn new(name: &str, data: Arc<InstanceMap>) -> Self {
        Self {
            name: name.to_string(),
            cache_version: NEXT_CACHE_VERSION.fetch_add(1, Ordering::Relaxed),
            data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_version(&self) -> u64 {
        self.cache_version
    }

    pub fn data(&self) -> &InstanceMap {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_newer_than(&self, other: &VersionedCache) -> bool {
        self.cache_version > other.cache_version
    }
}

pub struct MicroserviceVersionRuleData {
    latest_version: Option<Arc<MicroserviceVersion>>,
    versions: VersionMap,
    instances: Arc<InstanceMap>,
    instance_cache: InstanceCache,
    versioned_cache: VersionedCache,
}

impl MicroserviceVersionRuleData {
    pub fn new(
        app_id: &str,
        service_name: &str,
        version_rule: &str,
        latest_version: Option<Arc<MicroserviceVersion>>,
        versions: VersionMap,
        instances: InstanceMap,
    ) -> Self {
        let instances = Arc::new(instances);
        Self {
            latest_version,
            versions,
            instance_cache: InstanceCache::new(
                app_id,
                service_name,
                version_rule,
                Arc::clone(&instances),
            ),
            versioned_cache: VersionedCache::new(version_rule, Arc::clone(&instances)),
            instances,
        }
    }

    pub fn empty(app_id: &str, service_name: &str, version_rule: &str) -> Self {
        Self::new(
            app_id,
            service_name,
            version_rule,
            None,
            VersionMap::new(),
            InstanceMap::new(),
        )
    }

    pub fn latest_version(&self) -> Option<&Arc<MicroserviceVersion>> {
        self.latest_version.as_ref()
    }

    pub fn versions(&self) -> &VersionMap {
        &self.versions
    }

    pub fn instances(&self) -> &InstanceMap {
        &self.instances
    }

    pub fn instance_cache(&self) -> &InstanceCache {
        &self.instance_cache
    }

    pub fn versioned_cache(&self) -> &VersionedCache {
        &self.versioned_cache
    }
}

/// Equal when the resolved content is equal. The cache version stamp is
/// not content and is ignored.
impl PartialEq for MicroserviceVersionRuleData {
    fn eq(&self, other: &Self) -> bool {
        self.latest_version.as_ref().map(|v| v.service_id())
            == other.latest_version.as_ref().map(|v| v.service_id())
            && self.versions.keys().eq(other.versions.keys())
            && self.instances == other.instances
    }
}

impl std::fmt::Debug for MicroserviceVersionRuleData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroserviceVersionRuleData")
            .field(
                "latest_version",
                &self.latest_version.as_ref().map(|v| v.version().to_string()),
            )
            .field("versions", &self.versions.keys().collect::<Vec<_>>())
            .field("instances", &self.instances.keys().collect::<Vec<_>>())
            .field("cache_version", &self.versioned_cache.cache_version)
            .finish()
    }
}
