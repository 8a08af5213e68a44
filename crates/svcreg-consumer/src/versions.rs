//! Authoritative instance state for one (app, service).
//!
//! `MicroserviceVersions` owns every `MicroserviceVersion` and
//! `MicroserviceVersionRule` of its service. All mutation (pulls, rule
//! creation) is serialized by one async mutex; rule snapshots are read
//! without it.
//!
//! A pull never applies a watch delta. A relevant watch event only
//! triggers a fresh pull, so push/poll ordering cannot lose updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use svcreg_client::RegistryContext;
use svcreg_core::{
    InstanceChangedEvent, MicroserviceInstance, MicroserviceKey, RegistryEvent, VersionRule,
};

use crate::error::ConsumerResult;
use crate::rule::MicroserviceVersionRule;
use crate::rule_data::VersionMap;
use crate::version::MicroserviceVersion;

type RuleMap = HashMap<String, Arc<MicroserviceVersionRule>>;

#[derive(Default)]
struct PullState {
    versions: VersionMap,
    revision: Option<String>,
}

pub struct MicroserviceVersions {
    ctx: RegistryContext,
    app_id: String,
    service_name: String,
    state: Mutex<PullState>,
    /// Instances currently in use, sorted by instance id.
    pulled: ArcSwap<Vec<Arc<MicroserviceInstance>>>,
    rules: ArcSwap<RuleMap>,
    safe_mode: AtomicBool,
    waiting_delete: AtomicBool,
    last_pull_time: StdMutex<Option<Instant>>,
}

impl MicroserviceVersions {
    pub fn new(ctx: RegistryContext, app_id: &str, service_name: &str) -> Self {
        Self {
            ctx,
            app_id: app_id.to_string(),
            service_name: service_name.to_string(),
            state: Mutex::new(PullState::default()),
            pulled: ArcSwap::from_pointee(Vec::new()),
            rules: ArcSwap::from_pointee(RuleMap::new()),
            safe_mode: AtomicBool::new(false),
            waiting_delete: AtomicBool::new(false),
            last_pull_time: StdMutex::new(None),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Set once the registry reports the service gone, or applying a
    /// pull failed. The owner garbage-collects such entries.
    pub fn is_waiting_delete(&self) -> bool {
        self.waiting_delete.load(Ordering::Acquire)
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Acquire)
    }

    pub fn pulled_instances(&self) -> Arc<Vec<Arc<MicroserviceInstance>>> {
        self.pulled.load_full()
    }

    pub fn last_pull_time(&self) -> Option<Instant> {
        *self
            .last_pull_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn revision(&self) -> Option<String> {
        self.state.lock().await.revision.clone()
    }

    pub async fn versions(&self) -> VersionMap {
        self.state.lock().await.versions.clone()
    }

    /// Rules created so far, keyed by normalized rule text.
    pub fn version_rules(&self) -> Arc<HashMap<String, Arc<MicroserviceVersionRule>>> {
        self.rules.load_full()
    }

    /// Fetch every instance of this service and apply the result.
    ///
    /// Failures leave the current view untouched; a "microservice does
    /// not exist" answer marks this entry for deletion; an unchanged
    /// revision is a no-op.
    pub async fn pull_instances(&self) {
        let mut state = self.state.lock().await;
        *self
            .last_pull_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());

        let reply = match self
            .ctx
            .client
            .find_service_instances(
                &self.app_id,
                &self.service_name,
                VersionRule::ALL,
                state.revision.as_deref(),
            )
            .await
        {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                debug!(app_id = %self.app_id, service = %self.service_name, "pull returned nothing");
                return;
            }
            Err(e) => {
                warn!(
                    app_id = %self.app_id,
                    service = %self.service_name,
                    error = %e,
                    "failed to pull instances, keeping last known view"
                );
                return;
            }
        };

        if reply.microservice_not_exist {
            info!(
                app_id = %self.app_id,
                service = %self.service_name,
                "microservice no longer exists, marking for deletion"
            );
            self.waiting_delete.store(true, Ordering::Release);
            return;
        }

        if reply.revision.is_some() && reply.revision == state.revision {
            debug!(app_id = %self.app_id, service = %self.service_name, "revision unchanged");
            return;
        }

        let mut instances = reply.instances;
        instances.sort_by(|a, b| a.id().cmp(b.id()));
        self.safe_set_instances(&mut state, instances, reply.revision)
            .await;
    }

    async fn safe_set_instances(
        &self,
        state: &mut PullState,
        pulled: Vec<MicroserviceInstance>,
        revision: Option<String>,
    ) {
        if let Err(e) = self.set_instances(state, pulled, revision).await {
            error!(
                app_id = %self.app_id,
                service = %self.service_name,
                error = %e,
                "failed to apply pulled instances, marking for deletion"
            );
            self.waiting_delete.store(true, Ordering::Release);
        }
    }

    async fn set_instances(
        &self,
        state: &mut PullState,
        pulled: Vec<MicroserviceInstance>,
        revision: Option<String>,
    ) -> ConsumerResult<()> {
        let pulled = pulled.into_iter().map(Arc::new).collect();
        let in_use = self.pulled.load_full();
        let merged = self.merge_instances(pulled, &in_use).await;

        let mut groups: BTreeMap<String, Vec<Arc<MicroserviceInstance>>> = BTreeMap::new();
        for instance in &merged {
            groups
                .entry(instance.owner().to_string())
                .or_default()
                .push(Arc::clone(instance));
        }

        // Nothing is published until every owner resolves.
        let mut created = VersionMap::new();
        for service_id in groups.keys() {
            if !state.versions.contains_key(service_id) {
                let version =
                    MicroserviceVersion::create(self.ctx.client.as_ref(), service_id).await?;
                created.insert(service_id.clone(), Arc::new(version));
            }
        }
        state.versions.extend(created);

        for (service_id, version) in &state.versions {
            version.set_instances(groups.remove(service_id).unwrap_or_default());
        }

        for rule in self.rules.load().values() {
            rule.update(&state.versions, &merged);
        }

        debug!(
            app_id = %self.app_id,
            service = %self.service_name,
            revision = ?revision,
            instances = merged.len(),
            "instances updated"
        );
        self.pulled.store(Arc::new(merged));
        state.revision = revision;
        Ok(())
    }

    /// Combine a pull with the instances in use.
    ///
    /// In safe mode nothing is ever dropped. Otherwise an empty pull,
    /// with protection on, keeps each known instance that still answers a
    /// ping. Any other pull is taken as is.
    async fn merge_instances(
        &self,
        pulled: Vec<Arc<MicroserviceInstance>>,
        in_use: &[Arc<MicroserviceInstance>],
    ) -> Vec<Arc<MicroserviceInstance>> {
        let mut merged = pulled;

        if self.is_safe_mode() {
            for instance in in_use {
                if !merged.iter().any(|m| m.id() == instance.id()) {
                    debug!(instance_id = %instance.id(), "safe mode, keeping instance");
                    merged.push(Arc::clone(instance));
                }
            }
        } else if merged.is_empty()
            && self.ctx.config.empty_instance_protection
            && !in_use.is_empty()
        {
            for instance in in_use {
                if self.ctx.ping.ping(instance).await {
                    info!(
                        instance_id = %instance.id(),
                        endpoints = ?instance.endpoints,
                        "empty pull, instance still reachable, keeping it"
                    );
                    merged.push(Arc::clone(instance));
                } else {
                    info!(instance_id = %instance.id(), "empty pull, dropping unreachable instance");
                }
            }
        }

        merged.sort_by(|a, b| a.id().cmp(b.id()));
        merged
    }

    /// Rule for `rule_text`, created and seeded from the current state
    /// on first use.
    pub async fn get_or_create_version_rule(
        &self,
        rule_text: &str,
    ) -> ConsumerResult<Arc<MicroserviceVersionRule>> {
        let rule = VersionRule::parse(rule_text)?;
        if let Some(existing) = self.rules.load().get(rule.as_str()) {
            return Ok(Arc::clone(existing));
        }

        let state = self.state.lock().await;
        if let Some(existing) = self.rules.load().get(rule.as_str()) {
            return Ok(Arc::clone(existing));
        }

        let key = rule.as_str().to_string();
        let created = Arc::new(MicroserviceVersionRule::new(
            &self.app_id,
            &self.service_name,
            rule,
        ));
        created.update(&state.versions, &self.pulled.load());

        let mut rules = RuleMap::clone(&self.rules.load());
        rules.insert(key, Arc::clone(&created));
        self.rules.store(Arc::new(rules));
        Ok(created)
    }

    /// Whether a watch key names this service.
    ///
    /// A cross-app consumer is created with the qualified `app:service`
    /// name, so its own name is compared against the key's absolute name.
    pub fn is_event_accept(&self, key: &MicroserviceKey) -> bool {
        (key.app_id == self.app_id && key.service_name == self.service_name)
            || self.service_name == key.absolute_name()
    }

    /// React to a watch push about any service: re-pull when it is ours.
    pub async fn on_microservice_instance_changed(&self, event: &InstanceChangedEvent) {
        if !self.is_event_accept(&event.key) {
            return;
        }
        debug!(
            app_id = %self.app_id,
            service = %self.service_name,
            action = ?event.action,
            "instance change pushed, pulling"
        );
        self.pull_instances().await;
    }

    pub fn on_safe_mode_changed(&self, enabled: bool) {
        self.safe_mode.store(enabled, Ordering::Release);
    }

    /// Tear down every owned version and rule, then announce the removal.
    pub async fn destroy(&self) {
        let state = self.state.lock().await;
        for version in state.versions.values() {
            version.destroy();
        }
        for rule in self.rules.load().values() {
            rule.destroy();
        }
        self.pulled.store(Arc::new(Vec::new()));

        info!(app_id = %self.app_id, service = %self.service_name, "microservice versions destroyed");
        self.ctx.bus.post(&RegistryEvent::MicroserviceDestroyed {
            app_id: self.app_id.clone(),
            service_name: self.service_name.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use svcreg_client::{InMemoryRegistry, InstancePing};
    use svcreg_core::{EventKind, Microservice, RegistryConfig, WatchAction};

    /// Answers pings from a fixed set of live instance ids.
    #[derive(Default)]
    struct FakePing {
        alive: StdMutex<HashSet<String>>,
        calls: AtomicUsize,
    }

    impl FakePing {
        fn set_alive(&self, ids: &[&str]) {
            *self.alive.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
        }
    }

    #[async_trait]
    impl InstancePing for FakePing {
        async fn ping(&self, instance: &MicroserviceInstance) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.alive.lock().unwrap().contains(instance.id())
        }
    }

    struct Fixture {
        registry: Arc<InMemoryRegistry>,
        ping: Arc<FakePing>,
        versions: MicroserviceVersions,
        ctx: RegistryContext,
    }

    fn fixture(config: RegistryConfig) -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new());
        let ping = Arc::new(FakePing::default());
        let ctx = RegistryContext::new(config, registry.clone()).with_ping(ping.clone());
        let versions = MicroserviceVersions::new(ctx.clone(), "app", "orders");
        Fixture {
            registry,
            ping,
            versions,
            ctx,
        }
    }

    fn add_service(registry: &InMemoryRegistry, version: &str) -> String {
        registry.add_microservice(&Microservice::new("app", "orders", version))
    }

    fn add_instance(registry: &InMemoryRegistry, id: &str, service_id: &str) {
        registry.add_instance(&MicroserviceInstance {
            instance_id: Some(id.to_string()),
            service_id: Some(service_id.to_string()),
            endpoints: vec![format!("rest://{id}:8080")],
            ..Default::default()
        });
    }

    fn ids(instances: &[Arc<MicroserviceInstance>]) -> Vec<String> {
        instances.iter().map(|i| i.id().to_string()).collect()
    }

    #[tokio::test]
    async fn pull_sorts_and_groups_instances() {
        let f = fixture(RegistryConfig::default());
        let v1 = add_service(&f.registry, "1.0.0");
        let v2 = add_service(&f.registry, "2.0.0");
        add_instance(&f.registry, "i3", &v2);
        add_instance(&f.registry, "i1", &v1);
        add_instance(&f.registry, "i2", &v2);

        f.versions.pull_instances().await;

        assert_eq!(ids(&f.versions.pulled_instances()), vec!["i1", "i2", "i3"]);
        let versions = f.versions.versions().await;
        assert_eq!(versions[&v1].instances().len(), 1);
        assert_eq!(versions[&v2].instances().len(), 2);
        assert_eq!(f.versions.revision().await, Some(f.registry.revision()));
        assert!(f.versions.last_pull_time().is_some());
    }

    #[tokio::test]
    async fn same_revision_is_a_noop() {
        let f = fixture(RegistryConfig::default());
        let v1 = add_service(&f.registry, "1.0.0");
        add_instance(&f.registry, "i1", &v1);

        f.versions.pull_instances().await;
        let first = f.versions.pulled_instances();
        f.versions.pull_instances().await;
        let second = f.versions.pulled_instances();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.registry.find_calls(), 2);
    }

    #[tokio::test]
    async fn failed_pull_keeps_last_view() {
        let f = fixture(RegistryConfig::default());
        let v1 = add_service(&f.registry, "1.0.0");
        add_instance(&f.registry, "i1", &v1);
        f.versions.pull_instances().await;

        f.registry.set_available(false);
        f.versions.pull_instances().await;

        assert_eq!(ids(&f.versions.pulled_instances()), vec!["i1"]);
        assert!(!f.versions.is_waiting_delete());
    }

    #[tokio::test]
    async fn missing_microservice_marks_waiting_delete() {
        let f = fixture(RegistryConfig::default());
        f.versions.pull_instances().await;
        assert!(f.versions.is_waiting_delete());
        assert!(f.versions.pulled_instances().is_empty());
    }

    #[tokio::test]
    async fn unknown_owner_folds_into_waiting_delete() {
        let f = fixture(RegistryConfig::default());
        let ghost = MicroserviceInstance {
            instance_id: Some("i1".to_string()),
            service_id: Some("ghost".to_string()),
            ..Default::default()
        };

        let mut state = f.versions.state.lock().await;
        f.versions
            .safe_set_instances(&mut state, vec![ghost], Some("r1".to_string()))
            .await;
        drop(state);

        assert!(f.versions.is_waiting_delete());
        assert_eq!(f.versions.revision().await, None);
        assert!(f.versions.pulled_instances().is_empty());
    }

    #[tokio::test]
    async fn failed_owner_lookup_publishes_no_versions() {
        let f = fixture(RegistryConfig::default());
        let v1 = add_service(&f.registry, "1.0.0");
        let known = MicroserviceInstance {
            instance_id: Some("a".to_string()),
            service_id: Some(v1.clone()),
            ..Default::default()
        };
        let ghost = MicroserviceInstance {
            instance_id: Some("b".to_string()),
            service_id: Some("zz-ghost".to_string()),
            ..Default::default()
        };

        let mut state = f.versions.state.lock().await;
        f.versions
            .safe_set_instances(&mut state, vec![known, ghost], Some("r1".to_string()))
            .await;
        drop(state);

        assert!(f.versions.is_waiting_delete());
        assert!(f.versions.versions().await.is_empty());
        assert!(f.versions.pulled_instances().is_empty());
    }

    #[tokio::test]
    async fn safe_mode_never_shrinks() {
        let f = fixture(RegistryConfig::default());
        let v1 = add_service(&f.registry, "1.0.0");
        add_instance(&f.registry, "x", &v1);
        add_instance(&f.registry, "y", &v1);
        f.versions.pull_instances().await;

        f.versions.on_safe_mode_changed(true);
        f.registry.remove_instance("x");
        f.versions.pull_instances().await;
        assert_eq!(ids(&f.versions.pulled_instances()), vec!["x", "y"]);

        f.versions.on_safe_mode_changed(false);
        add_instance(&f.registry, "z", &v1);
        f.versions.pull_instances().await;
        assert_eq!(ids(&f.versions.pulled_instances()), vec!["y", "z"]);
    }

    #[tokio::test]
    async fn empty_pull_keeps_reachable_instances() {
        let f = fixture(RegistryConfig::default());
        let v1 = add_service(&f.registry, "1.0.0");
        add_instance(&f.registry, "x", &v1);
        add_instance(&f.registry, "y", &v1);
        f.versions.pull_instances().await;

        f.ping.set_alive(&["x"]);
        f.registry.remove_instance("x");
        f.registry.remove_instance("y");
        f.versions.pull_instances().await;

        assert_eq!(ids(&f.versions.pulled_instances()), vec!["x"]);
        assert_eq!(f.ping.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_pull_drops_unreachable_instances() {
        let f = fixture(RegistryConfig::default());
        let v1 = add_service(&f.registry, "1.0.0");
        add_instance(&f.registry, "x", &v1);
        f.versions.pull_instances().await;

        f.registry.remove_instance("x");
        f.versions.pull_instances().await;
        assert!(f.versions.pulled_instances().is_empty());
    }

    #[tokio::test]
    async fn empty_pull_trusted_without_protection() {
        let config = RegistryConfig {
            empty_instance_protection: false,
            ..Default::default()
        };
        let f = fixture(config);
        let v1 = add_service(&f.registry, "1.0.0");
        add_instance(&f.registry, "x", &v1);
        f.versions.pull_instances().await;

        f.ping.set_alive(&["x"]);
        f.registry.remove_instance("x");
        f.versions.pull_instances().await;

        assert!(f.versions.pulled_instances().is_empty());
        assert_eq!(f.ping.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rules_follow_pulls() {
        let f = fixture(RegistryConfig::default());
        let v1 = add_service(&f.registry, "1.0.0");
        add_instance(&f.registry, "a", &v1);
        f.versions.pull_instances().await;

        let latest = f.versions.get_or_create_version_rule("latest").await.unwrap();
        assert_eq!(latest.data().instances().len(), 1);

        let v2 = add_service(&f.registry, "2.0.0");
        add_instance(&f.registry, "b", &v2);
        f.versions.pull_instances().await;

        let data = latest.data();
        assert_eq!(data.latest_version().unwrap().service_id(), v2);
        assert_eq!(data.instances().keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn rules_are_shared_by_normalized_text() {
        let f = fixture(RegistryConfig::default());
        let a = f.versions.get_or_create_version_rule("1.0").await.unwrap();
        let b = f.versions.get_or_create_version_rule("1.0.0.0").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.versions.version_rules().len(), 1);
        assert!(f.versions.get_or_create_version_rule("1.x").await.is_err());
    }

    #[tokio::test]
    async fn concurrent_rule_creation_yields_one_rule() {
        let f = fixture(RegistryConfig::default());
        let versions = Arc::new(f.versions);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let versions = Arc::clone(&versions);
            handles.push(tokio::spawn(async move {
                versions.get_or_create_version_rule("latest").await.unwrap()
            }));
        }
        let mut rules = Vec::new();
        for handle in handles {
            rules.push(handle.await.unwrap());
        }
        assert!(rules.iter().all(|r| Arc::ptr_eq(r, &rules[0])));
    }

    #[tokio::test]
    async fn watch_events_filtered_by_key() {
        let f = fixture(RegistryConfig::default());
        let v1 = add_service(&f.registry, "1.0.0");
        add_instance(&f.registry, "a", &v1);

        let other = InstanceChangedEvent {
            action: WatchAction::Create,
            key: MicroserviceKey::new("app", "payments", "1.0.0"),
            instance: None,
        };
        f.versions.on_microservice_instance_changed(&other).await;
        assert_eq!(f.registry.find_calls(), 0);

        let ours = InstanceChangedEvent {
            key: MicroserviceKey::new("app", "orders", "1.0.0"),
            ..other.clone()
        };
        f.versions.on_microservice_instance_changed(&ours).await;
        assert_eq!(f.registry.find_calls(), 1);
        assert_eq!(ids(&f.versions.pulled_instances()), vec!["a"]);

        let elsewhere = InstanceChangedEvent {
            key: MicroserviceKey::new("elsewhere", "app:orders", "1.0.0"),
            ..other
        };
        f.versions.on_microservice_instance_changed(&elsewhere).await;
        assert_eq!(f.registry.find_calls(), 1);
    }

    #[test]
    fn cross_app_consumer_accepts_qualified_key() {
        let f = fixture(RegistryConfig::default());
        let cross = MicroserviceVersions::new(f.ctx.clone(), "app", "billing:invoices");

        assert!(cross.is_event_accept(&MicroserviceKey::new("billing", "invoices", "1.0.0")));
        assert!(!cross.is_event_accept(&MicroserviceKey::new("app", "invoices", "1.0.0")));
        assert!(!cross.is_event_accept(&MicroserviceKey::new("billing", "orders", "1.0.0")));
    }

    #[tokio::test]
    async fn destroy_clears_everything_and_posts() {
        let f = fixture(RegistryConfig::default());
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&destroyed);
        f.ctx.bus.subscribe(EventKind::MicroserviceDestroyed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let v1 = add_service(&f.registry, "1.0.0");
        add_instance(&f.registry, "a", &v1);
        f.versions.pull_instances().await;
        let rule = f.versions.get_or_create_version_rule("0+").await.unwrap();
        let versions = f.versions.versions().await;

        f.versions.destroy().await;

        assert!(rule.data().instances().is_empty());
        assert!(versions[&v1].instances().is_empty());
        assert!(f.versions.pulled_instances().is_empty());
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
