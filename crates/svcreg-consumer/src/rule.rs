//! Derived view of one version rule over a service's versions.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use svcreg_client::AddressSource;
use svcreg_core::{MicroserviceInstance, VersionRule};

use crate::rule_data::{InstanceMap, MicroserviceVersionRuleData, VersionMap};
use crate::version::MicroserviceVersion;

pub struct MicroserviceVersionRule {
    app_id: String,
    service_name: String,
    rule: VersionRule,
    data: ArcSwap<MicroserviceVersionRuleData>,
}

impl MicroserviceVersionRule {
    pub fn new(app_id: &str, service_name: &str, rule: VersionRule) -> Self {
        let data = MicroserviceVersionRuleData::empty(app_id, service_name, rule.as_str());
        Self {
            app_id: app_id.to_string(),
            service_name: service_name.to_string(),
            rule,
            data: ArcSwap::from_pointee(data),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn rule(&self) -> &VersionRule {
        &self.rule
    }

    /// The published snapshot. A single atomic load; never blocks.
    pub fn data(&self) -> Arc<MicroserviceVersionRuleData> {
        self.data.load_full()
    }

    /// Rebuild the snapshot from the full version and instance sets and
    /// publish it.
    pub fn update(&self, versions: &VersionMap, instances: &[Arc<MicroserviceInstance>]) {
        let data = self.resolve(versions, instances);

        let ids: Vec<&str> = data.instances().keys().map(String::as_str).collect();
        info!(
            app_id = %self.app_id,
            service = %self.service_name,
            rule = %self.rule,
            latest = ?data.latest_version().map(|v| v.version().to_string()),
            instances = ?ids,
            "version rule updated"
        );

        self.data.store(Arc::new(data));
    }

    /// Pure resolution of this rule against (versions, instances).
    pub fn resolve(
        &self,
        versions: &VersionMap,
        instances: &[Arc<MicroserviceInstance>],
    ) -> MicroserviceVersionRuleData {
        let selected: VersionMap = if self.rule.is_latest() {
            match find_latest(versions, instances) {
                Some(latest) => {
                    let mut only = VersionMap::new();
                    only.insert(latest.service_id().to_string(), latest);
                    only
                }
                None => VersionMap::new(),
            }
        } else {
            versions
                .iter()
                .filter(|(_, v)| self.rule.is_accept(&v.version()))
                .map(|(id, v)| (id.clone(), Arc::clone(v)))
                .collect()
        };

        if selected.is_empty() {
            return MicroserviceVersionRuleData::empty(
                &self.app_id,
                &self.service_name,
                self.rule.as_str(),
            );
        }

        let matched: InstanceMap = instances
            .iter()
            .filter(|i| selected.contains_key(i.owner()))
            .map(|i| (i.id().to_string(), Arc::clone(i)))
            .collect();
        let matched_list: Vec<Arc<MicroserviceInstance>> = matched.values().cloned().collect();
        let latest = find_latest(&selected, &matched_list);

        MicroserviceVersionRuleData::new(
            &self.app_id,
            &self.service_name,
            self.rule.as_str(),
            latest,
            selected,
            matched,
        )
    }

    pub fn destroy(&self) {
        self.data.store(Arc::new(MicroserviceVersionRuleData::empty(
            &self.app_id,
            &self.service_name,
            self.rule.as_str(),
        )));
    }
}

/// Endpoints of every instance in the current snapshot, in instance id
/// order. Lets a rule over the registry's own service feed address
/// rotation.
impl AddressSource for MicroserviceVersionRule {
    fn addresses(&self) -> Vec<String> {
        self.data()
            .instances()
            .values()
            .flat_map(|i| i.endpoints.iter().cloned())
            .collect()
    }
}

/// Highest version among those that currently have instances; when no
/// instance exists at all, the highest version known.
pub fn find_latest(
    versions: &VersionMap,
    instances: &[Arc<MicroserviceInstance>],
) -> Option<Arc<MicroserviceVersion>> {
    if instances.is_empty() {
        return versions.values().max_by_key(|v| v.version()).cloned();
    }
    instances
        .iter()
        .filter_map(|i| versions.get(i.owner()))
        .max_by_key(|v| v.version())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use svcreg_core::Microservice;

    fn version(service_id: &str, v: &str) -> (String, Arc<MicroserviceVersion>) {
        let mut ms = Microservice::new("app", "orders", v);
        ms.service_id = Some(service_id.to_string());
        (
            service_id.to_string(),
            Arc::new(MicroserviceVersion::from_microservice(ms).unwrap()),
        )
    }

    fn instance(id: &str, service_id: &str) -> Arc<MicroserviceInstance> {
        Arc::new(MicroserviceInstance {
            instance_id: Some(id.to_string()),
            service_id: Some(service_id.to_string()),
            endpoints: vec![format!("rest://{id}:8080")],
            ..Default::default()
        })
    }

    fn versions() -> VersionMap {
        [version("s100", "1.0.0"), version("s110", "1.1.0"), version("s200", "2.0.0")]
            .into_iter()
            .collect()
    }

    fn rule(text: &str) -> MicroserviceVersionRule {
        MicroserviceVersionRule::new("app", "orders", VersionRule::parse(text).unwrap())
    }

    #[test]
    fn latest_picks_highest_version_with_instances() {
        let instances = vec![instance("a", "s110"), instance("b", "s200"), instance("c", "s200")];
        let latest = rule("latest");
        latest.update(&versions(), &instances);

        let data = latest.data();
        assert_eq!(data.latest_version().unwrap().service_id(), "s200");
        assert_eq!(data.versions().keys().collect::<Vec<_>>(), vec!["s200"]);
        assert_eq!(data.instances().keys().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn latest_ignores_higher_versions_without_instances() {
        let instances = vec![instance("a", "s100"), instance("b", "s110")];
        let latest = rule("latest");
        latest.update(&versions(), &instances);
        assert_eq!(latest.data().latest_version().unwrap().service_id(), "s110");
    }

    #[test]
    fn latest_without_instances_falls_back_to_highest_known() {
        let latest = rule("latest");
        latest.update(&versions(), &[]);
        let data = latest.data();
        assert_eq!(data.latest_version().unwrap().service_id(), "s200");
        assert!(data.instances().is_empty());
    }

    #[test]
    fn no_versions_gives_empty_snapshot() {
        let latest = rule("latest");
        latest.update(&VersionMap::new(), &[]);
        assert!(latest.data().latest_version().is_none());
        assert!(latest.data().versions().is_empty());
    }

    #[test]
    fn range_rule_filters_versions_and_instances() {
        let instances = vec![instance("a", "s100"), instance("b", "s110"), instance("c", "s200")];
        let range = rule("1.0.0-2.0.0");
        range.update(&versions(), &instances);

        let data = range.data();
        assert_eq!(data.versions().keys().collect::<Vec<_>>(), vec!["s100", "s110"]);
        assert_eq!(data.instances().keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(data.latest_version().unwrap().service_id(), "s110");
    }

    #[test]
    fn unmatched_rule_gives_empty_snapshot() {
        let fixed = rule("3.0.0");
        fixed.update(&versions(), &[instance("a", "s100")]);
        assert!(fixed.data().versions().is_empty());
        assert!(fixed.data().instances().is_empty());
    }

    #[test]
    fn resolve_is_deterministic() {
        let versions = versions();
        let instances = vec![instance("b", "s200"), instance("a", "s110")];
        let all = rule("0+");
        let first = all.resolve(&versions, &instances);
        let second = all.resolve(&versions, &instances);
        assert_eq!(first, second);
    }

    #[test]
    fn readers_keep_old_snapshot() {
        let all = rule("0+");
        all.update(&versions(), &[instance("a", "s100")]);
        let before = all.data();

        all.update(&versions(), &[instance("a", "s100"), instance("b", "s200")]);
        assert_eq!(before.instances().len(), 1);
        assert_eq!(all.data().instances().len(), 2);
        assert!(all
            .data()
            .versioned_cache()
            .is_newer_than(before.versioned_cache()));
    }

    #[test]
    fn address_source_lists_endpoints() {
        let all = rule("0+");
        all.update(&versions(), &[instance("b", "s200"), instance("a", "s100")]);
        assert_eq!(all.addresses(), vec!["rest://a:8080", "rest://b:8080"]);

        all.destroy();
        assert!(all.addresses().is_empty());
    }
}
