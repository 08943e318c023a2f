use mesh_control_core::{
    registry::{CatalogEntry, RegistryInstance},
    ServiceInstance, ServiceInstances,
};
use regex::Regex;
use std::collections::BTreeSet;

/// Maps registry instances to service instances, deriving the canary flag and load balancing
/// weight from instance tags.
#[derive(Clone, Debug)]
pub struct InstanceMapper {
    canary_tag: Option<String>,
    weight: Option<Regex>,
    default_weight: u32,
}

/// Decides which catalog services are watched at all.
#[derive(Clone, Debug, Default)]
pub struct WatchPolicy {
    excluded_tags: BTreeSet<String>,
}

// === impl InstanceMapper ===

impl InstanceMapper {
    /// Empty tag names disable canary detection and weight tags respectively.
    pub fn new(
        canary_tag: &str,
        weight_tag: &str,
        default_weight: u32,
    ) -> Result<Self, regex::Error> {
        let weight = if weight_tag.is_empty() {
            None
        } else {
            Some(Regex::new(&format!(
                r"^{}:(\d+)$",
                regex::escape(weight_tag)
            ))?)
        };
        Ok(Self {
            canary_tag: (!canary_tag.is_empty()).then(|| canary_tag.to_string()),
            weight,
            default_weight,
        })
    }

    pub fn map_service(
        &self,
        service: &str,
        instances: impl IntoIterator<Item = RegistryInstance>,
    ) -> ServiceInstances {
        ServiceInstances::new(service, instances.into_iter().map(|i| self.map_instance(i)))
    }

    pub fn map_instance(&self, instance: RegistryInstance) -> ServiceInstance {
        let canary = self
            .canary_tag
            .as_ref()
            .is_some_and(|tag| instance.tags.contains(tag));
        let weight = self.weight(&instance).max(1);
        ServiceInstance {
            tags: instance.tags.into_iter().collect(),
            id: instance.id,
            address: instance.address,
            port: instance.port,
            healthy: instance.healthy,
            regular: true,
            canary,
            weight,
        }
    }

    fn weight(&self, instance: &RegistryInstance) -> u32 {
        let Some(re) = &self.weight else {
            return self.default_weight;
        };
        let mut weights = instance
            .tags
            .iter()
            .filter_map(|tag| re.captures(tag))
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok());
        let Some(weight) = weights.next() else {
            return self.default_weight;
        };
        if weights.next().is_some() {
            tracing::warn!(id = %instance.id, "Multiple weight tags on instance, expected at most one");
        }
        weight
    }
}

// === impl WatchPolicy ===

impl WatchPolicy {
    pub fn excluding_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            excluded_tags: tags.into_iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn should_watch(&self, entry: &CatalogEntry) -> bool {
        entry.tags.is_disjoint(&self.excluded_tags)
    }
}
