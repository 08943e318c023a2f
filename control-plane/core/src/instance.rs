use serde::{Deserialize, Serialize};
use std::collections::{btree_map::Entry, BTreeMap, BTreeSet};

pub type ServiceName = String;

/// A single addressable instance of a service as reported by a registry.
///
/// Ordering is by id first so that instance sets iterate deterministically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub address: String,
    pub port: u32,
    pub healthy: bool,
    pub regular: bool,
    pub canary: bool,
    pub weight: u32,
}

/// All instances of one service observed in one registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstances {
    pub service_name: ServiceName,
    #[serde(default)]
    pub instances: BTreeSet<ServiceInstance>,
}

/// The instances of every watched service in one registry, keyed by service name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesState {
    #[serde(rename = "serviceNameToInstances", default)]
    by_name: BTreeMap<ServiceName, ServiceInstances>,
}

// === impl ServiceInstance ===

impl ServiceInstance {
    pub fn new(id: impl ToString, address: impl ToString, port: u32) -> Self {
        Self {
            id: id.to_string(),
            tags: BTreeSet::new(),
            address: address.to_string(),
            port,
            healthy: true,
            regular: true,
            canary: false,
            weight: 1,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.tags = tags.into_iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_canary(mut self, canary: bool) -> Self {
        self.canary = canary;
        self
    }

    pub fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }
}

// === impl ServiceInstances ===

impl ServiceInstances {
    pub fn new(
        service_name: impl ToString,
        instances: impl IntoIterator<Item = ServiceInstance>,
    ) -> Self {
        Self {
            service_name: service_name.to_string(),
            instances: instances.into_iter().collect(),
        }
    }

    pub fn empty(service_name: impl ToString) -> Self {
        Self::new(service_name, None)
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

// === impl ServicesState ===

impl ServicesState {
    pub fn get(&self, service: &str) -> Option<&ServiceInstances> {
        self.by_name.get(service)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.by_name.contains_key(service)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &ServiceName> + '_ {
        self.by_name.keys()
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceInstances> + '_ {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Starts tracking a service with no known instances. Returns false if the service is
    /// already tracked.
    pub fn add(&mut self, service: &str) -> bool {
        if self.by_name.contains_key(service) {
            return false;
        }
        self.change(ServiceInstances::empty(service))
    }

    /// Replaces a service's instances. Returns false when the update is a duplicate of the
    /// current value.
    pub fn change(&mut self, instances: ServiceInstances) -> bool {
        match self.by_name.entry(instances.service_name.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == instances {
                    return false;
                }
                entry.insert(instances);
            }
            Entry::Vacant(entry) => {
                entry.insert(instances);
            }
        }
        true
    }

    pub fn remove(&mut self, service: &str) -> bool {
        self.by_name.remove(service).is_some()
    }

    pub fn without_empty_services(mut self) -> Self {
        self.by_name.retain(|_, instances| !instances.is_empty());
        self
    }
}

impl FromIterator<ServiceInstances> for ServicesState {
    fn from_iter<I: IntoIterator<Item = ServiceInstances>>(iter: I) -> Self {
        let mut state = Self::default();
        for instances in iter {
            state.change(instances);
        }
        state
    }
}

impl IntoIterator for ServicesState {
    type Item = ServiceInstances;
    type IntoIter = std::collections::btree_map::IntoValues<ServiceName, ServiceInstances>;

    fn into_iter(self) -> Self::IntoIter {
        self.by_name.into_values()
    }
}
