use crate::{cache::CachedResources, snapshot::Versions};
use ahash::AHashMap as HashMap;
use mesh_control_core::{
    resource::{Cluster, ClusterLoadAssignment, RouteConfiguration},
    ConsumerGroup,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    sync::atomic::{AtomicU64, Ordering},
};

/// Assigns resource versions per consumer group.
///
/// A version is derived by comparing resources with those last versioned for the group, never
/// from a hash of the resources, so distinct resources can never share a version. Versions are
/// only meaningful within one process: proxies start from an empty version when they connect.
#[derive(Debug, Default)]
pub struct SnapshotVersions {
    groups: Mutex<HashMap<ConsumerGroup, GroupVersions>>,
    next: AtomicU64,
}

#[derive(Debug)]
struct GroupVersions {
    clusters: Versioned<Cluster>,
    endpoints: Versioned<ClusterLoadAssignment>,
    routes: Versioned<RouteConfiguration>,
}

#[derive(Debug)]
struct Versioned<T> {
    version: String,
    resources: CachedResources<T>,
}

impl SnapshotVersions {
    pub fn version(
        &self,
        group: &ConsumerGroup,
        clusters: &CachedResources<Cluster>,
        endpoints: &CachedResources<ClusterLoadAssignment>,
        routes: &CachedResources<RouteConfiguration>,
    ) -> Versions {
        let mut groups = self.groups.lock();
        match groups.get_mut(group) {
            Some(previous) => Versions {
                clusters: previous.clusters.update(clusters, || self.next_version()),
                endpoints: previous.endpoints.update(endpoints, || self.next_version()),
                routes: previous.routes.update(routes, || self.next_version()),
            },
            None => {
                let versions = GroupVersions {
                    clusters: Versioned::new(self.next_version(), clusters),
                    endpoints: Versioned::new(self.next_version(), endpoints),
                    routes: Versioned::new(self.next_version(), routes),
                };
                let current = versions.current();
                groups.insert(group.clone(), versions);
                current
            }
        }
    }

    /// Forgets the versions of every group not in `groups`.
    pub fn retain_groups(&self, groups: &BTreeSet<ConsumerGroup>) {
        self.groups.lock().retain(|group, _| groups.contains(group));
    }

    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_version(&self) -> String {
        format!("{:x}", self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl GroupVersions {
    fn current(&self) -> Versions {
        Versions {
            clusters: self.clusters.version.clone(),
            endpoints: self.endpoints.version.clone(),
            routes: self.routes.version.clone(),
        }
    }
}

impl<T: PartialEq> Versioned<T> {
    fn new(version: String, resources: &CachedResources<T>) -> Self {
        Self {
            version,
            resources: resources.clone(),
        }
    }

    fn update(&mut self, resources: &CachedResources<T>, next: impl FnOnce() -> String) -> String {
        if self.resources != *resources {
            self.version = next();
            self.resources = resources.clone();
        }
        self.version.clone()
    }
}
