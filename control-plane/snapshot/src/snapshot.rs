use crate::cache::CachedResources;
use mesh_control_core::{
    resource::{Cluster, ClusterLoadAssignment, RouteConfiguration},
    ConsumerGroup,
};

/// The complete configuration published to one consumer group.
///
/// Snapshots are immutable. `generation` orders snapshots built from successive states; a
/// snapshot never replaces one with a higher generation.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub group: ConsumerGroup,
    pub generation: u64,
    pub versions: Versions,
    pub clusters: CachedResources<Cluster>,
    pub endpoints: CachedResources<ClusterLoadAssignment>,
    pub routes: CachedResources<RouteConfiguration>,
}

/// Per resource type versions. A version changes only when that type's resources change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Versions {
    pub clusters: String,
    pub endpoints: String,
    pub routes: String,
}

impl Snapshot {
    /// True if both snapshots carry the same resources, regardless of generation or versions.
    pub fn same_content(&self, other: &Self) -> bool {
        self.clusters == other.clusters
            && self.endpoints == other.endpoints
            && self.routes == other.routes
    }

    pub fn cluster_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.clusters.resources().iter().map(|c| c.name.as_str())
    }

    pub fn endpoints_for(&self, cluster: &str) -> Option<&ClusterLoadAssignment> {
        self.endpoints
            .resources()
            .iter()
            .find(|cla| cla.cluster_name == cluster)
    }
}
