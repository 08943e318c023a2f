use crate::{
    cache::{ResourceCache, ResourcesSerializer},
    snapshot::Snapshot,
    versions::SnapshotVersions,
};
use mesh_control_core::{
    resource::{
        Cluster, ClusterLoadAssignment, FaultRule, HealthStatus, LbEndpoint, LocalityLbEndpoints,
        Route, RouteConfiguration, VirtualHost,
    },
    ConsumerGroup, Dependencies, Locality, MultiZoneState, NetworkFault, ServiceInstance, View,
};
use std::{collections::BTreeMap, time::Duration};

pub const EGRESS_ROUTES: &str = "default_routes";

const LB_REGULAR: &str = "lb_regular";
const CANARY: &str = "canary";
const CANARY_VALUE: &str = "1";
const FAULT_PERCENTAGE: u32 = 100;

#[derive(Clone, Debug)]
pub struct BuilderConfig {
    pub cluster_connect_timeout: Duration,
    /// Clusters are served over HTTP/2 when every instance carries this tag. `None` disables
    /// HTTP/2 entirely.
    pub http2_tag: Option<String>,
    /// Services with these name prefixes are left out of wildcard groups.
    pub wildcard_excluded_prefixes: Vec<String>,
    /// Keeps clusters of services that disappeared from the registry, with no endpoints.
    pub never_remove_clusters: bool,
}

/// Caches for every resource type a snapshot carries.
#[derive(Clone, Debug, Default)]
pub struct ResourceCaches {
    pub clusters: ResourceCache<Cluster>,
    pub endpoints: ResourceCache<ClusterLoadAssignment>,
    pub routes: ResourceCache<RouteConfiguration>,
}

/// Clusters and endpoints for every known service, shared by all groups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GlobalSnapshot {
    pub clusters: BTreeMap<String, Cluster>,
    pub endpoints: BTreeMap<String, ClusterLoadAssignment>,
}

/// Builds snapshots from the aggregated registry state.
///
/// Building is deterministic: equal inputs produce equal resource collections, which the caches
/// then share.
#[derive(Debug)]
pub struct SnapshotBuilder {
    config: BuilderConfig,
    caches: ResourceCaches,
    versions: SnapshotVersions,
}

// === impl ResourceCaches ===

impl ResourceCaches {
    pub fn purge(&self) {
        self.clusters.purge();
        self.endpoints.purge();
        self.routes.purge();
    }
}

// === impl BuilderConfig ===

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            cluster_connect_timeout: Duration::from_secs(1),
            http2_tag: Some("envoy".to_string()),
            wildcard_excluded_prefixes: Vec::new(),
            never_remove_clusters: false,
        }
    }
}

// === impl SnapshotBuilder ===

impl SnapshotBuilder {
    pub fn new(config: BuilderConfig, caches: ResourceCaches) -> Self {
        Self {
            config,
            caches,
            versions: SnapshotVersions::default(),
        }
    }

    pub fn caches(&self) -> &ResourceCaches {
        &self.caches
    }

    pub fn versions(&self) -> &SnapshotVersions {
        &self.versions
    }

    /// Builds the clusters and endpoints of every service in `state`.
    ///
    /// `previous` supplies the HTTP/2 setting of services that currently report no instances
    /// and, when clusters are never removed, the clusters of departed services.
    pub fn global(
        &self,
        state: &MultiZoneState,
        previous: Option<&GlobalSnapshot>,
    ) -> GlobalSnapshot {
        let mut global = GlobalSnapshot::default();
        for service in state.service_names() {
            let instances = state
                .iter()
                .filter_map(|zone| zone.services.get(service))
                .flat_map(|s| s.instances.iter())
                .collect::<Vec<_>>();
            let previous_http2 = previous
                .and_then(|p| p.clusters.get(service.as_str()))
                .is_some_and(|c| c.http2);
            let http2 = match &self.config.http2_tag {
                None => false,
                Some(_) if instances.is_empty() => previous_http2,
                Some(tag) => instances.iter().all(|i| i.tags.contains(tag)),
            };
            global
                .clusters
                .insert(service.clone(), self.cluster(service, http2));

            let endpoints = state
                .iter()
                .filter_map(|zone| {
                    let services = zone.services.get(service)?;
                    if services.is_empty() {
                        return None;
                    }
                    Some(LocalityLbEndpoints {
                        zone: zone.zone.clone(),
                        priority: zone.locality.priority(),
                        lb_endpoints: services.instances.iter().map(lb_endpoint).collect(),
                    })
                })
                .collect();
            global.endpoints.insert(
                service.clone(),
                ClusterLoadAssignment {
                    cluster_name: service.clone(),
                    endpoints,
                },
            );
        }

        if self.config.never_remove_clusters {
            if let Some(previous) = previous {
                for (name, cluster) in &previous.clusters {
                    if global.clusters.contains_key(name) {
                        continue;
                    }
                    tracing::debug!(cluster = %name, "Retaining cluster of a removed service");
                    global.clusters.insert(name.clone(), cluster.clone());
                    global.endpoints.insert(
                        name.clone(),
                        ClusterLoadAssignment {
                            cluster_name: name.clone(),
                            endpoints: Vec::new(),
                        },
                    );
                }
            }
        }

        global
    }

    /// Builds the snapshot for one consumer group.
    ///
    /// Faults whose target names a service the group routes to are attached to that service's
    /// virtual host. Faults with no matching target are ignored.
    pub fn group(
        &self,
        group: &ConsumerGroup,
        global: &GlobalSnapshot,
        faults: &[NetworkFault],
        generation: u64,
    ) -> Snapshot {
        let services = self.dependencies(group, global);

        let clusters = services
            .iter()
            .filter_map(|s| global.clusters.get(*s).cloned())
            .collect::<Vec<_>>();

        let endpoints = services
            .iter()
            .filter_map(|s| global.endpoints.get(*s))
            .map(|cla| match group.view {
                View::Global => cla.clone(),
                View::Local => local_endpoints(cla),
            })
            .collect::<Vec<_>>();

        let virtual_hosts = services
            .iter()
            .map(|service| VirtualHost {
                name: service.to_string(),
                domains: vec![service.to_string()],
                routes: vec![Route {
                    prefix: "/".to_string(),
                    cluster: service.to_string(),
                }],
                faults: fault_rules(service, faults),
            })
            .collect();
        let routes = vec![RouteConfiguration {
            name: EGRESS_ROUTES.to_string(),
            virtual_hosts,
        }];

        let clusters = self.caches.clusters.serialize(clusters);
        let endpoints = self.caches.endpoints.serialize(endpoints);
        let routes = self.caches.routes.serialize(routes);
        let versions = self.versions.version(group, &clusters, &endpoints, &routes);

        Snapshot {
            group: group.clone(),
            generation,
            versions,
            clusters,
            endpoints,
            routes,
        }
    }

    fn dependencies<'g>(&self, group: &ConsumerGroup, global: &'g GlobalSnapshot) -> Vec<&'g str> {
        match &group.dependencies {
            Dependencies::All => global
                .clusters
                .keys()
                .filter(|name| {
                    !self
                        .config
                        .wildcard_excluded_prefixes
                        .iter()
                        .any(|prefix| name.starts_with(prefix.as_str()))
                })
                .map(String::as_str)
                .collect(),
            Dependencies::Services(services) => services
                .iter()
                .filter_map(|s| global.clusters.get_key_value(s.as_str()))
                .map(|(name, _)| name.as_str())
                .collect(),
        }
    }

    fn cluster(&self, service: &str, http2: bool) -> Cluster {
        Cluster {
            name: service.to_string(),
            connect_timeout_ms: u64::try_from(self.config.cluster_connect_timeout.as_millis())
                .unwrap_or(u64::MAX),
            http2,
        }
    }
}

fn lb_endpoint(instance: &ServiceInstance) -> LbEndpoint {
    let mut metadata = BTreeMap::new();
    if instance.regular {
        metadata.insert(LB_REGULAR.to_string(), "true".to_string());
    }
    if instance.canary {
        metadata.insert(CANARY.to_string(), CANARY_VALUE.to_string());
    }
    let health = if instance.healthy {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };
    LbEndpoint {
        address: instance.address.clone(),
        port: instance.port,
        load_balancing_weight: Some(instance.weight),
        health_status: health as i32,
        metadata,
        tags: instance.tags.iter().cloned().collect(),
    }
}

fn local_endpoints(cla: &ClusterLoadAssignment) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: cla.cluster_name.clone(),
        endpoints: cla
            .endpoints
            .iter()
            .filter(|e| e.priority == Locality::Local.priority())
            .cloned()
            .collect(),
    }
}

fn fault_rules(service: &str, faults: &[NetworkFault]) -> Vec<FaultRule> {
    let mut rules = faults
        .iter()
        .filter(|fault| fault.target.matches(service))
        .map(|fault| FaultRule {
            fault_id: fault.id.clone(),
            upstream_cluster: service.to_string(),
            downstream_nodes: vec![fault.source.to_string()],
            fixed_delay_ms: fault.delay.as_millis(),
            percentage: FAULT_PERCENTAGE,
        })
        .collect::<Vec<_>>();
    rules.sort_by(|a, b| a.fault_id.cmp(&b.fault_id));
    rules
}
