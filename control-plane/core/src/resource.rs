//! Proxy-facing configuration resources.
//!
//! These are the protobuf messages a proxy consumes, modelled on the cluster, endpoint and route
//! discovery resources. Every message is `Eq + Hash` so that identical resource collections can be
//! recognized by value.

use std::{collections::BTreeMap, hash::Hash};

/// A message that may be published in a snapshot.
pub trait Resource: prost::Message + Clone + Eq + Hash + Send + Sync + 'static {
    const TYPE_URL: &'static str;

    fn resource_name(&self) -> &str;
}

/// An upstream cluster, one per service.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct Cluster {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub connect_timeout_ms: u64,
    #[prost(bool, tag = "3")]
    pub http2: bool,
}

/// The endpoints of one cluster, grouped by zone.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct ClusterLoadAssignment {
    #[prost(string, tag = "1")]
    pub cluster_name: String,
    #[prost(message, repeated, tag = "2")]
    pub endpoints: Vec<LocalityLbEndpoints>,
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct LocalityLbEndpoints {
    #[prost(string, tag = "1")]
    pub zone: String,
    #[prost(uint32, tag = "2")]
    pub priority: u32,
    #[prost(message, repeated, tag = "3")]
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct LbEndpoint {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(uint32, optional, tag = "3")]
    pub load_balancing_weight: Option<u32>,
    #[prost(enumeration = "HealthStatus", tag = "4")]
    pub health_status: i32,
    #[prost(btree_map = "string, string", tag = "5")]
    pub metadata: BTreeMap<String, String>,
    #[prost(string, repeated, tag = "6")]
    pub tags: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum HealthStatus {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct RouteConfiguration {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct VirtualHost {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    pub domains: Vec<String>,
    #[prost(message, repeated, tag = "3")]
    pub routes: Vec<Route>,
    #[prost(message, repeated, tag = "4")]
    pub faults: Vec<FaultRule>,
}

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct Route {
    #[prost(string, tag = "1")]
    pub prefix: String,
    #[prost(string, tag = "2")]
    pub cluster: String,
}

/// Delays requests to `upstream_cluster` that originate from one of `downstream_nodes`.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct FaultRule {
    #[prost(string, tag = "1")]
    pub fault_id: String,
    #[prost(string, tag = "2")]
    pub upstream_cluster: String,
    #[prost(string, repeated, tag = "3")]
    pub downstream_nodes: Vec<String>,
    #[prost(uint64, tag = "4")]
    pub fixed_delay_ms: u64,
    #[prost(uint32, tag = "5")]
    pub percentage: u32,
}

macro_rules! type_url {
    ($name:literal) => {
        concat!("type.googleapis.com/meshcontrol.v1.", $name)
    };
}

impl Resource for Cluster {
    const TYPE_URL: &'static str = type_url!("Cluster");

    fn resource_name(&self) -> &str {
        &self.name
    }
}

impl Resource for ClusterLoadAssignment {
    const TYPE_URL: &'static str = type_url!("ClusterLoadAssignment");

    fn resource_name(&self) -> &str {
        &self.cluster_name
    }
}

impl Resource for RouteConfiguration {
    const TYPE_URL: &'static str = type_url!("RouteConfiguration");

    fn resource_name(&self) -> &str {
        &self.name
    }
}
