//! Instance transformers.
//!
//! Each [`Transform`] consumes a lazy sequence of [`ServiceInstances`] and yields another. A
//! transform may drop services, drop or merge instances of a service, but never introduces a
//! service name that was not in its input. Transforms hold no state between invocations.

use mesh_control_core::{ServiceInstance, ServiceInstances};
use regex::RegexSet;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

pub type ServicesIter<'a> = Box<dyn Iterator<Item = ServiceInstances> + 'a>;

#[derive(Clone, Debug)]
pub enum Transform {
    /// Drops every service whose name fully matches one of the patterns.
    ExcludeServices(ExcludedServices),

    /// Drops instances with a blank address.
    EmptyAddress,

    /// Drops instances whose port is not a valid TCP port.
    InvalidPort,

    /// Drops services with any instance addressed by hostname rather than IP.
    IpAddress,

    /// Merges instances that share an address and port.
    MergeInstances,
}

/// An ordered chain of transforms.
#[derive(Clone, Debug, Default)]
pub struct Pipeline(Vec<Transform>);

/// Whole-string service name patterns.
#[derive(Clone, Debug)]
pub struct ExcludedServices(RegexSet);

// === impl Transform ===

impl Transform {
    pub fn apply<'a>(&'a self, services: ServicesIter<'a>) -> ServicesIter<'a> {
        match self {
            Self::ExcludeServices(excluded) => {
                Box::new(services.filter(move |s| !excluded.matches(&s.service_name)))
            }
            Self::EmptyAddress => Box::new(
                services.map(|s| retain_instances(s, |i| !i.address.trim().is_empty())),
            ),
            Self::InvalidPort => Box::new(services.map(|s| retain_instances(s, is_valid_port))),
            Self::IpAddress => Box::new(
                services.filter(|s| s.instances.iter().all(|i| is_ip_address(&i.address))),
            ),
            Self::MergeInstances => Box::new(services.map(merge_instances)),
        }
    }
}

fn retain_instances(
    mut services: ServiceInstances,
    keep: impl Fn(&ServiceInstance) -> bool,
) -> ServiceInstances {
    services.instances.retain(keep);
    services
}

fn is_valid_port(instance: &ServiceInstance) -> bool {
    (1..=u32::from(u16::MAX)).contains(&instance.port)
}

fn is_ip_address(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok()
}

fn merge_instances(services: ServiceInstances) -> ServiceInstances {
    let mut by_target = BTreeMap::<(&str, u32), Vec<&ServiceInstance>>::new();
    for instance in &services.instances {
        by_target
            .entry((instance.address.as_str(), instance.port))
            .or_default()
            .push(instance);
    }
    if by_target.values().all(|group| group.len() == 1) {
        return services;
    }

    let instances = by_target
        .into_iter()
        .map(|((address, port), group)| match group.as_slice() {
            [single] => (*single).clone(),
            group => ServiceInstance {
                id: group
                    .iter()
                    .map(|i| i.id.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
                tags: group
                    .iter()
                    .flat_map(|i| i.tags.iter().cloned())
                    .collect::<BTreeSet<_>>(),
                address: address.to_string(),
                port,
                healthy: group.iter().any(|i| i.healthy),
                regular: group.iter().any(|i| i.regular),
                canary: group.iter().any(|i| i.canary),
                weight: group
                    .iter()
                    .fold(0u32, |sum, i| sum.saturating_add(i.weight)),
            },
        })
        .collect::<BTreeSet<_>>();

    ServiceInstances {
        service_name: services.service_name,
        instances,
    }
}

// === impl Pipeline ===

impl Pipeline {
    pub fn new(transforms: impl IntoIterator<Item = Transform>) -> Self {
        Self(transforms.into_iter().collect())
    }

    /// The default chain applied to every zone: the denylist (when configured) followed by the
    /// address, port and merge transforms.
    pub fn standard(excluded: Option<ExcludedServices>) -> Self {
        Self::new(
            excluded
                .map(Transform::ExcludeServices)
                .into_iter()
                .chain([
                    Transform::EmptyAddress,
                    Transform::InvalidPort,
                    Transform::IpAddress,
                    Transform::MergeInstances,
                ]),
        )
    }

    pub fn apply<'a, I>(&'a self, services: I) -> ServicesIter<'a>
    where
        I: IntoIterator<Item = ServiceInstances>,
        I::IntoIter: 'a,
    {
        let services: ServicesIter<'a> = Box::new(services.into_iter());
        self.0
            .iter()
            .fold(services, |services, transform| transform.apply(services))
    }
}

// === impl ExcludedServices ===

impl ExcludedServices {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        RegexSet::new(
            patterns
                .into_iter()
                .map(|p| format!("^(?:{})$", p.as_ref())),
        )
        .map(Self)
    }

    pub fn matches(&self, service: &str) -> bool {
        self.0.is_match(service)
    }
}
