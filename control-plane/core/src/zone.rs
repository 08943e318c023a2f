use crate::{ServiceName, ServicesState};
use std::collections::BTreeSet;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Locality {
    Local,
    Remote,
}

/// The transformed state of one registry (zone).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneState {
    pub services: ServicesState,
    pub locality: Locality,
    pub zone: String,
}

/// The latest state of every zone, ordered local zone first and then by zone name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiZoneState(Vec<ZoneState>);

// === impl Locality ===

impl Locality {
    /// Local endpoints are preferred over remote ones.
    pub fn priority(self) -> u32 {
        match self {
            Self::Local => 0,
            Self::Remote => 1,
        }
    }
}

// === impl MultiZoneState ===

impl MultiZoneState {
    pub fn new(mut zones: Vec<ZoneState>) -> Self {
        zones.sort_by(|a, b| (a.locality, &a.zone).cmp(&(b.locality, &b.zone)));
        Self(zones)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ZoneState> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if no zone reports any service.
    pub fn has_no_services(&self) -> bool {
        self.0.iter().all(|z| z.services.is_empty())
    }

    /// The union of service names across all zones, sorted.
    pub fn service_names(&self) -> BTreeSet<&ServiceName> {
        self.0
            .iter()
            .flat_map(|z| z.services.service_names())
            .collect()
    }

    /// Names of services whose instances differ in any zone between `previous` and `self`,
    /// including services that appeared or disappeared.
    pub fn changed_services(&self, previous: &MultiZoneState) -> BTreeSet<ServiceName> {
        let mut changed = BTreeSet::new();
        let names = self
            .service_names()
            .into_iter()
            .chain(previous.service_names())
            .collect::<BTreeSet<_>>();
        for name in names {
            let now = self.instances_by_zone(name);
            let before = previous.instances_by_zone(name);
            if now != before {
                changed.insert(name.clone());
            }
        }
        changed
    }

    fn instances_by_zone<'a>(
        &'a self,
        service: &str,
    ) -> Vec<(&'a str, &'a crate::ServiceInstances)> {
        self.0
            .iter()
            .filter_map(|z| z.services.get(service).map(|s| (z.zone.as_str(), s)))
            .collect()
    }
}

impl<'a> IntoIterator for &'a MultiZoneState {
    type Item = &'a ZoneState;
    type IntoIter = std::slice::Iter<'a, ZoneState>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ServiceInstance, ServiceInstances};

    fn zone(name: &str, locality: Locality, services: Vec<ServiceInstances>) -> ZoneState {
        ZoneState {
            services: services.into_iter().collect(),
            locality,
            zone: name.to_string(),
        }
    }

    #[test]
    fn local_zone_sorts_first() {
        let state = MultiZoneState::new(vec![
            zone("b", Locality::Remote, vec![]),
            zone("z", Locality::Local, vec![]),
            zone("a", Locality::Remote, vec![]),
        ]);
        let zones = state.iter().map(|z| z.zone.as_str()).collect::<Vec<_>>();
        assert_eq!(zones, vec!["z", "a", "b"]);
    }

    #[test]
    fn changed_services_compares_per_zone() {
        let a1 = ServiceInstances::new("a", [ServiceInstance::new("a-1", "10.0.0.1", 80)]);
        let a2 = ServiceInstances::new("a", [ServiceInstance::new("a-2", "10.0.0.2", 80)]);
        let b = ServiceInstances::new("b", [ServiceInstance::new("b-1", "10.0.0.3", 80)]);

        let before = MultiZoneState::new(vec![
            zone("dc1", Locality::Local, vec![a1.clone(), b.clone()]),
            zone("dc2", Locality::Remote, vec![a1.clone()]),
        ]);
        let after = MultiZoneState::new(vec![
            zone("dc1", Locality::Local, vec![a1.clone(), b]),
            zone("dc2", Locality::Remote, vec![a2]),
        ]);
        assert_eq!(
            after.changed_services(&before),
            BTreeSet::from(["a".to_string()])
        );

        let removed = MultiZoneState::new(vec![zone("dc1", Locality::Local, vec![a1])]);
        assert_eq!(
            removed.changed_services(&before),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }
}
