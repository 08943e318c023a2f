use mesh_control_core::registry::RegistryError;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct WatcherMetrics {
    requests: Family<RequestLabels, Counter>,
    services: Family<ZoneLabels, Gauge>,
}

/// Metrics handles bound to a single zone's watcher.
#[derive(Clone, Debug)]
pub struct ZoneMetrics {
    zone: String,
    requests: Family<RequestLabels, Counter>,
    services: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    zone: String,
    kind: &'static str,
    outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ZoneLabels {
    zone: String,
}

// === impl WatcherMetrics ===

impl WatcherMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of registry and peer requests by zone, kind and outcome",
            requests.clone(),
        );

        let services = Family::<ZoneLabels, Gauge>::default();
        reg.register(
            "services",
            "The number of services watched in each zone",
            services.clone(),
        );

        Self { requests, services }
    }

    pub fn zone(&self, zone: impl ToString) -> ZoneMetrics {
        let zone = zone.to_string();
        let services = self
            .services
            .get_or_create(&ZoneLabels { zone: zone.clone() })
            .clone();
        ZoneMetrics {
            zone,
            requests: self.requests.clone(),
            services,
        }
    }
}

// === impl ZoneMetrics ===

impl ZoneMetrics {
    pub(crate) fn request(&self, kind: &'static str, outcome: &'static str) {
        self.requests
            .get_or_create(&RequestLabels {
                zone: self.zone.clone(),
                kind,
                outcome,
            })
            .inc();
    }

    /// Counts a request by outcome and logs its failure.
    pub(crate) fn record<T>(
        &self,
        kind: &'static str,
        service: Option<&str>,
        result: &Result<T, RegistryError>,
    ) {
        match result {
            Ok(_) => self.request(kind, "ok"),
            Err(error) if error.is_transient() => {
                self.request(kind, "transient");
                tracing::warn!(%error, kind, service, "Request failed; retrying");
            }
            Err(error) => {
                self.request(kind, "error");
                tracing::error!(%error, kind, service, "Request failed");
            }
        }
    }

    pub(crate) fn set_services(&self, count: usize) {
        self.services.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    #[cfg(test)]
    pub(crate) fn requests(&self, kind: &'static str, outcome: &'static str) -> u64 {
        self.requests
            .get_or_create(&RequestLabels {
                zone: self.zone.clone(),
                kind,
                outcome,
            })
            .get()
    }
}
