use crate::{builder::ResourceCaches, store::Publish, SnapshotStore};
use mesh_control_core::Readiness;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{
        counter::{ConstCounter, Counter},
        family::Family,
        gauge::ConstGauge,
        histogram::{exponential_buckets, Histogram},
        MetricType,
    },
    registry::Registry,
};
use std::{sync::Arc, time::Duration};

#[derive(Clone, Debug)]
pub struct SnapshotMetrics {
    publications: Family<PublishLabels, Counter>,
    ticks: Counter,
    build_duration: Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PublishLabels {
    outcome: &'static str,
}

#[derive(Debug)]
struct Instrumented {
    caches: ResourceCaches,
    store: SnapshotStore,
    readiness: Arc<Readiness>,
}

/// Registers gauges that read the caches, the store and the readiness flag at scrape time.
pub fn register_state(
    reg: &mut Registry,
    caches: ResourceCaches,
    store: SnapshotStore,
    readiness: Arc<Readiness>,
) {
    reg.register_collector(Box::new(Instrumented {
        caches,
        store,
        readiness,
    }));
}

// === impl SnapshotMetrics ===

impl SnapshotMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let publications = Family::<PublishLabels, Counter>::default();
        reg.register(
            "publications",
            "Total number of snapshots published by outcome",
            publications.clone(),
        );

        let ticks = Counter::default();
        reg.register(
            "ticks",
            "Total number of aggregation ticks that built snapshots",
            ticks.clone(),
        );

        let build_duration = Histogram::new(exponential_buckets(0.001, 2.0, 14));
        reg.register(
            "build_duration_seconds",
            "Time taken to build the snapshots of one tick",
            build_duration.clone(),
        );

        Self {
            publications,
            ticks,
            build_duration,
        }
    }

    pub(crate) fn publish(&self, outcome: Publish) {
        let outcome = match outcome {
            Publish::Applied => "applied",
            Publish::Unchanged => "unchanged",
            Publish::Stale => "stale",
            Publish::Unsubscribed => "unsubscribed",
        };
        self.publications
            .get_or_create(&PublishLabels { outcome })
            .inc();
    }

    pub(crate) fn tick(&self, elapsed: Duration) {
        self.ticks.inc();
        self.build_duration.observe(elapsed.as_secs_f64());
    }

    #[cfg(test)]
    pub(crate) fn publications(&self, outcome: &'static str) -> u64 {
        self.publications
            .get_or_create(&PublishLabels { outcome })
            .get()
    }
}

impl Default for SnapshotMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl Instrumented ===

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let caches = [
            (
                "clusters",
                self.caches.clusters.live_entries(),
                self.caches.clusters.serializations(),
            ),
            (
                "endpoints",
                self.caches.endpoints.live_entries(),
                self.caches.endpoints.serializations(),
            ),
            (
                "routes",
                self.caches.routes.live_entries(),
                self.caches.routes.serializations(),
            ),
        ];

        let mut entries_encoder = encoder.encode_descriptor(
            "resource_cache_entries",
            "The number of distinct resource collections referenced by snapshots",
            None,
            MetricType::Gauge,
        )?;
        for (kind, entries, _) in &caches {
            let labels = [("type", *kind)];
            let entries = ConstGauge::new(i64::try_from(*entries).unwrap_or(i64::MAX));
            entries.encode(entries_encoder.encode_family(&labels)?)?;
        }

        let mut serializations_encoder = encoder.encode_descriptor(
            "resource_cache_serializations",
            "Total number of resource collections serialized",
            None,
            MetricType::Counter,
        )?;
        for (kind, _, serializations) in &caches {
            let labels = [("type", *kind)];
            let serializations = ConstCounter::new(*serializations);
            serializations.encode(serializations_encoder.encode_family(&labels)?)?;
        }

        let groups = ConstGauge::new(i64::try_from(self.store.groups().len()).unwrap_or(i64::MAX));
        groups.encode(encoder.encode_descriptor(
            "consumer_groups",
            "The number of consumer groups with subscribers",
            None,
            MetricType::Gauge,
        )?)?;

        let ready = ConstGauge::new(i64::from(self.readiness.is_initial_state_loaded()));
        ready.encode(encoder.encode_descriptor(
            "initial_state_loaded",
            "Whether a complete snapshot has been published since startup",
            None,
            MetricType::Gauge,
        )?)?;

        Ok(())
    }
}
