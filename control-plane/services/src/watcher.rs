use crate::{
    mapper::{InstanceMapper, WatchPolicy},
    metrics::ZoneMetrics,
};
use mesh_control_core::{
    registry::{Registry, RegistryError},
    ServicesState,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::watch,
    time::{self, Instant},
};

pub type StateRx = watch::Receiver<Option<Arc<ServicesState>>>;

#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Minimum time between two registry requests.
    pub subscription_delay: Duration,
    /// Time between the end of one pass over the catalog and the start of the next.
    pub poll_interval: Duration,
    /// A request that takes longer than this is abandoned until the next pass.
    pub request_timeout: Duration,
}

/// Polls one zone's registry and publishes the services it reports.
///
/// Responses that carry the same registry index as the previous response for the same request
/// are not mapped again. Nothing is published until every service in the first catalog response has been fetched
/// once. Afterwards a new state is published whenever a pass over the catalog changes it. Failed
/// requests never clear state: a failed catalog request leaves the state untouched, and a failed
/// instance request keeps that service's last known instances.
pub struct Watcher<R> {
    registry: R,
    config: WatcherConfig,
    policy: WatchPolicy,
    mapper: InstanceMapper,
    metrics: ZoneMetrics,
    state: ServicesState,
    indexes: Indexes,
    loader: InitialLoader,
    next_request: Option<Instant>,
    tx: watch::Sender<Option<Arc<ServicesState>>>,
}

/// The last registry index seen for the catalog and for each service.
#[derive(Debug, Default)]
struct Indexes {
    catalog: Option<(u64, BTreeSet<String>)>,
    services: BTreeMap<String, u64>,
}

/// Tracks the services from the first catalog response that have not been fetched yet.
#[derive(Debug, Default)]
struct InitialLoader {
    pending: Option<BTreeSet<String>>,
}

// === impl Watcher ===

impl<R: Registry> Watcher<R> {
    pub fn new(
        registry: R,
        config: WatcherConfig,
        policy: WatchPolicy,
        mapper: InstanceMapper,
        metrics: ZoneMetrics,
    ) -> (Self, StateRx) {
        let (tx, rx) = watch::channel(None);
        let watcher = Self {
            registry,
            config,
            policy,
            mapper,
            metrics,
            state: ServicesState::default(),
            indexes: Indexes::default(),
            loader: InitialLoader::default(),
            next_request: None,
            tx,
        };
        (watcher, rx)
    }

    pub async fn run(mut self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.poll_once() => {}
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::debug!("registry watcher stopped");
    }

    /// Makes one pass over the registry catalog, refreshing the instances of every watched
    /// service.
    pub async fn poll_once(&mut self) -> Result<(), RegistryError> {
        self.throttle().await;
        let catalog = time::timeout(self.config.request_timeout, self.registry.catalog())
            .await
            .unwrap_or(Err(RegistryError::Timeout(self.config.request_timeout)));
        let catalog = self.record("catalog", None, catalog)?;

        let watched = match self.indexes.unchanged_catalog(catalog.index) {
            Some(watched) => {
                tracing::trace!(index = catalog.index, "Catalog unchanged");
                watched
            }
            None => {
                let watched = catalog
                    .services
                    .iter()
                    .filter(|entry| self.policy.should_watch(entry))
                    .map(|entry| entry.service.clone())
                    .collect::<BTreeSet<_>>();
                self.indexes.catalog = catalog.index.map(|index| (index, watched.clone()));
                watched
            }
        };
        self.loader.catalog(&watched);

        let mut changed = false;
        let removed = self
            .state
            .service_names()
            .filter(|name| !watched.contains(*name))
            .cloned()
            .collect::<Vec<_>>();
        for service in removed {
            tracing::debug!(%service, "service deregistered");
            self.indexes.services.remove(&service);
            changed |= self.state.remove(&service);
        }

        for service in &watched {
            self.throttle().await;
            let instances =
                time::timeout(self.config.request_timeout, self.registry.instances(service))
                    .await
                    .unwrap_or(Err(RegistryError::Timeout(self.config.request_timeout)));
            if let Ok(instances) = self.record("instances", Some(service), instances) {
                self.loader.observe(service);
                if !self.indexes.observe(service, instances.index) {
                    tracing::trace!(%service, index = instances.index, "Service unchanged");
                    continue;
                }
                let instances = self.mapper.map_service(service, instances.instances);
                if self.state.change(instances) {
                    tracing::debug!(%service, "service instances changed");
                    changed = true;
                }
            }
        }

        self.metrics.set_services(self.state.len());
        self.publish(changed);
        Ok(())
    }

    /// Waits until the subscription delay since the previous request has elapsed.
    async fn throttle(&mut self) {
        if let Some(at) = self.next_request {
            time::sleep_until(at).await;
        }
        self.next_request = Some(Instant::now() + self.config.subscription_delay);
    }

    fn record<T>(
        &self,
        kind: &'static str,
        service: Option<&str>,
        result: Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        self.metrics.record(kind, service, &result);
        result
    }

    fn publish(&self, changed: bool) {
        if !self.loader.is_loaded() {
            tracing::debug!(
                pending = self.loader.pending(),
                "Waiting for the initial registry state"
            );
            return;
        }

        let state = &self.state;
        let published = self.tx.send_if_modified(|current| {
            if current.is_some() && !changed {
                return false;
            }
            *current = Some(Arc::new(state.clone()));
            true
        });
        if published {
            tracing::debug!(services = state.len(), "Published registry state");
        }
    }
}

// === impl Indexes ===

impl Indexes {
    /// Returns the watched services of the last catalog response if it had the same index.
    fn unchanged_catalog(&self, index: Option<u64>) -> Option<BTreeSet<String>> {
        let (last, watched) = self.catalog.as_ref()?;
        (Some(*last) == index).then(|| watched.clone())
    }

    /// Records a service's index. Returns false when the response is known to be unchanged.
    fn observe(&mut self, service: &str, index: Option<u64>) -> bool {
        let Some(index) = index else {
            self.services.remove(service);
            return true;
        };
        self.services.insert(service.to_string(), index) != Some(index)
    }
}

// === impl InitialLoader ===

impl InitialLoader {
    fn catalog(&mut self, watched: &BTreeSet<String>) {
        self.pending
            .get_or_insert_with(|| watched.clone())
            .retain(|service| watched.contains(service));
    }

    fn observe(&mut self, service: &str) {
        if let Some(pending) = &mut self.pending {
            pending.remove(service);
        }
    }

    fn is_loaded(&self) -> bool {
        self.pending.as_ref().is_some_and(BTreeSet::is_empty)
    }

    fn pending(&self) -> usize {
        self.pending.as_ref().map_or(0, BTreeSet::len)
    }
}
