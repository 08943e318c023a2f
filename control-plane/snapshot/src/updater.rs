use crate::{
    builder::{GlobalSnapshot, SnapshotBuilder},
    metrics::SnapshotMetrics,
    store::SnapshotStore,
};
use mesh_control_core::{
    ConsumerGroup, FaultService, MultiZoneState, NetworkFault, Readiness, ServiceName,
};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{self, Instant},
};

pub type StateRx = watch::Receiver<Option<Arc<MultiZoneState>>>;

#[derive(Clone, Debug)]
pub struct UpdaterConfig {
    /// The minimum time between two aggregation ticks.
    pub state_sample: Duration,
}

/// Rebuilds and publishes snapshots as the registry state, the set of consumer groups or the
/// active faults change.
///
/// The registry state is sampled at most once per `state_sample`; updates that arrive in the
/// meantime are coalesced into the next tick.
#[derive(Debug)]
pub struct Updater {
    builder: Arc<SnapshotBuilder>,
    store: SnapshotStore,
    faults: FaultService,
    readiness: Arc<Readiness>,
    metrics: SnapshotMetrics,
    config: UpdaterConfig,
    states: StateRx,
    fault_revisions: watch::Receiver<u64>,
    generation: u64,
    last: Option<Built>,
}

/// The inputs of the last tick.
#[derive(Debug)]
struct Built {
    state: Arc<MultiZoneState>,
    global: Arc<GlobalSnapshot>,
    faults: Arc<[NetworkFault]>,
}

// === impl Updater ===

impl Updater {
    pub fn new(
        builder: Arc<SnapshotBuilder>,
        store: SnapshotStore,
        faults: FaultService,
        readiness: Arc<Readiness>,
        metrics: SnapshotMetrics,
        config: UpdaterConfig,
        states: StateRx,
    ) -> Self {
        let fault_revisions = faults.subscribe();
        Self {
            builder,
            store,
            faults,
            readiness,
            metrics,
            config,
            states,
            fault_revisions,
            generation: 0,
            last: None,
        }
    }

    pub async fn run(mut self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        // The state may have been published before the updater started.
        self.update().await;
        let mut next = Instant::now() + self.config.state_sample;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => return,
                _ = time::sleep_until(next) => {}
            }

            // Faults expire without a revision change, so they are re-read periodically while
            // any are active.
            let faults_active = self.last.as_ref().is_some_and(|l| !l.faults.is_empty());
            tokio::select! {
                biased;
                _ = &mut shutdown => return,
                res = self.states.changed() => {
                    if res.is_err() {
                        tracing::debug!("Registry state publisher stopped");
                        return;
                    }
                }
                _ = self.fault_revisions.changed() => {}
                _ = self.store.group_added() => {}
                _ = time::sleep(self.config.state_sample), if faults_active => {}
            }

            next = Instant::now() + self.config.state_sample;
            self.update().await;
        }
    }

    /// Runs one aggregation tick.
    pub(crate) async fn update(&mut self) {
        let Some(state) = self.states.borrow_and_update().clone() else {
            tracing::debug!("Waiting for the initial registry state");
            return;
        };
        if state.has_no_services() {
            tracing::debug!("Registry state has no services; keeping previous snapshots");
            return;
        }

        self.fault_revisions.borrow_and_update();
        let faults: Arc<[NetworkFault]> = match self.faults.list().await {
            Ok(faults) => faults.into(),
            Err(error) => {
                tracing::warn!(%error, "Failed to list faults; keeping previous faults");
                self.last
                    .as_ref()
                    .map(|l| l.faults.clone())
                    .unwrap_or_else(|| Arc::from(Vec::new()))
            }
        };

        let started = std::time::Instant::now();
        self.generation += 1;
        let generation = self.generation;

        let groups = self.store.prune();
        self.builder.versions().retain_groups(&groups);

        let (global, changed, faults_changed) = match &self.last {
            Some(last) => {
                let global = if Arc::ptr_eq(&last.state, &state) {
                    last.global.clone()
                } else {
                    Arc::new(self.builder.global(&state, Some(&last.global)))
                };
                let changed = state.changed_services(&last.state);
                (global, changed, last.faults != faults)
            }
            None => {
                let global = Arc::new(self.builder.global(&state, None));
                (global, BTreeSet::new(), true)
            }
        };

        let rebuild = groups
            .into_iter()
            .filter(|group| self.needs_rebuild(group, &changed, faults_changed))
            .collect::<Vec<_>>();
        tracing::debug!(
            generation,
            groups = rebuild.len(),
            changed = changed.len(),
            faults_changed,
            "Building snapshots"
        );

        let builds = rebuild.into_iter().map(|group| {
            let builder = self.builder.clone();
            let global = global.clone();
            let faults = faults.clone();
            tokio::task::spawn_blocking(move || builder.group(&group, &global, &faults, generation))
        });
        for res in futures::future::join_all(builds).await {
            match res {
                Ok(snapshot) => self.metrics.publish(self.store.publish(snapshot)),
                Err(error) => tracing::error!(%error, "Snapshot build failed"),
            }
        }

        self.builder.caches().purge();
        self.metrics.tick(started.elapsed());
        self.last = Some(Built {
            state,
            global,
            faults,
        });

        if self.readiness.mark_initial_state_loaded() {
            tracing::info!(generation, "Initial state loaded");
        }
    }

    fn needs_rebuild(
        &self,
        group: &ConsumerGroup,
        changed: &BTreeSet<ServiceName>,
        faults_changed: bool,
    ) -> bool {
        if faults_changed || self.store.snapshot(group).is_none() {
            return true;
        }
        if group.is_wildcard() {
            return !changed.is_empty();
        }
        changed.iter().any(|service| group.depends_on(service))
    }
}
