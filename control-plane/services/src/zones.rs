use crate::{transform::Pipeline, watcher::StateRx};
use futures::future;
use mesh_control_core::{Locality, MultiZoneState, ServicesState, ZoneState};
use std::sync::Arc;
use tokio::sync::watch;

pub type MultiZoneRx = watch::Receiver<Option<Arc<MultiZoneState>>>;

/// A zone's watcher or remote zone output.
#[derive(Debug)]
pub struct Zone {
    pub name: String,
    pub locality: Locality,
    pub states: StateRx,
}

/// Combines the latest state of every zone, passes each through the transform pipeline and
/// publishes the result.
///
/// Nothing is published until every local zone has published an initial state. Remote zones are
/// included once they load. The transformed state of the local zone is published separately so
/// it can be shared with the control planes of other zones.
#[derive(Debug)]
pub struct Zones {
    zones: Vec<Zone>,
    pipeline: Arc<Pipeline>,
    tx: watch::Sender<Option<Arc<MultiZoneState>>>,
    local_tx: watch::Sender<Option<Arc<ServicesState>>>,
}

impl Zones {
    pub fn new(zones: Vec<Zone>, pipeline: Arc<Pipeline>) -> (Self, MultiZoneRx) {
        let (tx, rx) = watch::channel(None);
        let (local_tx, _) = watch::channel(None);
        (
            Self {
                zones,
                pipeline,
                tx,
                local_tx,
            },
            rx,
        )
    }

    /// Observes the transformed state of the local zone.
    pub fn local_state(&self) -> StateRx {
        self.local_tx.subscribe()
    }

    pub async fn run(mut self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            self.aggregate();

            if self.zones.is_empty() {
                (&mut shutdown).await;
                return;
            }
            let changed = future::select_all(
                self.zones
                    .iter_mut()
                    .map(|zone| Box::pin(zone.states.changed())),
            );
            tokio::select! {
                biased;
                _ = &mut shutdown => return,
                (res, _, _) = changed => {
                    if res.is_err() {
                        tracing::debug!("zone watcher stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Publishes the combined state if every local zone is loaded and anything changed. Returns
    /// true if a new state was published.
    pub fn aggregate(&mut self) -> bool {
        let mut zones = Vec::with_capacity(self.zones.len());
        for zone in &mut self.zones {
            let Some(services) = zone.states.borrow_and_update().clone() else {
                match zone.locality {
                    Locality::Local => {
                        tracing::debug!(zone = %zone.name, "Waiting for zone to load");
                        return false;
                    }
                    Locality::Remote => {
                        tracing::debug!(zone = %zone.name, "Remote zone not loaded yet");
                        continue;
                    }
                }
            };
            let services = self
                .pipeline
                .apply(ServicesState::clone(&services))
                .collect::<ServicesState>();
            zones.push(ZoneState {
                services,
                locality: zone.locality,
                zone: zone.name.clone(),
            });
        }

        let state = MultiZoneState::new(zones);
        if let Some(local) = state.iter().find(|z| z.locality == Locality::Local) {
            let services = &local.services;
            self.local_tx.send_if_modified(|current| {
                if current.as_deref() == Some(services) {
                    return false;
                }
                *current = Some(Arc::new(services.clone()));
                true
            });
        }
        self.tx.send_if_modified(|current| {
            if current.as_deref() == Some(&state) {
                return false;
            }
            *current = Some(Arc::new(state));
            true
        })
    }
}
