//! Synthetic network faults.
//!
//! A [`NetworkFault`] delays requests from a source service to a target service. Faults are
//! submitted through the admin API, held by a pluggable [`FaultStore`] and read by the snapshot
//! builder on every aggregation tick.

use crate::GoDuration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::{sync::watch, time::Instant};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFault {
    pub id: String,
    #[serde(alias = "affectedService")]
    pub source: Selector,
    #[serde(alias = "targetService")]
    pub target: Selector,
    pub delay: GoDuration,
    pub duration: GoDuration,
}

/// Selects services by name. `*` selects every service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(String);

#[derive(Debug, thiserror::Error)]
pub enum FaultStoreError {
    #[error("fault store unavailable: {0}")]
    Unavailable(String),
}

/// Persists fault declarations, keyed by id.
#[async_trait::async_trait]
pub trait FaultStore: Send + Sync {
    /// Stores a fault, replacing any fault with the same id.
    async fn save(&self, fault: NetworkFault) -> Result<NetworkFault, FaultStoreError>;

    /// Lists the live faults ordered by id.
    async fn list(&self) -> Result<Vec<NetworkFault>, FaultStoreError>;

    async fn delete(&self, id: &str) -> Result<(), FaultStoreError>;
}

/// Holds faults in memory until their duration elapses.
#[derive(Debug, Default)]
pub struct InMemoryFaultStore {
    faults: Mutex<BTreeMap<String, StoredFault>>,
}

#[derive(Debug)]
struct StoredFault {
    fault: NetworkFault,
    /// `None` when the duration reaches past the clock's range.
    expires_at: Option<Instant>,
}

/// Submits, lists and deletes faults, and notifies watchers when the set of faults changes.
#[derive(Clone)]
pub struct FaultService {
    store: Arc<dyn FaultStore>,
    revision: Arc<watch::Sender<u64>>,
}

// === impl NetworkFault ===

impl NetworkFault {
    pub fn new(
        id: impl ToString,
        source: impl Into<Selector>,
        target: impl Into<Selector>,
        delay: GoDuration,
        duration: GoDuration,
    ) -> Self {
        Self {
            id: id.to_string(),
            source: source.into(),
            target: target.into(),
            delay,
            duration,
        }
    }
}

// === impl Selector ===

impl Selector {
    pub const ANY: &'static str = "*";

    pub fn matches(&self, service: &str) -> bool {
        self.0 == Self::ANY || self.0 == service
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Selector {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl InMemoryFaultStore ===

impl InMemoryFaultStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl FaultStore for InMemoryFaultStore {
    async fn save(&self, fault: NetworkFault) -> Result<NetworkFault, FaultStoreError> {
        let expires_at = Instant::now().checked_add(fault.duration.as_duration());
        if expires_at.is_none() {
            tracing::debug!(id = %fault.id, "network fault never expires");
        }
        self.faults.lock().insert(
            fault.id.clone(),
            StoredFault {
                fault: fault.clone(),
                expires_at,
            },
        );
        Ok(fault)
    }

    async fn list(&self) -> Result<Vec<NetworkFault>, FaultStoreError> {
        let now = Instant::now();
        let mut faults = self.faults.lock();
        faults.retain(|id, stored| {
            let live = stored.expires_at.map_or(true, |at| at > now);
            if !live {
                tracing::debug!(%id, "network fault expired");
            }
            live
        });
        Ok(faults.values().map(|s| s.fault.clone()).collect())
    }

    async fn delete(&self, id: &str) -> Result<(), FaultStoreError> {
        self.faults.lock().remove(id);
        Ok(())
    }
}

// === impl FaultService ===

impl FaultService {
    pub fn new(store: Arc<dyn FaultStore>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            store,
            revision: Arc::new(revision),
        }
    }

    /// Stores a fault and returns the stored value. The fault is visible to the next snapshot
    /// build.
    pub async fn submit(&self, fault: NetworkFault) -> Result<NetworkFault, FaultStoreError> {
        let stored = self.store.save(fault).await?;
        tracing::info!(
            id = %stored.id,
            source = %stored.source,
            target = %stored.target,
            delay = %stored.delay,
            duration = %stored.duration,
            "network fault submitted"
        );
        self.bump();
        Ok(stored)
    }

    pub async fn list(&self) -> Result<Vec<NetworkFault>, FaultStoreError> {
        self.store.list().await
    }

    pub async fn delete(&self, id: &str) -> Result<(), FaultStoreError> {
        self.store.delete(id).await?;
        tracing::info!(%id, "network fault deleted");
        self.bump();
        Ok(())
    }

    /// Observes a counter that advances whenever a fault is submitted or deleted.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

impl fmt::Debug for FaultService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultService")
            .field("revision", &*self.revision.borrow())
            .finish_non_exhaustive()
    }
}
