use crate::snapshot::Snapshot;
use ahash::AHashMap as HashMap;
use anyhow::Result;
use futures::prelude::*;
use mesh_control_core::ConsumerGroup;
use parking_lot::RwLock;
use std::{collections::BTreeSet, pin::Pin, sync::Arc};
use tokio::sync::{watch, Notify};
use tokio_stream::wrappers::WatchStream;

/// Models snapshot discovery for a consumer group.
#[async_trait::async_trait]
pub trait DiscoverSnapshot {
    async fn get_snapshot(&self, group: &ConsumerGroup) -> Result<Option<Arc<Snapshot>>>;

    async fn watch_snapshot(&self, group: ConsumerGroup) -> Result<Option<SnapshotStream>>;
}

pub type SnapshotStream = Pin<Box<dyn Stream<Item = Arc<Snapshot>> + Send + Sync + 'static>>;

pub type SnapshotRx = watch::Receiver<Option<Arc<Snapshot>>>;

/// Holds the latest snapshot of every subscribed consumer group.
#[derive(Clone, Debug, Default)]
pub struct SnapshotStore(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    groups: RwLock<HashMap<ConsumerGroup, watch::Sender<Option<Arc<Snapshot>>>>>,
    added: Notify,
}

/// The result of publishing a snapshot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Publish {
    /// The snapshot replaced the group's previous one and subscribers were notified.
    Applied,
    /// The snapshot carried the same resources as the current one.
    Unchanged,
    /// The group already holds a snapshot from a later generation.
    Stale,
    /// Nobody is subscribed to the group.
    Unsubscribed,
}

// === impl SnapshotStore ===

impl SnapshotStore {
    /// Subscribes to a group's snapshots, registering the group if it is new.
    pub fn subscribe(&self, group: ConsumerGroup) -> SnapshotRx {
        if let Some(tx) = self.0.groups.read().get(&group) {
            return tx.subscribe();
        }

        let mut groups = self.0.groups.write();
        if let Some(tx) = groups.get(&group) {
            return tx.subscribe();
        }
        tracing::debug!(%group, "New consumer group");
        let (tx, rx) = watch::channel(None);
        groups.insert(group, tx);
        drop(groups);
        self.0.added.notify_one();
        rx
    }

    pub fn snapshot(&self, group: &ConsumerGroup) -> Option<Arc<Snapshot>> {
        self.0.groups.read().get(group)?.borrow().clone()
    }

    pub fn groups(&self) -> BTreeSet<ConsumerGroup> {
        self.0.groups.read().keys().cloned().collect()
    }

    /// Publishes a snapshot for its group.
    ///
    /// A snapshot from an earlier generation than the group's current one is dropped. A snapshot
    /// with unchanged resources advances the generation but keeps the current versions and does
    /// not wake subscribers.
    pub fn publish(&self, snapshot: Snapshot) -> Publish {
        let groups = self.0.groups.read();
        let Some(tx) = groups.get(&snapshot.group) else {
            return Publish::Unsubscribed;
        };

        let mut outcome = Publish::Applied;
        tx.send_if_modified(|current| {
            if let Some(previous) = current.as_ref() {
                if snapshot.generation < previous.generation {
                    tracing::warn!(
                        group = %snapshot.group,
                        generation = snapshot.generation,
                        current = previous.generation,
                        "Dropping out-of-order snapshot"
                    );
                    outcome = Publish::Stale;
                    return false;
                }
                if previous.same_content(&snapshot) {
                    let versions = previous.versions.clone();
                    *current = Some(Arc::new(Snapshot {
                        versions,
                        ..snapshot
                    }));
                    outcome = Publish::Unchanged;
                    return false;
                }
            }
            *current = Some(Arc::new(snapshot));
            true
        });
        outcome
    }

    /// Forgets groups that no longer have any subscribers, returning the remaining groups.
    pub fn prune(&self) -> BTreeSet<ConsumerGroup> {
        let mut groups = self.0.groups.write();
        groups.retain(|group, tx| {
            let retain = tx.receiver_count() > 0;
            if !retain {
                tracing::debug!(%group, "Consumer group has no subscribers");
            }
            retain
        });
        groups.keys().cloned().collect()
    }

    /// Completes when a group has been registered since the last call.
    pub async fn group_added(&self) {
        self.0.added.notified().await
    }
}

#[async_trait::async_trait]
impl DiscoverSnapshot for SnapshotStore {
    async fn get_snapshot(&self, group: &ConsumerGroup) -> Result<Option<Arc<Snapshot>>> {
        Ok(self.snapshot(group))
    }

    async fn watch_snapshot(&self, group: ConsumerGroup) -> Result<Option<SnapshotStream>> {
        let rx = self.subscribe(group);
        let stream = WatchStream::new(rx).filter_map(future::ready);
        Ok(Some(Box::pin(stream)))
    }
}
