//! Snapshot construction and publication.
//!
//! The [`Updater`] samples the aggregated registry state, asks the [`SnapshotBuilder`] for a
//! [`Snapshot`] per consumer group and publishes the results to the [`SnapshotStore`]. Resource
//! collections are serialized through a [`ResourceCache`], so groups that share resources share
//! one wire form.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod builder;
pub mod cache;
pub mod metrics;
mod snapshot;
mod store;
mod updater;
mod versions;

#[cfg(test)]
mod tests;

pub use self::{
    builder::{BuilderConfig, GlobalSnapshot, ResourceCaches, SnapshotBuilder, EGRESS_ROUTES},
    cache::{CachedResources, ResourceCache, ResourcesSerializer, SerializeError},
    metrics::SnapshotMetrics,
    snapshot::{Snapshot, Versions},
    store::{DiscoverSnapshot, Publish, SnapshotRx, SnapshotStore, SnapshotStream},
    updater::{StateRx, Updater, UpdaterConfig},
    versions::SnapshotVersions,
};
