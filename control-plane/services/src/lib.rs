//! Registry watching and instance transformation.
//!
//! One [`Watcher`] polls each zone's registry, or a [`RemoteZone`] polls the control planes of a
//! remote zone. [`Zones`] combines their output, runs it through the transform [`Pipeline`] and
//! publishes a [`MultiZoneState`](mesh_control_core::MultiZoneState) for the snapshot builder.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod consul;
mod mapper;
pub mod metrics;
pub mod remote;
pub mod transform;
mod watcher;
mod zones;


pub use self::{
    consul::{ConsulConfig, ConsulRegistry},
    mapper::{InstanceMapper, WatchPolicy},
    metrics::{WatcherMetrics, ZoneMetrics},
    remote::{PeerClient, PeerConfig, RemoteZone, RemoteZoneConfig, STATE_PATH},
    transform::{ExcludedServices, Pipeline, Transform},
    watcher::{StateRx, Watcher, WatcherConfig},
    zones::{MultiZoneRx, Zone, Zones},
};
