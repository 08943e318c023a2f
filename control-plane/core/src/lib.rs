//! Mesh control plane core model.
//!
//! The control plane watches one or more service registries (one per zone), filters and
//! annotates the instances it observes, and derives a configuration snapshot for every group of
//! proxies that subscribes to it:
//!
//! ```text
//! [ Registry ] -> [ ServicesState ] -> [ Pipeline ] -> [ MultiZoneState ] -> [ Snapshot per ConsumerGroup ]
//!                                                              ^                    ^
//!                                                      [ PeerState ]       [ NetworkFault ]
//! ```
//!
//! Remote zones are read either from their registries or from the control plane that serves
//! them.
//!
//! This crate holds the types shared by every stage: the registry seam, instance state, consumer
//! groups, wire resources, fault declarations and the process readiness flag.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod fault;
mod group;
mod instance;
mod readiness;
pub mod registry;
pub mod resource;
mod zone;

pub use self::{
    duration::GoDuration,
    fault::{FaultService, FaultStore, InMemoryFaultStore, NetworkFault, Selector},
    group::{ConsumerGroup, Dependencies, InvalidGroup, View},
    instance::{ServiceInstance, ServiceInstances, ServiceName, ServicesState},
    readiness::Readiness,
    registry::{PeerState, Registry},
    zone::{Locality, MultiZoneState, ZoneState},
};
