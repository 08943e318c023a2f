//! Process wiring for the mesh control plane: command-line configuration, the registry watchers,
//! the snapshot updater and the admin server.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_control_core as core;
pub use mesh_control_services as services;
pub use mesh_control_snapshot as snapshot;

mod admin;
mod args;

pub use self::{admin::Admin, args::Args};
