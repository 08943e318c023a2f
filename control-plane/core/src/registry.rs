//! The seams between the control plane and the sources of service state: external service
//! registries and peer control planes in other zones.

use crate::ServicesState;
use std::{collections::BTreeSet, sync::Arc, time::Duration};

/// Models a service registry such as Consul.
///
/// Implementations perform a single request per call; rate limiting, timeouts and retries are
/// applied by the watcher that drives them.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Lists every registered service with its tags.
    async fn catalog(&self) -> Result<Catalog, RegistryError>;

    /// Lists the instances of one service.
    async fn instances(&self, service: &str) -> Result<Instances, RegistryError>;
}

/// Models a control plane in another zone that shares the transformed state of its local
/// registry.
#[async_trait::async_trait]
pub trait PeerState: Send + Sync {
    async fn state(&self) -> Result<ServicesState, RegistryError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Catalog {
    /// The registry's modification index for the response, when it reports one.
    pub index: Option<u64>,
    pub services: Vec<CatalogEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    pub service: String,
    pub tags: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Instances {
    pub index: Option<u64>,
    pub instances: Vec<RegistryInstance>,
}

/// An instance exactly as the registry reports it, before mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryInstance {
    pub id: String,
    pub address: String,
    pub port: u32,
    pub tags: Vec<String>,
    pub healthy: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry request timed out after {0:?}")]
    Timeout(Duration),

    #[error("registry responded with HTTP {0}")]
    Status(u16),

    #[error("registry request failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("failed to decode registry response: {0}")]
    Decode(String),
}

// === impl CatalogEntry ===

impl CatalogEntry {
    pub fn new<I, S>(service: impl ToString, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            service: service.to_string(),
            tags: tags.into_iter().map(|t| t.to_string()).collect(),
        }
    }
}

// === impl RegistryInstance ===

impl RegistryInstance {
    pub fn new(id: impl ToString, address: impl ToString, port: u32) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            port,
            tags: Vec::new(),
            healthy: true,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.tags = tags.into_iter().map(|t| t.to_string()).collect();
        self
    }
}

// === impl RegistryError ===

impl RegistryError {
    /// Timeouts, transport failures and server errors are expected to clear on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Status(status) => *status >= 500 || *status == 429,
            Self::Decode(_) => false,
        }
    }
}

#[async_trait::async_trait]
impl<R: Registry + ?Sized> Registry for Arc<R> {
    async fn catalog(&self) -> Result<Catalog, RegistryError> {
        (**self).catalog().await
    }

    async fn instances(&self, service: &str) -> Result<Instances, RegistryError> {
        (**self).instances(service).await
    }
}

#[async_trait::async_trait]
impl<P: PeerState + ?Sized> PeerState for Arc<P> {
    async fn state(&self) -> Result<ServicesState, RegistryError> {
        (**self).state().await
    }
}
