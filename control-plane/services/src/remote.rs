//! Reads remote zones from the control planes that serve them.
//!
//! Every control plane serves the transformed state of its local registry at `/state`. A
//! [`RemoteZone`] polls one zone's peers for that state and publishes it like a [`Watcher`]
//! would, so [`Zones`] treats both sources alike.
//!
//! [`Watcher`]: crate::Watcher
//! [`Zones`]: crate::Zones

use crate::{metrics::ZoneMetrics, watcher::StateRx};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use mesh_control_core::{
    registry::{PeerState, RegistryError},
    ServicesState,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    time::{self, Instant},
};

pub const STATE_PATH: &str = "/state";

#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// The `host:port` admin addresses of the zone's control planes.
    pub peers: Vec<String>,
    pub connect_timeout: Duration,
    pub pool_keep_alive: Duration,
}

/// Fetches a zone's state from its control planes, trying each peer in turn.
#[derive(Clone, Debug)]
pub struct PeerClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    peers: Arc<[Arc<str>]>,
    next: Arc<AtomicUsize>,
}

#[derive(Clone, Debug)]
pub struct RemoteZoneConfig {
    pub poll_interval: Duration,
    /// A request that takes longer than this is abandoned until the next poll.
    pub request_timeout: Duration,
    /// How long the last fetched state is kept while the peers cannot be reached.
    pub cache_duration: Duration,
}

/// Polls a remote zone's control planes and publishes the zone's services.
///
/// Services without instances are dropped. When the peers cannot be reached the last fetched
/// state is kept for `cache_duration`, after which the zone is published without services.
pub struct RemoteZone<P> {
    peer: P,
    config: RemoteZoneConfig,
    metrics: ZoneMetrics,
    fetched_at: Option<Instant>,
    tx: watch::Sender<Option<Arc<ServicesState>>>,
}

// === impl PeerClient ===

impl PeerClient {
    pub fn new(config: &PeerConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.pool_keep_alive)
            .build(connector);

        Self {
            client,
            peers: config.peers.iter().map(|p| Arc::from(p.as_str())).collect(),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn choose_peer(&self) -> Option<&str> {
        if self.peers.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        Some(&self.peers[i])
    }
}

#[async_trait::async_trait]
impl PeerState for PeerClient {
    async fn state(&self) -> Result<ServicesState, RegistryError> {
        let peer = self
            .choose_peer()
            .ok_or_else(|| RegistryError::Transport("no peers configured".into()))?;

        let req = http::Request::get(format!("http://{peer}{STATE_PATH}"))
            .header(http::header::ACCEPT, "application/json")
            .body(Empty::new())
            .map_err(|e| RegistryError::Transport(e.into()))?;
        let rsp = self
            .client
            .request(req)
            .await
            .map_err(|e| RegistryError::Transport(e.into()))?;

        let status = rsp.status();
        if !status.is_success() {
            return Err(RegistryError::Status(status.as_u16()));
        }
        let body = rsp
            .into_body()
            .collect()
            .await
            .map_err(|e| RegistryError::Transport(e.into()))?
            .to_bytes();
        serde_json::from_slice(&body).map_err(|e| RegistryError::Decode(e.to_string()))
    }
}

// === impl RemoteZone ===

impl<P: PeerState> RemoteZone<P> {
    pub fn new(peer: P, config: RemoteZoneConfig, metrics: ZoneMetrics) -> (Self, StateRx) {
        let (tx, rx) = watch::channel(None);
        let zone = Self {
            peer,
            config,
            metrics,
            fetched_at: None,
            tx,
        };
        (zone, rx)
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
        tracing::debug!("remote zone poller stopped");
    }

    pub async fn poll_once(&mut self) -> Result<(), RegistryError> {
        let state = time::timeout(self.config.request_timeout, self.peer.state())
            .await
            .unwrap_or(Err(RegistryError::Timeout(self.config.request_timeout)));
        self.metrics.record("state", None, &state);

        match state {
            Ok(state) => {
                self.fetched_at = Some(Instant::now());
                self.publish(state.without_empty_services());
                Ok(())
            }
            Err(error) => {
                let expired = self
                    .fetched_at
                    .is_some_and(|at| at.elapsed() >= self.config.cache_duration);
                if expired {
                    tracing::warn!("Remote zone state expired");
                    self.fetched_at = None;
                    self.publish(ServicesState::default());
                }
                Err(error)
            }
        }
    }

    fn publish(&self, state: ServicesState) {
        self.metrics.set_services(state.len());
        let published = self.tx.send_if_modified(|current| {
            if current.as_deref() == Some(&state) {
                return false;
            }
            *current = Some(Arc::new(state));
            true
        });
        if published {
            tracing::debug!("Published remote zone state");
        }
    }
}
