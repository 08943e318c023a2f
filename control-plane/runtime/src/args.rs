use crate::admin::Admin;
use anyhow::{bail, Context, Result};
use clap::Parser;
use mesh_control_core::{ConsumerGroup, FaultService, InMemoryFaultStore, Locality, Readiness};
use mesh_control_services::{
    ConsulConfig, ConsulRegistry, ExcludedServices, InstanceMapper, PeerClient, PeerConfig,
    Pipeline, RemoteZone, RemoteZoneConfig, WatchPolicy, Watcher, WatcherConfig, WatcherMetrics,
    Zone, Zones,
};
use mesh_control_snapshot::{
    metrics::register_state, BuilderConfig, ResourceCaches, SnapshotBuilder, SnapshotMetrics,
    SnapshotStore, Updater, UpdaterConfig,
};
use prometheus_client::registry::Registry;
use std::{collections::BTreeMap, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};
use tracing::{info, info_span, Instrument};
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[clap(name = "mesh-control", about = "A service mesh control plane")]
pub struct Args {
    #[clap(long, default_value = "mesh_control=info,warn", env = "MESH_CONTROL_LOG")]
    log_level: String,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    #[clap(long, default_value = "localhost")]
    registry_host: String,

    #[clap(long, default_value = "8500")]
    registry_port: u16,

    /// The name of the local zone.
    #[clap(long, default_value = "local")]
    zone: String,

    /// A remote zone's registry, as `zone=host:port`. May be repeated.
    #[clap(long = "remote-registry")]
    remote_registries: Vec<RemoteRegistry>,

    /// The admin address of a control plane serving a remote zone, as `zone=host:port`. May be
    /// repeated; a zone's peers are polled in turn.
    #[clap(long = "remote-zone")]
    remote_zones: Vec<RemoteRegistry>,

    /// The time between two polls of a remote zone's control planes.
    #[clap(long, default_value = "1000")]
    sync_interval_ms: u64,

    #[clap(long, default_value = "1000")]
    sync_connect_timeout_ms: u64,

    #[clap(long, default_value = "500")]
    sync_read_timeout_ms: u64,

    /// How long a remote zone's last state is kept while its control planes cannot be reached.
    #[clap(long, default_value = "120000")]
    sync_cache_ms: u64,

    /// The minimum time between two registry requests.
    #[clap(long, default_value = "20")]
    subscription_delay_ms: u64,

    #[clap(long, default_value = "1000")]
    poll_interval_ms: u64,

    #[clap(long, default_value = "2000")]
    connect_timeout_ms: u64,

    /// Registry requests that take longer are abandoned and retried on the next poll.
    #[clap(long, default_value = "360000")]
    read_timeout_ms: u64,

    #[clap(long, default_value = "2000")]
    max_pool_size: usize,

    #[clap(long, default_value = "30000")]
    pool_keep_alive_ms: u64,

    /// The maximum number of registry requests in flight per zone.
    #[clap(long, default_value = "64")]
    max_connections: usize,

    /// Services whose names fully match any of these patterns are dropped.
    #[clap(long, value_delimiter = ',')]
    excluded_services: Vec<String>,

    /// Services carrying any of these tags are not watched.
    #[clap(long, value_delimiter = ',')]
    excluded_service_tags: Vec<String>,

    #[clap(long, default_value = "weight")]
    weight_tag: String,

    #[clap(long, default_value = "50")]
    default_weight: u32,

    #[clap(long, default_value = "canary")]
    canary_tag: String,

    /// Clusters use HTTP/2 when every instance carries this tag. Empty disables HTTP/2.
    #[clap(long, default_value = "envoy")]
    http2_tag: String,

    #[clap(long, default_value = "1000")]
    cluster_connect_timeout_ms: u64,

    /// Services with these name prefixes are left out of wildcard consumer groups.
    #[clap(long, value_delimiter = ',')]
    wildcard_excluded_prefixes: Vec<String>,

    #[clap(long, default_value = "1000")]
    state_sample_ms: u64,

    #[clap(long)]
    never_remove_clusters: bool,

    /// A consumer group to keep a snapshot for, as `name[:local|:global][=dep+dep|=*]`. May be
    /// repeated.
    #[clap(long = "consumer-group")]
    consumer_groups: Vec<ConsumerGroup>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct RemoteRegistry {
    zone: String,
    host: String,
    port: u16,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid remote registry '{0}': expected zone=host:port")]
struct InvalidRemoteRegistry(String);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            admin_addr,
            registry_host,
            registry_port,
            zone,
            remote_registries,
            remote_zones,
            sync_interval_ms,
            sync_connect_timeout_ms,
            sync_read_timeout_ms,
            sync_cache_ms,
            subscription_delay_ms,
            poll_interval_ms,
            connect_timeout_ms,
            read_timeout_ms,
            max_pool_size,
            pool_keep_alive_ms,
            max_connections,
            excluded_services,
            excluded_service_tags,
            weight_tag,
            default_weight,
            canary_tag,
            http2_tag,
            cluster_connect_timeout_ms,
            wildcard_excluded_prefixes,
            state_sample_ms,
            never_remove_clusters,
            consumer_groups,
        } = self;

        init_tracing(&log_level, log_format)?;

        let readiness = Readiness::shared();
        let faults = FaultService::new(InMemoryFaultStore::shared());
        let caches = ResourceCaches::default();
        let store = SnapshotStore::default();

        let mut prom = <Registry>::default();
        let watcher_metrics = WatcherMetrics::register(prom.sub_registry_with_prefix("registry"));
        let snapshot_prom = prom.sub_registry_with_prefix("snapshot");
        let snapshot_metrics = SnapshotMetrics::register(snapshot_prom);
        register_state(
            snapshot_prom,
            caches.clone(),
            store.clone(),
            readiness.clone(),
        );

        let (drain_tx, drain_rx) = drain::channel();

        // Spawn a watcher per zone.
        let watcher_config = WatcherConfig {
            subscription_delay: Duration::from_millis(subscription_delay_ms),
            poll_interval: Duration::from_millis(poll_interval_ms),
            request_timeout: Duration::from_millis(read_timeout_ms),
        };
        let policy = WatchPolicy::excluding_tags(excluded_service_tags);
        let mapper = InstanceMapper::new(&canary_tag, &weight_tag, default_weight)
            .context("invalid weight tag")?;
        let local = RemoteRegistry {
            zone,
            host: registry_host,
            port: registry_port,
        };
        let registries = std::iter::once((Locality::Local, local))
            .chain(remote_registries.into_iter().map(|r| (Locality::Remote, r)));

        let mut zones = Vec::new();
        for (locality, RemoteRegistry { zone, host, port }) in registries {
            let registry = ConsulRegistry::new(&ConsulConfig {
                host,
                port,
                connect_timeout: Duration::from_millis(connect_timeout_ms),
                pool_keep_alive: Duration::from_millis(pool_keep_alive_ms),
                max_pool_size,
                max_connections,
            });
            let (watcher, states) = Watcher::new(
                registry,
                watcher_config.clone(),
                policy.clone(),
                mapper.clone(),
                watcher_metrics.zone(&zone),
            );
            tokio::spawn(
                watcher
                    .run(drain_rx.clone())
                    .instrument(info_span!("watcher", %zone)),
            );
            zones.push(Zone {
                name: zone,
                locality,
                states,
            });
        }

        // Remote zones served by peer control planes.
        let mut peers = BTreeMap::<String, Vec<String>>::new();
        for RemoteRegistry { zone, host, port } in remote_zones {
            peers.entry(zone).or_default().push(format!("{host}:{port}"));
        }
        for (zone, peers) in peers {
            let peer = PeerClient::new(&PeerConfig {
                peers,
                connect_timeout: Duration::from_millis(sync_connect_timeout_ms),
                pool_keep_alive: Duration::from_millis(pool_keep_alive_ms),
            });
            let (remote, states) = RemoteZone::new(
                peer,
                RemoteZoneConfig {
                    poll_interval: Duration::from_millis(sync_interval_ms),
                    request_timeout: Duration::from_millis(sync_read_timeout_ms),
                    cache_duration: Duration::from_millis(sync_cache_ms),
                },
                watcher_metrics.zone(&zone),
            );
            tokio::spawn(
                remote
                    .run(drain_rx.clone())
                    .instrument(info_span!("remote", %zone)),
            );
            zones.push(Zone {
                name: zone,
                locality: Locality::Remote,
                states,
            });
        }

        let excluded = if excluded_services.is_empty() {
            None
        } else {
            Some(ExcludedServices::new(&excluded_services).context("invalid excluded services")?)
        };
        let (zones, states) = Zones::new(zones, Arc::new(Pipeline::standard(excluded)));
        let local_state = zones.local_state();
        tokio::spawn(zones.run(drain_rx.clone()).instrument(info_span!("zones")));

        // Build snapshots from the combined state.
        let builder = SnapshotBuilder::new(
            BuilderConfig {
                cluster_connect_timeout: Duration::from_millis(cluster_connect_timeout_ms),
                http2_tag: (!http2_tag.is_empty()).then_some(http2_tag),
                wildcard_excluded_prefixes,
                never_remove_clusters,
            },
            caches,
        );

        // Statically configured groups are kept for the lifetime of the process.
        let _groups = consumer_groups
            .into_iter()
            .map(|group| {
                info!(%group, "Serving consumer group");
                store.subscribe(group)
            })
            .collect::<Vec<_>>();

        let updater = Updater::new(
            Arc::new(builder),
            store,
            faults.clone(),
            readiness.clone(),
            snapshot_metrics,
            UpdaterConfig {
                state_sample: Duration::from_millis(state_sample_ms),
            },
            states,
        );
        tokio::spawn(updater.run(drain_rx.clone()).instrument(info_span!("updater")));

        let admin = Admin::new(readiness, faults, local_state, prom);
        let mut admin = tokio::spawn(admin.serve(admin_addr, drain_rx));

        tokio::select! {
            _ = shutdown_signal() => {}
            res = &mut admin => {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => return Err(error.context("admin server failed")),
                    Err(error) => return Err(error.into()),
                }
                bail!("Aborted");
            }
        }

        info!("Shutting down");
        drain_tx.drain().await;
        Ok(())
    }
}

fn init_tracing(filter: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(filter).context("invalid log level")?;
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(error) => {
                    tracing::warn!(%error, "Failed to register SIGTERM handler");
                    ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if !signal_received(tokio::signal::ctrl_c().await, "SIGINT") {
        // Wait for the remaining shutdown triggers instead.
        std::future::pending::<()>().await;
    }
}

fn signal_received(result: std::io::Result<()>, signal: &'static str) -> bool {
    match result {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(%error, signal, "Failed to listen for signal");
            false
        }
    }
}

// === impl RemoteRegistry ===

impl FromStr for RemoteRegistry {
    type Err = InvalidRemoteRegistry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidRemoteRegistry(s.to_string());
        let (zone, addr) = s.split_once('=').ok_or_else(invalid)?;
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        if zone.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            zone: zone.to_string(),
            host: host.to_string(),
            port: port.parse().map_err(|_| invalid())?,
        })
    }
}
