//! A [`Registry`] backed by Consul's HTTP API.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use mesh_control_core::registry::{
    Catalog, CatalogEntry, Instances, Registry, RegistryError, RegistryInstance,
};
use serde::{de::DeserializeOwned, Deserialize};
use std::{collections::BTreeMap, fmt::Write, sync::Arc, time::Duration};
use tokio::sync::Semaphore;

#[derive(Clone, Debug)]
pub struct ConsulConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// How long an idle pooled connection is kept open.
    pub pool_keep_alive: Duration,
    /// Maximum idle connections kept in the pool.
    pub max_pool_size: usize,
    /// Maximum number of requests in flight at once.
    pub max_connections: usize,
}

#[derive(Clone, Debug)]
pub struct ConsulRegistry {
    client: Client<HttpConnector, Empty<Bytes>>,
    authority: Arc<str>,
    permits: Arc<Semaphore>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    service: HealthService,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u32,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    status: String,
}

const CONSUL_INDEX: &str = "x-consul-index";

// === impl ConsulRegistry ===

impl ConsulRegistry {
    pub fn new(config: &ConsulConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_keepalive(Some(config.pool_keep_alive));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.pool_keep_alive)
            .pool_max_idle_per_host(config.max_pool_size)
            .build(connector);

        Self {
            client,
            authority: format!("{}:{}", config.host, config.port).into(),
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<(Option<u64>, T), RegistryError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| RegistryError::Transport(e.into()))?;

        let req = http::Request::get(format!("http://{}{path}", self.authority))
            .header(http::header::ACCEPT_ENCODING, "identity")
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
        let index = rsp
            .headers()
            .get(CONSUL_INDEX)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = rsp
            .into_body()
            .collect()
            .await
            .map_err(|e| RegistryError::Transport(e.into()))?
            .to_bytes();
        let value = serde_json::from_slice(&body).map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok((index, value))
    }
}

#[async_trait::async_trait]
impl Registry for ConsulRegistry {
    async fn catalog(&self) -> Result<Catalog, RegistryError> {
        let (index, services) = self.get("/v1/catalog/services").await?;
        Ok(catalog(index, services))
    }

    async fn instances(&self, service: &str) -> Result<Instances, RegistryError> {
        let path = format!("/v1/health/service/{}", encode_path_segment(service));
        let (index, entries) = self.get(&path).await?;
        Ok(instances(index, entries))
    }
}

fn catalog(index: Option<u64>, services: BTreeMap<String, Option<Vec<String>>>) -> Catalog {
    Catalog {
        index,
        services: services
            .into_iter()
            .map(|(service, tags)| CatalogEntry::new(service, tags.unwrap_or_default()))
            .collect(),
    }
}

fn instances(index: Option<u64>, entries: Vec<HealthEntry>) -> Instances {
    Instances {
        index,
        instances: entries
            .into_iter()
            .map(|HealthEntry { service, checks }| RegistryInstance {
                id: service.id,
                address: service.address,
                port: service.port,
                tags: service.tags.unwrap_or_default(),
                healthy: checks.iter().all(|c| c.status == "passing"),
            })
            .collect(),
    }
}

fn encode_path_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for b in segment.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(b));
        } else {
            let _ = write!(encoded, "%{b:02X}");
        }
    }
    encoded
}
