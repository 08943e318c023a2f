use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{
    body::{Body, Incoming},
    header, Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use mesh_control_core::{FaultService, GoDuration, NetworkFault, Readiness, Selector};
use mesh_control_services::{StateRx, STATE_PATH};
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};

const FAULTS_PATH: &str = "/chaos/fault/read-network-delay";

/// Fault submissions larger than this are rejected.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Serves readiness and liveness checks, Prometheus metrics, the local zone's state and the
/// fault injection API.
#[derive(Clone, Debug)]
pub struct Admin {
    readiness: Arc<Readiness>,
    faults: FaultService,
    local_state: StateRx,
    metrics: Arc<Registry>,
}

/// A network delay submission. The identifier is generated when omitted.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitFault {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "affectedService")]
    source: Selector,
    #[serde(alias = "targetService")]
    target: Selector,
    delay: GoDuration,
    duration: GoDuration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FaultList {
    experiment_list: Vec<NetworkFault>,
}

// === impl Admin ===

impl Admin {
    pub fn new(
        readiness: Arc<Readiness>,
        faults: FaultService,
        local_state: StateRx,
        metrics: Registry,
    ) -> Self {
        Self {
            readiness,
            faults,
            local_state,
            metrics: Arc::new(metrics),
        }
    }

    #[instrument(skip(self, drain))]
    pub async fn serve(self, addr: SocketAddr, drain: drain::Watch) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "HTTP admin server listening");

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            let (io, client) = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!("Admin server shutting down");
                    return Ok(());
                }
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let admin = self.clone();
            tokio::spawn(async move {
                let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                    let admin = admin.clone();
                    async move { Ok::<_, hyper::Error>(admin.handle(req).await) }
                });
                if let Err(error) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(io), svc)
                    .await
                {
                    debug!(%client, %error, "Admin connection failed");
                }
            });
        }
    }

    async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/ready" => self.handle_ready(&method),
            "/live" => handle_live(&method),
            "/metrics" => self.handle_metrics(&method),
            STATE_PATH => self.handle_state(&method, None),
            FAULTS_PATH => match method {
                Method::GET => self.list_faults().await,
                Method::POST => self.submit_fault(req).await,
                _ => status(StatusCode::METHOD_NOT_ALLOWED),
            },
            _ => {
                if let Some(service) = path_param(&path, STATE_PATH) {
                    return self.handle_state(&method, Some(service));
                }
                match path_param(&path, FAULTS_PATH) {
                    Some(id) => match method {
                        Method::DELETE => self.delete_fault(id).await,
                        _ => status(StatusCode::METHOD_NOT_ALLOWED),
                    },
                    None => status(StatusCode::NOT_FOUND),
                }
            }
        }
    }

    /// Serves the transformed state of the local zone, or one service of it.
    fn handle_state(&self, method: &Method, service: Option<&str>) -> Response<Full<Bytes>> {
        if !matches!(*method, Method::GET | Method::HEAD) {
            return status(StatusCode::METHOD_NOT_ALLOWED);
        }
        let Some(state) = self.local_state.borrow().clone() else {
            return text(StatusCode::SERVICE_UNAVAILABLE, "state not loaded\n");
        };
        match service {
            None => json(StatusCode::OK, &*state),
            Some(service) => match state.get(service) {
                Some(instances) => json(StatusCode::OK, instances),
                None => status(StatusCode::NOT_FOUND),
            },
        }
    }

    fn handle_ready(&self, method: &Method) -> Response<Full<Bytes>> {
        match *method {
            Method::GET | Method::HEAD => {
                if self.readiness.is_initial_state_loaded() {
                    text(StatusCode::OK, "ready\n")
                } else {
                    text(StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
                }
            }
            _ => status(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    fn handle_metrics(&self, method: &Method) -> Response<Full<Bytes>> {
        if !matches!(*method, Method::GET | Method::HEAD) {
            return status(StatusCode::METHOD_NOT_ALLOWED);
        }
        let mut buf = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut buf, &self.metrics) {
            warn!(%error, "Failed to encode metrics");
            return status(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Full::new(Bytes::from(buf)))
            .unwrap()
    }

    async fn list_faults(&self) -> Response<Full<Bytes>> {
        match self.faults.list().await {
            Ok(experiment_list) => json(StatusCode::OK, &FaultList { experiment_list }),
            Err(error) => {
                warn!(%error, "Failed to list faults");
                status(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }

    async fn submit_fault<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(body) => body.to_bytes(),
            Err(error) if error.is::<LengthLimitError>() => {
                debug!("Fault submission too large");
                return status(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(error) => {
                debug!(%error, "Failed to read fault submission");
                return status(StatusCode::BAD_REQUEST);
            }
        };
        let SubmitFault {
            id,
            source,
            target,
            delay,
            duration,
        } = match serde_json::from_slice(&body) {
            Ok(submission) => submission,
            Err(error) => {
                debug!(%error, "Invalid fault submission");
                return text(StatusCode::BAD_REQUEST, format!("{error}\n"));
            }
        };
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        match self
            .faults
            .submit(NetworkFault::new(id, source, target, delay, duration))
            .await
        {
            Ok(fault) => json(StatusCode::OK, &fault),
            Err(error) => {
                warn!(%error, "Failed to store fault");
                status(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }

    async fn delete_fault(&self, id: &str) -> Response<Full<Bytes>> {
        match self.faults.delete(id).await {
            Ok(()) => status(StatusCode::NO_CONTENT),
            Err(error) => {
                warn!(%error, %id, "Failed to delete fault");
                status(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }
}

/// Returns the single path segment that follows `prefix`.
fn path_param<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    let param = path.strip_prefix(prefix)?.strip_prefix('/')?;
    (!param.is_empty() && !param.contains('/')).then_some(param)
}

fn handle_live(method: &Method) -> Response<Full<Bytes>> {
    match *method {
        Method::GET | Method::HEAD => text(StatusCode::OK, "live\n"),
        _ => status(StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn status(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::default())
        .unwrap()
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(body.into()))
        .unwrap()
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(error) => {
            warn!(%error, "Failed to encode response");
            self::status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
