//! REST Endpoint
//!
//! Plain HTTP/1 server on the REST port carrying:
//!
//! - `/healthz`, `/livez`, `/readyz` health checks
//! - `/metrics` Prometheus exposition
//! - read-only inventory under `/v0/nodes`, `/v0/pools` and `/v0/volumes`
//! - node agent ingress: `POST /v0/nodes/register` is published onto the
//!   message bus; `POST /v0/nodes/heartbeat` and `DELETE /v0/nodes/{id}` are
//!   applied before replying, so an agent the registry does not know gets a
//!   404 and registers again
//! - pool administration: `POST /v0/nodes/{id}/pools`, `DELETE /v0/pools/{id}`

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::protocol::{PoolReport, PROTOCOL_VERSION};
use crate::bus::NodeEvent;
use crate::controller::ControlPlane;
use crate::domain::model::{Nexus, NodeId, PoolId, Replica, Volume, VolumeId};
use crate::error::{Error, Result};
use crate::metrics;

/// Largest request body accepted.
const MAX_BODY_BYTES: usize = 1 << 20;

type HttpResponse = Response<Full<Bytes>>;

// =============================================================================
// Request / Response Bodies
// =============================================================================

/// Body of `POST /v0/nodes/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node: NodeId,
    pub endpoint: String,
    #[serde(default)]
    pub pools: Vec<PoolReport>,
    #[serde(default)]
    pub version: Option<u32>,
}

/// Body of `POST /v0/nodes/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node: NodeId,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pools: Option<Vec<PoolReport>>,
}

/// Body of `POST /v0/nodes/{id}/pools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePoolRequest {
    pub id: PoolId,
    #[serde(default)]
    pub disks: Vec<String>,
}

/// A volume with the records it owns.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeDetail {
    pub volume: Volume,
    pub nexus: Option<Nexus>,
    pub replicas: Vec<Replica>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

// =============================================================================
// Server
// =============================================================================

/// Serve the REST endpoint until `shutdown` fires.
pub async fn serve(
    addr: &str,
    control_plane: Arc<ControlPlane>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::InvalidArgument(format!("Invalid REST address '{}': {}", addr, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;

    info!("REST server listening on {}", addr);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "REST server accept error");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let control_plane = control_plane.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(control_plane.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %peer, error = %e, "REST connection error");
            }
        });
    }

    info!("REST server stopped");
    Ok(())
}

/// Route one request.
pub async fn handle<B>(
    control_plane: Arc<ControlPlane>,
    req: Request<B>,
) -> std::result::Result<HttpResponse, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["healthz"]) | (&Method::GET, ["livez"]) => Ok(text(StatusCode::OK, "ok")),
        (&Method::GET, ["readyz"]) => Ok(if control_plane.is_ready() {
            text(StatusCode::OK, "ok")
        } else {
            text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
        }),
        (&Method::GET, ["metrics"]) => metrics_response(),

        (&Method::GET, ["v0", "nodes"]) => json(StatusCode::OK, &control_plane.registry().list_nodes()),
        (&Method::GET, ["v0", "nodes", id]) => control_plane
            .registry()
            .get_node(&NodeId::new(*id))
            .and_then(|node| json(StatusCode::OK, &node)),
        (&Method::POST, ["v0", "nodes", "register"]) => match read_json(req).await {
            Ok(body) => register(&control_plane, body),
            Err(e) => Err(e),
        },
        (&Method::POST, ["v0", "nodes", "heartbeat"]) => match read_json(req).await {
            Ok(body) => heartbeat(&control_plane, body).await,
            Err(e) => Err(e),
        },
        (&Method::DELETE, ["v0", "nodes", id]) => control_plane
            .apply_node_event(&NodeEvent::Deregister {
                node: NodeId::new(*id),
            })
            .await
            .map(|()| empty(StatusCode::NO_CONTENT)),
        (&Method::POST, ["v0", "nodes", id, "pools"]) => {
            let node = NodeId::new(*id);
            match read_json::<_, CreatePoolRequest>(req).await {
                Ok(body) => control_plane
                    .scheduler()
                    .create_pool(&node, &body.id, &body.disks)
                    .await
                    .and_then(|pool| json(StatusCode::CREATED, &pool)),
                Err(e) => Err(e),
            }
        }

        (&Method::GET, ["v0", "pools"]) => {
            let snapshot = control_plane.store().snapshot();
            let pools: Vec<_> = snapshot.pools().collect();
            json(StatusCode::OK, &pools)
        }
        (&Method::DELETE, ["v0", "pools", id]) => control_plane
            .scheduler()
            .destroy_pool(&PoolId::new(*id))
            .await
            .map(|()| empty(StatusCode::NO_CONTENT)),

        (&Method::GET, ["v0", "volumes"]) => {
            let snapshot = control_plane.store().snapshot();
            let volumes: Vec<_> = snapshot.volumes().collect();
            json(StatusCode::OK, &volumes)
        }
        (&Method::GET, ["v0", "volumes", id]) => volume_detail(&control_plane, &VolumeId::new(*id))
            .and_then(|detail| json(StatusCode::OK, &detail)),

        _ => Ok(text(StatusCode::NOT_FOUND, "not found")),
    };

    Ok(result.unwrap_or_else(|e| {
        debug!(method = %method, path = %path, error = %e, "REST request failed");
        error_response(&e)
    }))
}

// =============================================================================
// Handlers
// =============================================================================

fn register(control_plane: &ControlPlane, body: RegisterRequest) -> Result<HttpResponse> {
    let version = body.version.unwrap_or(PROTOCOL_VERSION);
    if version != PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "node {} speaks protocol v{}, expected v{}",
            body.node, version, PROTOCOL_VERSION
        )));
    }
    if body.node.as_str().is_empty() || body.endpoint.is_empty() {
        return Err(Error::InvalidArgument(
            "node and endpoint must not be empty".into(),
        ));
    }
    control_plane.bus().publish(NodeEvent::Register {
        node: body.node,
        endpoint: body.endpoint,
        pools: body.pools,
        version,
    });
    Ok(text(StatusCode::ACCEPTED, "accepted"))
}

async fn heartbeat(control_plane: &ControlPlane, body: HeartbeatRequest) -> Result<HttpResponse> {
    let event = NodeEvent::Heartbeat {
        node: body.node,
        timestamp: body.timestamp.unwrap_or_else(Utc::now),
        pools: body.pools,
    };
    control_plane.apply_node_event(&event).await?;
    Ok(text(StatusCode::OK, "ok"))
}

fn volume_detail(control_plane: &ControlPlane, id: &VolumeId) -> Result<VolumeDetail> {
    let snapshot = control_plane.store().snapshot();
    let volume = snapshot
        .volume(id)
        .cloned()
        .ok_or_else(|| Error::not_found("volume", id))?;
    Ok(VolumeDetail {
        nexus: snapshot.nexus_of(id).cloned(),
        replicas: snapshot.replicas_of(id).into_iter().cloned().collect(),
        volume,
    })
}

fn metrics_response() -> Result<HttpResponse> {
    let (content_type, buffer) = metrics::gather()?;
    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&content_type).unwrap_or(HeaderValue::from_static("text/plain")),
    );
    Ok(response)
}

// =============================================================================
// Helpers
// =============================================================================

async fn read_json<B, T>(req: Request<B>) -> Result<T>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: for<'de> Deserialize<'de>,
{
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| Error::InvalidArgument(format!("failed to read request body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidArgument(format!("invalid JSON body: {}", e)))
}

fn text(status: StatusCode, body: &'static str) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn empty(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Result<HttpResponse> {
    let body = serde_json::to_vec(value)?;
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::AlreadyExists { .. } | Error::Conflict { .. } => StatusCode::CONFLICT,
        Error::InvalidArgument(_) | Error::Protocol(_) => StatusCode::BAD_REQUEST,
        Error::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
        Error::InsufficientResources(_) => StatusCode::INSUFFICIENT_STORAGE,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::NodeRejected { .. } => StatusCode::BAD_GATEWAY,
        Error::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> HttpResponse {
    let status = status_for(err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "REST request failed");
    }
    let body = ErrorBody {
        error: err.to_string(),
        kind: err.label(),
    };
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| err.to_string().into_bytes());
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
