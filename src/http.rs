//! JSON API over hyper.
//!
//! Identity is taken from the `x-user-id` header and admin rights from
//! `x-user-role: admin`; authentication happens in front of this service.

use std::{convert::Infallible, future::Future, net::TcpListener, sync::Arc};

use chrono::{DateTime, Utc};
use hyper::{
    Body, Method, Request, Response, Server, StatusCode,
    header::{CONTENT_TYPE, HeaderValue},
    service::{make_service_fn, service_fn},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{Instrument, error, info, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use crate::{
    executor::{Caller, QueryRequest, QueryService},
    health::{HealthMonitor, HealthStatus, HostStatus},
    metrics, telemetry,
};

pub const USER_HEADER: &str = "x-user-id";
pub const ROLE_HEADER: &str = "x-user-role";

/// Shared handles used by every request.
pub struct ApiState {
    pub service: Arc<QueryService>,
    pub monitor: Arc<HealthMonitor>,
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<ApiState>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    listener.set_nonblocking(true)?;
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(state, req).await) }
            }))
        }
    });
    let server = Server::from_tcp(listener)
        .map_err(std::io::Error::other)?
        .serve(make_svc);
    info!(addr = %server.local_addr(), "http api listening");
    server
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(std::io::Error::other)
}

async fn handle(state: Arc<ApiState>, req: Request<Body>) -> Response<Body> {
    let span = tracing::info_span!(
        "http.request",
        http.method = %req.method(),
        http.path = %req.uri().path(),
    );
    span.set_parent(telemetry::extract_remote_context(req.headers()));
    route(state, req).instrument(span).await
}

async fn route(state: Arc<ApiState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (method, path.as_str()) {
        (Method::GET, "/api/health") => json_response(
            StatusCode::OK,
            &json!({"status": "OK", "timestamp": Utc::now()}),
        ),
        (Method::GET, "/metrics") => {
            let mut resp = Response::new(Body::from(metrics::encode_to_string()));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            resp
        }
        (Method::GET, "/api/clusters") => list_clusters(&state).await,
        (Method::GET, "/api/clusters/health") => check_health(&state).await,
        (Method::POST, "/api/query/execute") => match caller(&req) {
            Some(caller) => execute(&state, caller, req).await,
            None => unauthenticated(),
        },
        (Method::POST, "/api/query/cancel") => match caller(&req) {
            Some(caller) => cancel(&state, caller, req).await,
            None => unauthenticated(),
        },
        (Method::GET, "/api/queries/running") => match caller(&req) {
            Some(caller) => {
                let queries = state.service.running(&caller).await;
                json_response(StatusCode::OK, &json!({ "queries": queries }))
            }
            None => unauthenticated(),
        },
        _ => error_response(StatusCode::NOT_FOUND, "not_found", "no such route", None),
    }
}

fn caller(req: &Request<Body>) -> Option<Caller> {
    let user_id = req
        .headers()
        .get(USER_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .to_string();
    if user_id.is_empty() {
        return None;
    }
    let is_admin = req
        .headers()
        .get(ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|role| role.eq_ignore_ascii_case("admin"));
    Some(Caller { user_id, is_admin })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterView {
    id: String,
    name: String,
    hosts: Vec<String>,
    datacenter: String,
    status: String,
    online_hosts: usize,
    total_hosts: usize,
    last_check: Option<DateTime<Utc>>,
}

async fn list_clusters(state: &ApiState) -> Response<Body> {
    match state.monitor.cached().await {
        Ok(pairs) => {
            let mut views: Vec<ClusterView> = pairs
                .into_iter()
                .map(|(cluster, status)| ClusterView {
                    hosts: cluster
                        .contact_points
                        .iter()
                        .map(|cp| cp.to_string())
                        .collect(),
                    id: cluster.id,
                    name: cluster.name,
                    datacenter: cluster.datacenter,
                    status: status.state.to_string(),
                    online_hosts: status.online_hosts,
                    total_hosts: status.total_hosts,
                    last_check: status.last_checked,
                })
                .collect();
            views.sort_by(|a, b| a.name.cmp(&b.name));
            json_response(StatusCode::OK, &views)
        }
        Err(err) => {
            error!(%err, "cannot list clusters");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "directory",
                &err.to_string(),
                None,
            )
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthView {
    cluster_id: String,
    status: String,
    online_hosts: usize,
    total_hosts: usize,
    per_host_status: Vec<HostStatus>,
    last_check: Option<DateTime<Utc>>,
}

impl From<HealthStatus> for HealthView {
    fn from(status: HealthStatus) -> Self {
        Self {
            cluster_id: status.cluster_id,
            status: status.state.to_string(),
            online_hosts: status.online_hosts,
            total_hosts: status.total_hosts,
            per_host_status: status.hosts,
            last_check: status.last_checked,
        }
    }
}

async fn check_health(state: &ApiState) -> Response<Body> {
    let views: Vec<HealthView> = state
        .monitor
        .refresh()
        .await
        .into_iter()
        .map(HealthView::from)
        .collect();
    json_response(StatusCode::OK, &views)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteBody {
    cluster_id: String,
    query: String,
    query_id: Option<Uuid>,
}

async fn execute(state: &ApiState, caller: Caller, req: Request<Body>) -> Response<Body> {
    let body: ExecuteBody = match read_json(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    if body.cluster_id.trim().is_empty() || body.query.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "clusterId and query are required",
            None,
        );
    }
    let query_id = body.query_id.unwrap_or_else(Uuid::new_v4);
    let request = QueryRequest {
        cluster_id: body.cluster_id,
        text: body.query,
        caller,
        query_id: Some(query_id),
    };
    // detached so teardown and logging finish even if the client goes away
    let service = state.service.clone();
    let task = tokio::spawn(async move { service.submit(request).await }.in_current_span());
    match task.await {
        Ok(Ok(result)) => json_response(StatusCode::OK, &result),
        Ok(Err(err)) => query_error_response(&err, Some(query_id)),
        Err(err) => {
            error!(%err, query.id = %query_id, "query task failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "execution",
                "query task failed",
                Some(query_id),
            )
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    query_id: Uuid,
}

async fn cancel(state: &ApiState, caller: Caller, req: Request<Body>) -> Response<Body> {
    let body: CancelBody = match read_json(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    match state.service.cancel(body.query_id, &caller).await {
        Ok(()) => json_response(
            StatusCode::OK,
            &json!({"success": true, "queryId": body.query_id}),
        ),
        Err(err) => query_error_response(&err, Some(body.query_id)),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body()).await.map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, "bad_request", &e.to_string(), None)
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            &format!("invalid request body: {e}"),
            None,
        )
    })
}

fn query_error_response(err: &crate::query::QueryError, query_id: Option<Uuid>) -> Response<Body> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, err.kind(), &err.to_string(), query_id)
}

fn unauthenticated() -> Response<Body> {
    error_response(
        StatusCode::UNAUTHORIZED,
        "unauthenticated",
        "missing x-user-id header",
        None,
    )
}

fn error_response(
    status: StatusCode,
    kind: &str,
    message: &str,
    query_id: Option<Uuid>,
) -> Response<Body> {
    let mut body = json!({"error": message, "kind": kind});
    if let (Some(id), Value::Object(map)) = (query_id, &mut body) {
        map.insert("queryId".into(), Value::String(id.to_string()));
    }
    json_response(status, &body)
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Body> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(err) => {
            warn!(%err, "cannot encode response body");
            let mut resp = Response::new(Body::from("{\"error\":\"encoding failed\"}"));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return resp;
        }
    };
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}
