//! Client side of the connection to a cluster.
//!
//! The executor only sees the [`Connector`] and [`Connection`] traits. The
//! shipped implementation, [`GrpcConnector`], speaks the Cass gRPC query
//! service (`/cass.Cass/Query`) with prost-encoded messages.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tonic::{
    Request,
    codec::ProstCodec,
    codegen::http::uri::PathAndQuery,
    metadata::{Ascii, MetadataValue},
    transport::{Channel, Endpoint},
};
use tracing::debug;

use crate::{
    cluster::{Cluster, Credentials},
    config::Settings,
    telemetry,
};

/// A single value as returned by the cluster.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    /// Collections, UDTs and other nested values.
    Structured(Value),
}

impl CellValue {
    /// Render the value for display in a result grid.
    pub fn to_display(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            CellValue::Structured(v) => v.to_string(),
        }
    }
}

/// Columns and rows returned by a query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

/// Errors surfaced by a connector or connection.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// None of the contact points accepted a connection.
    #[error("no contact point reachable: {0}")]
    Unreachable(String),
    /// The connect or read budget ran out.
    #[error("{0}")]
    Timeout(String),
    /// The connection was shut down, possibly while a call was in flight.
    #[error("connection closed")]
    Closed,
    /// Any other failure reported by the cluster or transport.
    #[error("{0}")]
    Execution(String),
}

/// Everything needed to open a data connection to one cluster.
#[derive(Clone, Debug)]
pub struct ConnectTarget {
    /// Host and port pairs, tried in order.
    pub endpoints: Vec<(String, u16)>,
    pub datacenter: String,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl ConnectTarget {
    /// Build the connection target for `cluster`. Only the host part of each
    /// contact point is kept unless declared ports are honored.
    pub fn for_cluster(cluster: &Cluster, settings: &Settings) -> Self {
        let endpoints = cluster
            .contact_points
            .iter()
            .map(|cp| {
                (
                    cp.host.clone(),
                    cp.data_port(settings.default_port, settings.honor_declared_ports),
                )
            })
            .collect();
        Self {
            endpoints,
            datacenter: cluster.datacenter.clone(),
            credentials: cluster.credentials.clone(),
            connect_timeout: settings.connect_timeout,
            read_timeout: settings.read_timeout,
        }
    }
}

/// Opens connections to a cluster.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>, ClientError>;
}

/// A live connection owned by one query.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn execute(&self, text: &str) -> Result<ResultSet, ClientError>;

    /// Close the connection. Must be idempotent and must unblock an
    /// in-flight `execute`, which then fails with [`ClientError::Closed`].
    async fn shutdown(&self);
}

/// Wire messages of the Cass query service.
pub mod rpc {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct QueryRequest {
        #[prost(string, tag = "1")]
        pub sql: String,
        #[prost(uint64, tag = "2")]
        pub ts: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Row {
        #[prost(map = "string, string", tag = "1")]
        pub columns: HashMap<String, String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ResultSet {
        #[prost(message, repeated, tag = "1")]
        pub rows: Vec<Row>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct QueryResponse {
        #[prost(oneof = "query_response::Payload", tags = "2")]
        pub payload: Option<query_response::Payload>,
    }

    pub mod query_response {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Payload {
            #[prost(message, tag = "2")]
            Rows(super::ResultSet),
        }
    }
}

const QUERY_PATH: &str = "/cass.Cass/Query";
const DATACENTER_HEADER: &str = "x-cass-datacenter";

/// Convert a row-map response into a column-ordered result set. Columns are
/// the sorted union of every row's keys; missing cells become `Null`.
pub fn rows_to_result_set(rows: Vec<rpc::Row>) -> ResultSet {
    let mut columns: Vec<String> = rows
        .iter()
        .flat_map(|r| r.columns.keys().cloned())
        .collect();
    columns.sort();
    columns.dedup();
    let rows = rows
        .into_iter()
        .map(|mut row| {
            columns
                .iter()
                .map(|c| match row.columns.remove(c) {
                    Some(v) => CellValue::Text(v),
                    None => CellValue::Null,
                })
                .collect()
        })
        .collect();
    ResultSet { columns, rows }
}

/// Connector for clusters exposing the Cass gRPC query service.
#[derive(Clone, Default)]
pub struct GrpcConnector;

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>, ClientError> {
        if target.endpoints.is_empty() {
            return Err(ClientError::Unreachable("no contact points".into()));
        }
        let mut failures = Vec::new();
        let mut all_timed_out = true;
        for (host, port) in &target.endpoints {
            let uri = if host.contains(':') {
                format!("http://[{host}]:{port}")
            } else {
                format!("http://{host}:{port}")
            };
            let endpoint = match Endpoint::from_shared(uri.clone()) {
                Ok(e) => e.connect_timeout(target.connect_timeout),
                Err(e) => {
                    all_timed_out = false;
                    failures.push(format!("{uri}: {e}"));
                    continue;
                }
            };
            match tokio::time::timeout(target.connect_timeout, endpoint.connect()).await {
                Ok(Ok(channel)) => {
                    debug!(%uri, datacenter = %target.datacenter, "connected");
                    let conn = GrpcConnection::new(channel, target)?;
                    return Ok(Arc::new(conn));
                }
                Ok(Err(e)) => {
                    all_timed_out = false;
                    failures.push(format!("{uri}: {e}"));
                }
                Err(_) => failures.push(format!("{uri}: connect timed out")),
            }
        }
        let detail = failures.join("; ");
        if all_timed_out {
            Err(ClientError::Timeout(format!(
                "connect timed out after {:?}: {detail}",
                target.connect_timeout
            )))
        } else {
            Err(ClientError::Unreachable(detail))
        }
    }
}

/// One gRPC channel to a cluster node.
pub struct GrpcConnection {
    channel: Channel,
    datacenter: MetadataValue<Ascii>,
    authorization: Option<MetadataValue<Ascii>>,
    read_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl GrpcConnection {
    fn new(channel: Channel, target: &ConnectTarget) -> Result<Self, ClientError> {
        let datacenter = MetadataValue::try_from(target.datacenter.as_str())
            .map_err(|e| ClientError::Execution(format!("invalid datacenter label: {e}")))?;
        let authorization = match &target.credentials {
            Some(c) => {
                let token = STANDARD.encode(format!("{}:{}", c.username, c.password));
                Some(
                    MetadataValue::try_from(format!("Basic {token}"))
                        .map_err(|e| ClientError::Execution(format!("invalid credentials: {e}")))?,
                )
            }
            None => None,
        };
        let (closed, _) = watch::channel(false);
        Ok(Self {
            channel,
            datacenter,
            authorization,
            read_timeout: target.read_timeout,
            closed,
        })
    }

    async fn call(&self, text: &str) -> Result<ResultSet, ClientError> {
        let mut request = Request::new(rpc::QueryRequest {
            sql: text.to_string(),
            ts: 0,
        });
        let metadata = request.metadata_mut();
        metadata.insert(DATACENTER_HEADER, self.datacenter.clone());
        if let Some(auth) = &self.authorization {
            metadata.insert("authorization", auth.clone());
        }
        telemetry::inject_context(metadata);

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| ClientError::Execution(format!("service not ready: {e}")))?;
        let codec: ProstCodec<rpc::QueryRequest, rpc::QueryResponse> = ProstCodec::default();
        let response = grpc
            .unary(request, PathAndQuery::from_static(QUERY_PATH), codec)
            .await
            .map_err(|status| ClientError::Execution(status.message().to_string()))?;
        Ok(match response.into_inner().payload {
            Some(rpc::query_response::Payload::Rows(rs)) => rows_to_result_set(rs.rows),
            None => ResultSet::default(),
        })
    }
}

#[async_trait]
impl Connection for GrpcConnection {
    async fn execute(&self, text: &str) -> Result<ResultSet, ClientError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(ClientError::Closed);
        }
        let call = tokio::time::timeout(self.read_timeout, self.call(text));
        tokio::select! {
            res = call => res.unwrap_or_else(|_| {
                Err(ClientError::Timeout(format!(
                    "no response within {:?}",
                    self.read_timeout
                )))
            }),
            _ = closed.wait_for(|c| *c) => Err(ClientError::Closed),
        }
    }

    async fn shutdown(&self) {
        self.closed.send_replace(true);
    }
}
