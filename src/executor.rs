//! Query submission and cancellation.

use std::{sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{Span, debug, field, info, warn};
use uuid::Uuid;

use crate::{
    client::{ConnectTarget, Connection, Connector, ResultSet},
    cluster::{Cluster, ClusterDirectory},
    config::Settings,
    metrics::QUERIES_TOTAL,
    query::{QueryError, QueryResult, QueryState, validate_read_only},
    querylog::{LogStatus, QueryLogEntry, QueryLogSink},
    registry::{QueryRegistry, RegistryError, RunningQuery, RunningQueryInfo},
};

/// Identity of whoever submits or cancels a query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub is_admin: bool,
}

impl Caller {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: id.into(),
            is_admin: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            user_id: id.into(),
            is_admin: true,
        }
    }
}

/// A query submission.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub cluster_id: String,
    pub text: String,
    pub caller: Caller,
    /// Caller-chosen id, so the query can be cancelled while it runs.
    pub query_id: Option<Uuid>,
}

/// Runs read-only queries against clusters and tears them down on every
/// exit path.
pub struct QueryService {
    registry: Arc<QueryRegistry>,
    directory: Arc<dyn ClusterDirectory>,
    connector: Arc<dyn Connector>,
    log: Arc<dyn QueryLogSink>,
    settings: Settings,
}

impl QueryService {
    pub fn new(
        registry: Arc<QueryRegistry>,
        directory: Arc<dyn ClusterDirectory>,
        connector: Arc<dyn Connector>,
        log: Arc<dyn QueryLogSink>,
        settings: Settings,
    ) -> Self {
        Self {
            registry,
            directory,
            connector,
            log,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.registry
    }

    /// Validate, run and tear down one query.
    ///
    /// On return the entry this call registered is gone, whatever the
    /// outcome. A later query reusing the id is not touched.
    #[tracing::instrument(
        skip(self, request),
        fields(cluster.id = %request.cluster_id, user = %request.caller.user_id, query.id = field::Empty)
    )]
    pub async fn submit(&self, request: QueryRequest) -> Result<QueryResult, QueryError> {
        let started = Instant::now();
        let cluster = self
            .directory
            .cluster(&request.cluster_id)
            .await
            .map_err(|e| QueryError::Execution(format!("cluster directory unavailable: {e}")))?
            .ok_or_else(|| QueryError::ClusterNotFound(request.cluster_id.clone()))?;

        let query_id = request.query_id.unwrap_or_else(Uuid::new_v4);
        Span::current().record("query.id", field::display(query_id));
        let entry = match self
            .registry
            .register(query_id, &request.caller.user_id, &cluster.id, &request.text)
            .await
        {
            Ok(entry) => entry,
            Err(err) => return Err(self.collision(query_id, &request.caller, err).await),
        };
        debug!(state = %QueryState::Submitted, "query registered");

        let outcome = self.run(&entry, &cluster).await;
        self.registry.remove_entry(&entry).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let outcome = outcome.map(|rs| {
            QueryResult::from_result_set(query_id, rs, self.settings.max_rows, elapsed_ms)
        });
        match &outcome {
            Ok(res) => info!(
                state = %QueryState::Completed,
                rows = res.total_rows,
                duration_ms = elapsed_ms,
                "query completed"
            ),
            Err(QueryError::Cancelled) => {
                info!(state = %QueryState::Cancelled, duration_ms = elapsed_ms, "query cancelled")
            }
            Err(err) => warn!(
                state = %QueryState::Failed,
                %err,
                duration_ms = elapsed_ms,
                "query failed"
            ),
        }
        self.record(&entry, elapsed_ms, &outcome).await;
        outcome
    }

    async fn run(&self, entry: &RunningQuery, cluster: &Cluster) -> Result<ResultSet, QueryError> {
        debug!(state = %QueryState::Validating);
        validate_read_only(&entry.text)?;

        debug!(state = %QueryState::Connecting);
        checkpoint(entry)?;
        let target = ConnectTarget::for_cluster(cluster, &self.settings);
        let contact_points: Vec<String> = target
            .endpoints
            .iter()
            .map(|(h, p)| format!("{h}:{p}"))
            .collect();
        info!(
            cluster = %cluster.name,
            contact_points = %contact_points.join(", "),
            datacenter = %target.datacenter,
            credentials = target.credentials.is_some(),
            "connecting"
        );
        let connect = tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(&target),
        );
        let connection = match connect.await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => return Err(classify(entry, err.into())),
            Err(_) => {
                return Err(classify(
                    entry,
                    QueryError::Timeout(format!(
                        "connect timed out after {:?}",
                        self.settings.connect_timeout
                    )),
                ));
            }
        };

        let result = self.execute_on(entry, connection.clone()).await;
        connection.shutdown().await;
        result
    }

    async fn execute_on(
        &self,
        entry: &RunningQuery,
        connection: Arc<dyn Connection>,
    ) -> Result<ResultSet, QueryError> {
        if let Err(err) = self.registry.attach_connection(entry, connection.clone()).await {
            // a cancel removed the entry between connect and attach
            return Err(classify(entry, err.into()));
        }
        checkpoint(entry)?;

        debug!(state = %QueryState::Executing);
        let call = tokio::time::timeout(self.settings.read_timeout, connection.execute(&entry.text));
        let result = match call.await {
            Ok(res) => res.map_err(QueryError::from),
            Err(_) => Err(QueryError::Timeout(format!(
                "no response within {:?}",
                self.settings.read_timeout
            ))),
        };
        // a cancel that raced the response wins, even over a success
        checkpoint(entry)?;
        result
    }

    /// A supplied id already in use reads as a duplicate only to someone who
    /// could see that query anyway; everyone else gets not-found.
    async fn collision(&self, query_id: Uuid, caller: &Caller, err: RegistryError) -> QueryError {
        if !matches!(err, RegistryError::DuplicateId(_)) || caller.is_admin {
            return err.into();
        }
        match self.registry.get(query_id).await {
            Some(existing) if existing.owner_id == caller.user_id => err.into(),
            _ => QueryError::QueryNotFound(query_id),
        }
    }

    /// Cancel a running query on behalf of `caller`.
    #[tracing::instrument(skip(self, caller), fields(user = %caller.user_id))]
    pub async fn cancel(&self, query_id: Uuid, caller: &Caller) -> Result<(), QueryError> {
        let connection = self
            .registry
            .cancel(query_id, &caller.user_id, caller.is_admin)
            .await?;
        if let Some(conn) = connection {
            conn.shutdown().await;
            info!("query cancelled, connection closed");
        } else {
            info!("query cancelled before connecting");
        }
        Ok(())
    }

    /// Running queries visible to `caller`.
    pub async fn running(&self, caller: &Caller) -> Vec<RunningQueryInfo> {
        self.registry
            .list(&caller.user_id, caller.is_admin)
            .await
            .iter()
            .map(RunningQuery::info)
            .collect()
    }

    async fn record(
        &self,
        entry: &RunningQuery,
        elapsed_ms: u64,
        outcome: &Result<QueryResult, QueryError>,
    ) {
        let (status, rows_returned, error_message) = match outcome {
            Ok(res) => (LogStatus::Success, res.rows.len(), None),
            Err(err) => (err.log_status(), 0, Some(err.to_string())),
        };
        QUERIES_TOTAL.with_label_values(&[status.as_str()]).inc();
        self.log
            .record(QueryLogEntry {
                query_id: entry.id,
                user_id: entry.owner_id.clone(),
                cluster_id: entry.cluster_id.clone(),
                query_text: entry.text.clone(),
                execution_time_ms: elapsed_ms,
                rows_returned,
                status,
                error_message,
                recorded_at: Utc::now(),
            })
            .await;
    }
}

/// Cancellation checkpoint.
fn checkpoint(entry: &RunningQuery) -> Result<(), QueryError> {
    if entry.is_cancelled() {
        Err(QueryError::Cancelled)
    } else {
        Ok(())
    }
}

/// Failures observed after a cancel report as cancellation.
fn classify(entry: &RunningQuery, err: QueryError) -> QueryError {
    if entry.is_cancelled() {
        QueryError::Cancelled
    } else {
        err
    }
}
