mod common;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use cass_pilot::{
    Caller, QueryError, QueryRequest, QueryService, Settings,
    client::{ClientError, ConnectTarget, Connection, Connector, ResultSet},
    cluster::StaticDirectory,
    querylog::LogStatus,
    registry::QueryRegistry,
};
use common::{FakeConnector, Harness, MemoryLog, cluster, rows};
use uuid::Uuid;

fn request(text: &str) -> QueryRequest {
    QueryRequest {
        cluster_id: "c1".into(),
        text: text.into(),
        caller: Caller::user("alice"),
        query_id: None,
    }
}

#[tokio::test]
async fn select_returns_rows_and_is_logged() {
    let h = Harness::new(
        FakeConnector::returning(rows(2)).with_execute_delay(Duration::from_millis(5)),
        Settings::default(),
    );
    let res = h
        .service
        .submit(request("SELECT id, name FROM ks.users"))
        .await
        .unwrap();

    assert_eq!(res.columns, vec!["id".to_string(), "name".to_string()]);
    assert_eq!(
        res.rows,
        vec![
            vec!["0".to_string(), "row0".to_string()],
            vec!["1".to_string(), "row1".to_string()],
        ]
    );
    assert_eq!(res.total_rows, 2);
    assert!(!res.truncated);
    assert!(res.execution_time_ms > 0);

    assert!(h.registry.is_empty().await);
    assert_eq!(h.connector.connects(), 1);
    assert!(h.connector.last_connection().unwrap().is_closed());

    let log = h.log.entries();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, LogStatus::Success);
    assert_eq!(log[0].rows_returned, 2);
    assert_eq!(log[0].user_id, "alice");
    assert_eq!(log[0].cluster_id, "c1");
    assert_eq!(log[0].query_id, res.query_id);
    assert!(log[0].error_message.is_none());
}

#[tokio::test]
async fn connect_target_uses_host_only_with_default_port() {
    let h = Harness::new(FakeConnector::returning(rows(0)), Settings::default());
    h.service.submit(request("SELECT 1")).await.unwrap();
    let target = h.connector.last_target().unwrap();
    assert_eq!(
        target.endpoints,
        vec![("10.0.0.1".to_string(), 9042), ("10.0.0.2".to_string(), 9042)]
    );
    assert_eq!(target.datacenter, "dc1");
    assert!(target.credentials.is_none());
}

#[tokio::test]
async fn mutating_statement_is_rejected_before_connecting() {
    let h = Harness::new(FakeConnector::returning(rows(1)), Settings::default());
    let err = h
        .service
        .submit(request("DROP TABLE ks.users"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "validation");
    assert_eq!(err.status_code(), 400);
    assert!(err.to_string().contains("DROP"));
    assert_eq!(h.connector.connects(), 0);
    assert!(h.registry.is_empty().await);

    let log = h.log.entries();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, LogStatus::Error);
    assert_eq!(log[0].rows_returned, 0);
    assert!(log[0].error_message.as_deref().unwrap().contains("DROP"));
}

#[tokio::test]
async fn unknown_cluster_is_not_found_and_not_logged() {
    let h = Harness::new(FakeConnector::returning(rows(1)), Settings::default());
    let err = h
        .service
        .submit(QueryRequest {
            cluster_id: "nope".into(),
            ..request("SELECT 1")
        })
        .await
        .unwrap_err();
    assert_eq!(err, QueryError::ClusterNotFound("nope".into()));
    assert_eq!(err.status_code(), 404);
    assert!(h.log.entries().is_empty());
    assert_eq!(h.connector.connects(), 0);
}

#[tokio::test]
async fn unreachable_cluster_is_a_connectivity_error() {
    let h = Harness::new(
        FakeConnector::failing_connect(ClientError::Unreachable("10.0.0.1:9042 refused".into())),
        Settings::default(),
    );
    let err = h.service.submit(request("SELECT 1")).await.unwrap_err();
    assert_eq!(err.kind(), "connectivity");
    assert_eq!(err.status_code(), 502);
    assert!(h.registry.is_empty().await);
    assert_eq!(h.log.entries()[0].status, LogStatus::Error);
}

#[tokio::test]
async fn cluster_side_failure_closes_the_connection() {
    let h = Harness::new(
        FakeConnector::failing_execute(ClientError::Execution("unconfigured table users".into())),
        Settings::default(),
    );
    let err = h
        .service
        .submit(request("SELECT * FROM ks.users"))
        .await
        .unwrap_err();
    assert_eq!(err, QueryError::Execution("unconfigured table users".into()));
    assert!(h.connector.last_connection().unwrap().is_closed());
    assert!(h.registry.is_empty().await);
    let log = h.log.entries();
    assert_eq!(log[0].status, LogStatus::Error);
    assert_eq!(
        log[0].error_message.as_deref(),
        Some("execution failed: unconfigured table users")
    );
}

#[tokio::test(start_paused = true)]
async fn slow_connect_times_out_after_connect_budget() {
    let h = Harness::new(
        FakeConnector::returning(rows(1)).with_connect_delay(Duration::from_secs(60)),
        Settings::default(),
    );
    let start = tokio::time::Instant::now();
    let err = h.service.submit(request("SELECT 1")).await.unwrap_err();
    let waited = start.elapsed();

    assert_eq!(err.kind(), "timeout");
    assert_eq!(err.status_code(), 504);
    assert!(waited >= Duration::from_secs(10), "{waited:?}");
    assert!(waited < Duration::from_secs(11), "{waited:?}");
    assert!(h.registry.is_empty().await);
    assert_eq!(h.log.entries()[0].status, LogStatus::Timeout);
}

#[tokio::test(start_paused = true)]
async fn slow_response_times_out_after_read_budget() {
    let settings = Settings {
        read_timeout: Duration::from_secs(2),
        ..Settings::default()
    };
    let h = Harness::new(
        FakeConnector::returning(rows(1)).with_execute_delay(Duration::from_secs(60)),
        settings,
    );
    let start = tokio::time::Instant::now();
    let err = h.service.submit(request("SELECT 1")).await.unwrap_err();

    assert!(matches!(err, QueryError::Timeout(_)), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(h.connector.last_connection().unwrap().is_closed());
    assert!(h.registry.is_empty().await);
    assert_eq!(h.log.entries()[0].status, LogStatus::Timeout);
}

#[tokio::test]
async fn rows_beyond_max_rows_are_truncated() {
    let settings = Settings {
        max_rows: 3,
        ..Settings::default()
    };
    let h = Harness::new(FakeConnector::returning(rows(10)), settings);
    let res = h.service.submit(request("SELECT * FROM t")).await.unwrap();
    assert_eq!(res.rows.len(), 3);
    assert_eq!(res.total_rows, 10);
    assert!(res.truncated);
    assert_eq!(h.log.entries()[0].rows_returned, 3);
}

#[tokio::test]
async fn own_duplicate_query_id_is_rejected_and_keeps_first_entry() {
    let h = Harness::new(FakeConnector::returning(rows(1)), Settings::default());
    let id = Uuid::new_v4();
    h.registry
        .register(id, "alice", "c1", "SELECT 1")
        .await
        .unwrap();

    let err = h
        .service
        .submit(QueryRequest {
            query_id: Some(id),
            ..request("SELECT 2")
        })
        .await
        .unwrap_err();
    assert_eq!(err, QueryError::DuplicateId(id));
    assert_eq!(err.status_code(), 409);
    assert_eq!(h.registry.get(id).await.unwrap().text, "SELECT 1");
    assert_eq!(h.connector.connects(), 0);
}

#[tokio::test]
async fn colliding_with_another_users_query_id_reads_as_not_found() {
    let h = Harness::new(FakeConnector::returning(rows(1)), Settings::default());
    let id = Uuid::new_v4();
    h.registry
        .register(id, "bob", "c1", "SELECT 1")
        .await
        .unwrap();

    let err = h
        .service
        .submit(QueryRequest {
            query_id: Some(id),
            ..request("SELECT 2")
        })
        .await
        .unwrap_err();
    assert_eq!(err, QueryError::QueryNotFound(id));
    assert_eq!(err.kind(), "not_found");
    assert_eq!(err.status_code(), 404);
    assert_eq!(h.registry.get(id).await.unwrap().owner_id, "bob");
    assert_eq!(h.connector.connects(), 0);

    let err = h
        .service
        .submit(QueryRequest {
            query_id: Some(id),
            caller: Caller::admin("root"),
            ..request("SELECT 2")
        })
        .await
        .unwrap_err();
    assert_eq!(err, QueryError::DuplicateId(id));
}

#[tokio::test]
async fn caller_supplied_id_is_used() {
    let h = Harness::new(FakeConnector::returning(rows(1)), Settings::default());
    let id = Uuid::new_v4();
    let res = h
        .service
        .submit(QueryRequest {
            query_id: Some(id),
            ..request("select 1")
        })
        .await
        .unwrap();
    assert_eq!(res.query_id, id);
    assert_eq!(h.log.entries()[0].query_id, id);
}

/// Connection that answers successfully, but only after every running query
/// has been cancelled.
struct CancelThenAnswer {
    registry: Arc<QueryRegistry>,
}

#[async_trait]
impl Connection for CancelThenAnswer {
    async fn execute(&self, _text: &str) -> Result<ResultSet, ClientError> {
        for entry in self.registry.list("", true).await {
            let _ = self.registry.cancel(entry.id, "ops", true).await;
        }
        Ok(rows(1))
    }

    async fn shutdown(&self) {}
}

struct CancelThenAnswerConnector {
    registry: Arc<QueryRegistry>,
}

#[async_trait]
impl Connector for CancelThenAnswerConnector {
    async fn connect(&self, _target: &ConnectTarget) -> Result<Arc<dyn Connection>, ClientError> {
        Ok(Arc::new(CancelThenAnswer {
            registry: self.registry.clone(),
        }))
    }
}

#[tokio::test]
async fn cancel_racing_a_successful_response_wins() {
    let registry = Arc::new(QueryRegistry::new());
    let log = Arc::new(MemoryLog::default());
    let service = QueryService::new(
        registry.clone(),
        Arc::new(StaticDirectory::new(vec![cluster("c1", &["10.0.0.1"])])),
        Arc::new(CancelThenAnswerConnector {
            registry: registry.clone(),
        }),
        log.clone(),
        Settings::default(),
    );
    let err = service.submit(request("SELECT 1")).await.unwrap_err();
    assert_eq!(err, QueryError::Cancelled);
    assert!(registry.is_empty().await);
    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, LogStatus::Cancelled);
}
