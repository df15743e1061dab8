#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use cass_pilot::{
    Settings,
    client::{CellValue, ClientError, ConnectTarget, Connection, Connector, ResultSet},
    cluster::{Cluster, ContactPoint, StaticDirectory},
    executor::QueryService,
    health::Prober,
    querylog::{QueryLogEntry, QueryLogSink},
    registry::{QueryRegistry, RunningQuery},
};
use tokio::sync::watch;
use uuid::Uuid;

/// Cluster with the given id whose contact points are `hosts`.
pub fn cluster(id: &str, hosts: &[&str]) -> Cluster {
    Cluster {
        id: id.to_string(),
        name: format!("{id}-name"),
        contact_points: hosts
            .iter()
            .map(|h| h.parse::<ContactPoint>().expect("contact point"))
            .collect(),
        datacenter: "dc1".to_string(),
        credentials: None,
    }
}

/// Two columns, `rows` rows of text.
pub fn rows(n: usize) -> ResultSet {
    ResultSet {
        columns: vec!["id".into(), "name".into()],
        rows: (0..n)
            .map(|i| vec![CellValue::Int(i as i64), CellValue::Text(format!("row{i}"))])
            .collect(),
    }
}

/// Connection with a scripted response delay and outcome. `shutdown`
/// unblocks an in-flight `execute` with `ClientError::Closed`.
pub struct FakeConnection {
    delay: Duration,
    result: Result<ResultSet, ClientError>,
    closed: watch::Sender<bool>,
    executes: AtomicUsize,
}

impl FakeConnection {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn execute(&self, _text: &str) -> Result<ResultSet, ClientError> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(ClientError::Closed);
        }
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => self.result.clone(),
            _ = closed.wait_for(|c| *c) => Err(ClientError::Closed),
        }
    }

    async fn shutdown(&self) {
        self.closed.send_replace(true);
    }
}

/// Connector handing out [`FakeConnection`]s and remembering what it was
/// asked for.
pub struct FakeConnector {
    connect_delay: Duration,
    connect_error: Option<ClientError>,
    execute_delay: Duration,
    result: Result<ResultSet, ClientError>,
    connects: AtomicUsize,
    last_connection: Mutex<Option<Arc<FakeConnection>>>,
    last_target: Mutex<Option<ConnectTarget>>,
}

impl FakeConnector {
    pub fn returning(result: ResultSet) -> Self {
        Self {
            connect_delay: Duration::ZERO,
            connect_error: None,
            execute_delay: Duration::ZERO,
            result: Ok(result),
            connects: AtomicUsize::new(0),
            last_connection: Mutex::new(None),
            last_target: Mutex::new(None),
        }
    }

    pub fn failing_execute(err: ClientError) -> Self {
        Self {
            result: Err(err),
            ..Self::returning(ResultSet::default())
        }
    }

    pub fn failing_connect(err: ClientError) -> Self {
        Self {
            connect_error: Some(err),
            ..Self::returning(ResultSet::default())
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = delay;
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.last_connection.lock().unwrap().clone()
    }

    pub fn last_target(&self) -> Option<ConnectTarget> {
        self.last_target.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_target.lock().unwrap() = Some(target.clone());
        tokio::time::sleep(self.connect_delay).await;
        if let Some(err) = &self.connect_error {
            return Err(err.clone());
        }
        let (closed, _) = watch::channel(false);
        let conn = Arc::new(FakeConnection {
            delay: self.execute_delay,
            result: self.result.clone(),
            closed,
            executes: AtomicUsize::new(0),
        });
        *self.last_connection.lock().unwrap() = Some(conn.clone());
        Ok(conn)
    }
}

/// Query log sink keeping every entry in memory.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<QueryLogEntry>>,
}

impl MemoryLog {
    pub fn entries(&self) -> Vec<QueryLogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryLogSink for MemoryLog {
    async fn record(&self, entry: QueryLogEntry) {
        self.entries.lock().unwrap().push(entry);
    }
}

/// Prober answering from a fixed table after a fixed delay. Unknown hosts
/// are offline. Counts every probe.
pub struct ScriptedProber {
    delay: Duration,
    online: Mutex<HashMap<String, bool>>,
    probes: AtomicUsize,
}

impl ScriptedProber {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            online: Mutex::new(HashMap::new()),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, host: &str, online: bool) {
        self.online.lock().unwrap().insert(host.to_string(), online);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, host: &str, _port: u16) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.online
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or(false)
    }
}

/// Query service wired to fakes, with handles kept for assertions.
pub struct Harness {
    pub service: Arc<QueryService>,
    pub registry: Arc<QueryRegistry>,
    pub connector: Arc<FakeConnector>,
    pub log: Arc<MemoryLog>,
}

impl Harness {
    pub fn new(connector: FakeConnector, settings: Settings) -> Self {
        let registry = Arc::new(QueryRegistry::new());
        let connector = Arc::new(connector);
        let log = Arc::new(MemoryLog::default());
        let directory = Arc::new(StaticDirectory::new(vec![cluster(
            "c1",
            &["10.0.0.1:7000", "10.0.0.2"],
        )]));
        let service = Arc::new(QueryService::new(
            registry.clone(),
            directory,
            connector.clone(),
            log.clone(),
            settings,
        ));
        Self {
            service,
            registry,
            connector,
            log,
        }
    }
}

/// Wait until `id` is registered and, if `connected`, has its connection
/// attached.
pub async fn wait_for_entry(registry: &QueryRegistry, id: Uuid, connected: bool) -> RunningQuery {
    for _ in 0..2_000 {
        if let Some(entry) = registry.get(id).await {
            if !connected || entry.has_connection() {
                return entry;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("query {id} never reached the expected state");
}
