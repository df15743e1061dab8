//! In-flight query bookkeeping shared by the executor and cancellation.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{client::Connection, metrics::RUNNING_QUERIES};

/// A query between submission and teardown.
///
/// Clones share the cancelled flag, so the executor keeps observing it
/// after the entry has been removed by a concurrent cancel.
#[derive(Clone)]
pub struct RunningQuery {
    pub id: Uuid,
    pub owner_id: String,
    pub cluster_id: String,
    pub text: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    cancelled: Arc<AtomicBool>,
    connection: Option<Arc<dyn Connection>>,
}

impl RunningQuery {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// True when both values were produced by the same `register` call.
    /// Ids can be reused once an entry is gone, so the id alone is not enough.
    pub fn same_entry(&self, other: &RunningQuery) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }

    pub fn info(&self) -> RunningQueryInfo {
        RunningQueryInfo {
            query_id: self.id,
            query_text: self.text.clone(),
            cluster_id: self.cluster_id.clone(),
            user_id: self.owner_id.clone(),
            start_time: self.started_at,
            duration_ms: self.elapsed().as_millis() as u64,
        }
    }
}

impl fmt::Debug for RunningQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningQuery")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("cluster_id", &self.cluster_id)
            .field("text", &self.text)
            .field("started_at", &self.started_at)
            .field("cancelled", &self.is_cancelled())
            .field("connected", &self.has_connection())
            .finish()
    }
}

/// Listing view of a running query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningQueryInfo {
    pub query_id: Uuid,
    pub query_text: String,
    pub cluster_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("query id {0} is already registered")]
    DuplicateId(Uuid),
    #[error("query {0} not found")]
    NotFound(Uuid),
    #[error("user {caller} may not cancel query {id}")]
    Unauthorized { id: Uuid, caller: String },
}

/// Concurrency-safe table of running queries keyed by query id.
#[derive(Default)]
pub struct QueryRegistry {
    entries: RwLock<HashMap<Uuid, RunningQuery>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        id: Uuid,
        owner_id: &str,
        cluster_id: &str,
        text: &str,
    ) -> Result<RunningQuery, RegistryError> {
        let mut map = self.entries.write().await;
        if map.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        let entry = RunningQuery {
            id,
            owner_id: owner_id.to_string(),
            cluster_id: cluster_id.to_string(),
            text: text.to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
            connection: None,
        };
        map.insert(id, entry.clone());
        RUNNING_QUERIES.set(map.len() as f64);
        Ok(entry)
    }

    /// Attach the live connection so a cancel can force-close it. Fails if
    /// `entry` is gone, even when a newer query now holds the same id.
    pub async fn attach_connection(
        &self,
        entry: &RunningQuery,
        connection: Arc<dyn Connection>,
    ) -> Result<(), RegistryError> {
        let mut map = self.entries.write().await;
        match map.get_mut(&entry.id) {
            Some(stored) if stored.same_entry(entry) => {
                stored.connection = Some(connection);
                Ok(())
            }
            _ => Err(RegistryError::NotFound(entry.id)),
        }
    }

    pub async fn mark_cancelled(&self, id: Uuid) -> Result<(), RegistryError> {
        let map = self.entries.read().await;
        let entry = map.get(&id).ok_or(RegistryError::NotFound(id))?;
        entry.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Remove `entry` if it is still the one registered under its id.
    /// Returns false when it was already removed, so teardown after a cancel
    /// never touches a later query that reused the id.
    pub async fn remove_entry(&self, entry: &RunningQuery) -> bool {
        let mut map = self.entries.write().await;
        let current = map.get(&entry.id).is_some_and(|stored| stored.same_entry(entry));
        let removed = current && map.remove(&entry.id).is_some();
        RUNNING_QUERIES.set(map.len() as f64);
        removed
    }

    /// Look up, authorize, flag and remove an entry in one step. Returns the
    /// attached connection, if any, for the caller to close outside the lock.
    pub async fn cancel(
        &self,
        id: Uuid,
        caller_id: &str,
        caller_is_admin: bool,
    ) -> Result<Option<Arc<dyn Connection>>, RegistryError> {
        let mut map = self.entries.write().await;
        let entry = map.get(&id).ok_or(RegistryError::NotFound(id))?;
        if !caller_is_admin && entry.owner_id != caller_id {
            return Err(RegistryError::Unauthorized {
                id,
                caller: caller_id.to_string(),
            });
        }
        entry.cancelled.store(true, Ordering::SeqCst);
        let connection = map.remove(&id).and_then(|e| e.connection);
        RUNNING_QUERIES.set(map.len() as f64);
        Ok(connection)
    }

    pub async fn get(&self, id: Uuid) -> Option<RunningQuery> {
        self.entries.read().await.get(&id).cloned()
    }

    /// Every entry for admins, otherwise only the caller's own, oldest first.
    pub async fn list(&self, caller_id: &str, caller_is_admin: bool) -> Vec<RunningQuery> {
        let map = self.entries.read().await;
        let mut out: Vec<RunningQuery> = map
            .values()
            .filter(|e| caller_is_admin || e.owner_id == caller_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.started);
        out
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
