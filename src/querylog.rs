//! Append-only record of finished queries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Error => "error",
            LogStatus::Timeout => "timeout",
            LogStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryLogEntry {
    pub query_id: Uuid,
    pub user_id: String,
    pub cluster_id: String,
    pub query_text: String,
    pub execution_time_ms: u64,
    pub rows_returned: usize,
    pub status: LogStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Destination for finished-query records. Failures are handled inside the
/// sink; callers never see them.
#[async_trait]
pub trait QueryLogSink: Send + Sync {
    async fn record(&self, entry: QueryLogEntry);
}

/// Sink that emits one structured log line per query.
#[derive(Clone, Default)]
pub struct TracingQueryLog;

#[async_trait]
impl QueryLogSink for TracingQueryLog {
    async fn record(&self, entry: QueryLogEntry) {
        info!(
            target: "query_log",
            {
                query.id = %entry.query_id,
                user = %entry.user_id,
                cluster = %entry.cluster_id,
                status = entry.status.as_str(),
                duration_ms = entry.execution_time_ms,
                rows = entry.rows_returned,
                error = entry.error_message.as_deref().unwrap_or(""),
            },
            "{}",
            entry.query_text
        );
    }
}

/// Sink appending one JSON object per line to a file. The append handle is
/// opened on first use and kept for the lifetime of the sink.
pub struct JsonlQueryLog {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonlQueryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &[u8]) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            if let Err(err) = file.write_all(line).await {
                // reopen on the next record
                *guard = None;
                return Err(err);
            }
            file.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueryLogSink for JsonlQueryLog {
    async fn record(&self, entry: QueryLogEntry) {
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, query.id = %entry.query_id, "cannot encode query log entry");
                return;
            }
        };
        line.push(b'\n');
        if let Err(err) = self.append(&line).await {
            warn!(%err, path = %self.path.display(), "failed to append query log entry");
        }
    }
}
