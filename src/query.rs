//! Read-only statement validation, query errors and result shaping.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::{
    client::{ClientError, ResultSet},
    querylog::LogStatus,
    registry::RegistryError,
};

/// The only leading keyword accepted for execution.
pub const READ_ONLY_KEYWORD: &str = "select";

/// Leading keywords that mutate data or schema.
pub const FORBIDDEN_KEYWORDS: [&str; 9] = [
    "insert", "update", "delete", "drop", "create", "alter", "truncate", "grant", "revoke",
];

/// Lifecycle of a single submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryState {
    Submitted,
    Validating,
    Connecting,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryState::Submitted => "submitted",
            QueryState::Validating => "validating",
            QueryState::Connecting => "connecting",
            QueryState::Executing => "executing",
            QueryState::Completed => "completed",
            QueryState::Cancelled => "cancelled",
            QueryState::Failed => "failed",
        })
    }
}

/// Errors produced while submitting, running or cancelling a query.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The statement is not a read-only query.
    #[error("{message}")]
    Validation {
        keyword: Option<String>,
        message: String,
    },
    #[error("cluster {0} not found")]
    ClusterNotFound(String),
    #[error("query {0} not found")]
    QueryNotFound(Uuid),
    #[error("user {caller} may not cancel query {id}")]
    Unauthorized { id: Uuid, caller: String },
    #[error("query id {0} is already registered")]
    DuplicateId(Uuid),
    #[error("cannot reach cluster: {0}")]
    Connectivity(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("query cancelled")]
    Cancelled,
    #[error("execution failed: {0}")]
    Execution(String),
}

impl QueryError {
    /// Stable machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Validation { .. } => "validation",
            QueryError::ClusterNotFound(_) | QueryError::QueryNotFound(_) => "not_found",
            QueryError::Unauthorized { .. } => "authorization",
            QueryError::DuplicateId(_) => "duplicate_id",
            QueryError::Connectivity(_) => "connectivity",
            QueryError::Timeout(_) => "timeout",
            QueryError::Cancelled => "cancelled",
            QueryError::Execution(_) => "execution",
        }
    }

    /// HTTP status reported for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            QueryError::Validation { .. } => 400,
            QueryError::Unauthorized { .. } => 403,
            QueryError::ClusterNotFound(_) | QueryError::QueryNotFound(_) => 404,
            QueryError::DuplicateId(_) | QueryError::Cancelled => 409,
            QueryError::Execution(_) => 500,
            QueryError::Connectivity(_) => 502,
            QueryError::Timeout(_) => 504,
        }
    }

    pub(crate) fn log_status(&self) -> LogStatus {
        match self {
            QueryError::Timeout(_) => LogStatus::Timeout,
            QueryError::Cancelled => LogStatus::Cancelled,
            _ => LogStatus::Error,
        }
    }
}

impl From<ClientError> for QueryError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Unreachable(msg) => QueryError::Connectivity(msg),
            ClientError::Timeout(msg) => QueryError::Timeout(msg),
            ClientError::Closed => QueryError::Execution("connection closed".into()),
            ClientError::Execution(msg) => QueryError::Execution(msg),
        }
    }
}

impl From<RegistryError> for QueryError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateId(id) => QueryError::DuplicateId(id),
            RegistryError::NotFound(id) => QueryError::QueryNotFound(id),
            RegistryError::Unauthorized { id, caller } => QueryError::Unauthorized { id, caller },
        }
    }
}

/// Leading keyword of a statement, lowercased: the run of ASCII letters
/// after leading whitespace.
pub fn leading_keyword(text: &str) -> String {
    text.trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Accept only statements that start with `SELECT`.
pub fn validate_read_only(text: &str) -> Result<(), QueryError> {
    if text.trim().is_empty() {
        return Err(QueryError::Validation {
            keyword: None,
            message: "query text is empty".into(),
        });
    }
    let keyword = leading_keyword(text);
    if FORBIDDEN_KEYWORDS.contains(&keyword.as_str()) {
        let upper = keyword.to_ascii_uppercase();
        return Err(QueryError::Validation {
            message: format!(
                "{upper} statements are not permitted; only SELECT statements are accepted"
            ),
            keyword: Some(upper),
        });
    }
    if keyword != READ_ONLY_KEYWORD {
        return Err(QueryError::Validation {
            keyword: (!keyword.is_empty()).then(|| keyword.to_ascii_uppercase()),
            message: "only SELECT statements are permitted".into(),
        });
    }
    Ok(())
}

/// Successful query outcome, with every cell rendered for display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub query_id: Uuid,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Rows returned by the cluster, before truncation.
    pub total_rows: usize,
    pub truncated: bool,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn from_result_set(
        query_id: Uuid,
        rs: ResultSet,
        max_rows: usize,
        execution_time_ms: u64,
    ) -> Self {
        let total_rows = rs.rows.len();
        let rows = rs
            .rows
            .into_iter()
            .take(max_rows)
            .map(|row| row.iter().map(|cell| cell.to_display()).collect())
            .collect();
        Self {
            query_id,
            columns: rs.columns,
            rows,
            total_rows,
            truncated: total_rows > max_rows,
            execution_time_ms,
        }
    }
}
