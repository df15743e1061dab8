//! Read-only query gateway and health monitor for a fleet of Cass clusters.
//!
//! Operators submit `SELECT` statements against a named cluster through
//! [`executor::QueryService`], which validates, connects, runs and tears
//! each query down and keeps it cancellable while it runs. The
//! [`health::HealthMonitor`] probes every contact point of every active
//! cluster on a fixed interval and keeps the [`health::StatusCache`]
//! fresh for cheap listings.

pub mod client;
pub mod cluster;
pub mod config;
pub mod executor;
pub mod health;
pub mod http;
pub mod metrics;
pub mod query;
pub mod querylog;
pub mod registry;
pub mod telemetry;
pub mod util;

pub use config::Settings;
pub use executor::{Caller, QueryRequest, QueryService};
pub use query::{QueryError, QueryResult};
