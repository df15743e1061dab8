//! Cluster reachability: probes, per-cluster aggregation, the status cache
//! and the periodic monitor that keeps it fresh.

pub mod cache;
pub mod monitor;
pub mod prober;

use std::fmt;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;

use crate::cluster::Cluster;

pub use cache::StatusCache;
pub use monitor::HealthMonitor;
pub use prober::{Prober, TcpProber, probe_tcp};

/// Aggregate reachability of a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Online,
    Offline,
    /// Never checked yet.
    Unknown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClusterState::Online => "online",
            ClusterState::Offline => "offline",
            ClusterState::Unknown => "unknown",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    /// Contact point as declared, e.g. `10.0.0.1:9042`.
    pub host: String,
    pub online: bool,
}

/// Result of one health check of one cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub cluster_id: String,
    pub state: ClusterState,
    pub online_hosts: usize,
    pub total_hosts: usize,
    pub hosts: Vec<HostStatus>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl HealthStatus {
    pub fn unknown(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            state: ClusterState::Unknown,
            online_hosts: 0,
            total_hosts: 0,
            hosts: Vec::new(),
            last_checked: None,
        }
    }

    /// Fold per-host results into an aggregate: online iff any host is.
    pub fn from_hosts(cluster_id: impl Into<String>, hosts: Vec<HostStatus>) -> Self {
        let online_hosts = hosts.iter().filter(|h| h.online).count();
        let state = if online_hosts > 0 {
            ClusterState::Online
        } else {
            ClusterState::Offline
        };
        Self {
            cluster_id: cluster_id.into(),
            state,
            online_hosts,
            total_hosts: hosts.len(),
            hosts,
            last_checked: Some(Utc::now()),
        }
    }
}

/// Probe every contact point of `cluster` concurrently and aggregate.
///
/// Latency is bounded by the prober's own timeout, not by the host count.
pub async fn check_cluster(prober: &dyn Prober, cluster: &Cluster, default_port: u16) -> HealthStatus {
    let probes = cluster.contact_points.iter().map(|cp| async move {
        let online = prober.probe(&cp.host, cp.probe_port(default_port)).await;
        HostStatus {
            host: cp.to_string(),
            online,
        }
    });
    let hosts = join_all(probes).await;
    HealthStatus::from_hosts(cluster.id.clone(), hosts)
}
