use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, field, info, warn};

use super::{ClusterState, HealthStatus, Prober, StatusCache, check_cluster};
use crate::{
    cluster::{Cluster, ClusterDirectory, DirectoryError},
    metrics::{CLUSTER_ONLINE_HOSTS, CLUSTER_UP},
};

/// Keeps the [`StatusCache`] fresh: one pass on start, one per interval,
/// and one on every explicit [`HealthMonitor::refresh`].
pub struct HealthMonitor {
    directory: Arc<dyn ClusterDirectory>,
    prober: Arc<dyn Prober>,
    cache: Arc<StatusCache>,
    interval: Duration,
    default_port: u16,
}

impl HealthMonitor {
    pub fn new(
        directory: Arc<dyn ClusterDirectory>,
        prober: Arc<dyn Prober>,
        cache: Arc<StatusCache>,
        interval: Duration,
        default_port: u16,
    ) -> Self {
        Self {
            directory,
            prober,
            cache,
            interval,
            default_port,
        }
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    /// Check every active cluster concurrently and publish the results.
    ///
    /// Errors are logged and swallowed: a directory failure skips the pass,
    /// a failed check skips only that cluster.
    #[tracing::instrument(skip(self), fields(clusters = field::Empty))]
    pub async fn refresh(&self) -> Vec<HealthStatus> {
        let clusters = match self.directory.active_clusters().await {
            Ok(clusters) => clusters,
            Err(err) => {
                warn!(%err, "cannot list clusters for health check");
                return Vec::new();
            }
        };
        tracing::Span::current().record("clusters", clusters.len());
        let active: HashSet<String> = clusters.iter().map(|c| c.id.clone()).collect();

        let checks: Vec<_> = clusters
            .into_iter()
            .map(|cluster| {
                let prober = self.prober.clone();
                let default_port = self.default_port;
                let id = cluster.id.clone();
                let handle = tokio::spawn(async move {
                    check_cluster(prober.as_ref(), &cluster, default_port).await
                });
                (id, handle)
            })
            .collect();

        let mut statuses = Vec::with_capacity(checks.len());
        for (id, handle) in checks {
            match handle.await {
                Ok(status) => {
                    self.publish(&status).await;
                    statuses.push(status);
                }
                Err(err) => warn!(cluster = %id, %err, "health check task failed"),
            }
        }
        self.forget_removed(&active).await;
        statuses
    }

    /// Clear cache entries and metric series of clusters no longer listed.
    async fn forget_removed(&self, active: &HashSet<String>) {
        for id in self.cache.retain_clusters(active).await {
            let _ = CLUSTER_ONLINE_HOSTS.remove_label_values(&[id.as_str()]);
            let _ = CLUSTER_UP.remove_label_values(&[id.as_str()]);
            info!(cluster = %id, "cluster removed from directory, health dropped");
        }
    }

    async fn publish(&self, status: &HealthStatus) {
        let id = status.cluster_id.as_str();
        CLUSTER_ONLINE_HOSTS
            .with_label_values(&[id])
            .set(status.online_hosts as f64);
        CLUSTER_UP
            .with_label_values(&[id])
            .set(if status.state == ClusterState::Online { 1.0 } else { 0.0 });
        debug!(
            cluster = id,
            state = %status.state,
            online = status.online_hosts,
            total = status.total_hosts,
            "health updated"
        );
        self.cache.store(status.clone()).await;
    }

    /// Active clusters paired with their cached health. Never probes.
    pub async fn cached(&self) -> Result<Vec<(Cluster, HealthStatus)>, DirectoryError> {
        let clusters = self.directory.active_clusters().await?;
        let mut out = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let status = self.cache.get_or_unknown(&cluster.id).await;
            out.push((cluster, status));
        }
        Ok(out)
    }

    /// Run the periodic loop for the lifetime of the process.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            "starting cluster health monitor"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // first tick completes immediately
                ticker.tick().await;
                let statuses = self.refresh().await;
                let online = statuses
                    .iter()
                    .filter(|s| s.state == ClusterState::Online)
                    .count();
                info!(checked = statuses.len(), online, "health pass complete");
            }
        })
    }
}
