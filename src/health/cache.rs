use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use super::HealthStatus;

/// Last known health per cluster id.
///
/// Whole [`HealthStatus`] values are swapped under the lock, so a reader
/// never observes a half-written entry.
#[derive(Default)]
pub struct StatusCache {
    entries: RwLock<HashMap<String, HealthStatus>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn store(&self, status: HealthStatus) {
        let mut map = self.entries.write().await;
        map.insert(status.cluster_id.clone(), status);
    }

    /// Drop entries for clusters not in `active`, returning their ids.
    pub(crate) async fn retain_clusters(&self, active: &HashSet<String>) -> Vec<String> {
        let mut map = self.entries.write().await;
        let mut gone: Vec<String> = map.keys().filter(|id| !active.contains(*id)).cloned().collect();
        for id in &gone {
            map.remove(id);
        }
        gone.sort();
        gone
    }

    pub async fn get(&self, cluster_id: &str) -> Option<HealthStatus> {
        self.entries.read().await.get(cluster_id).cloned()
    }

    /// Cached status, or an `unknown` placeholder for clusters never checked.
    pub async fn get_or_unknown(&self, cluster_id: &str) -> HealthStatus {
        self.get(cluster_id)
            .await
            .unwrap_or_else(|| HealthStatus::unknown(cluster_id))
    }

    pub async fn snapshot(&self) -> Vec<HealthStatus> {
        let mut out: Vec<HealthStatus> = self.entries.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        out
    }
}
