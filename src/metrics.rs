use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounterVec, TextEncoder, register_gauge, register_gauge_vec,
    register_int_counter_vec,
};

pub static CLUSTER_ONLINE_HOSTS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "cluster_online_hosts",
        "Number of reachable contact points per cluster",
        &["cluster"]
    )
    .unwrap()
});

pub static CLUSTER_UP: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "cluster_up",
        "Whether at least one contact point of the cluster is reachable",
        &["cluster"]
    )
    .unwrap()
});

pub static RUNNING_QUERIES: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("running_queries", "Queries currently in flight").unwrap());

pub static QUERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("queries_total", "Finished queries by outcome", &["status"])
        .unwrap()
});

/// Render every registered metric in the Prometheus text format.
pub fn encode_to_string() -> String {
    let mut buf = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(%err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
