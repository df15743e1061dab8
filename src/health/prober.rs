//! TCP reachability probes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Answers whether a host accepts connections on a port.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Never fails: refusals, resolution errors and timeouts all map to
    /// `false`.
    async fn probe(&self, host: &str, port: u16) -> bool;
}

/// Probe `host:port` with a plain TCP connect bounded by `timeout`.
///
/// The stream is dropped before returning, so the socket is released on
/// every path.
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(err)) => {
            debug!(%host, port, %err, "probe refused");
            false
        }
        Err(_) => {
            debug!(%host, port, ?timeout, "probe timed out");
            false
        }
    }
}

/// [`Prober`] backed by [`probe_tcp`].
#[derive(Clone, Debug)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, host: &str, port: u16) -> bool {
        probe_tcp(host, port, self.timeout).await
    }
}
