//! Cluster descriptors and the directory they are read from.

use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::DEFAULT_DATACENTER;

/// One host of a cluster, with the port it declares (if any).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContactPoint {
    pub host: String,
    pub port: Option<u16>,
}

impl ContactPoint {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address probed by the health monitor: the declared port wins.
    pub fn probe_port(&self, default_port: u16) -> u16 {
        self.port.unwrap_or(default_port)
    }

    /// Port used for the data connection. Declared ports are ignored
    /// unless `honor_declared` is set.
    pub fn data_port(&self, default_port: u16, honor_declared: bool) -> u16 {
        if honor_declared {
            self.port.unwrap_or(default_port)
        } else {
            default_port
        }
    }
}

impl fmt::Display for ContactPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bracketed = self.host.contains(':');
        match (bracketed, self.port) {
            (true, Some(port)) => write!(f, "[{}]:{}", self.host, port),
            (false, Some(port)) => write!(f, "{}:{}", self.host, port),
            (_, None) => write!(f, "{}", self.host),
        }
    }
}

impl FromStr for ContactPoint {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || DirectoryError::Invalid(format!("invalid contact point '{raw}'"));
        if raw.is_empty() {
            return Err(invalid());
        }
        let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid());
        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            if host.is_empty() {
                return Err(invalid());
            }
            let port = match tail {
                "" => None,
                t => Some(parse_port(t.strip_prefix(':').ok_or_else(invalid)?)?),
            };
            return Ok(Self::new(host, port));
        }
        match raw.matches(':').count() {
            0 => Ok(Self::new(raw, None)),
            1 => {
                let (host, port) = raw.split_once(':').ok_or_else(invalid)?;
                if host.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::new(host, Some(parse_port(port)?)))
            }
            // bare IPv6 literal
            _ => Ok(Self::new(raw, None)),
        }
    }
}

/// Username/password pair presented to the cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Static description of a cluster the operators may query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub contact_points: Vec<ContactPoint>,
    pub datacenter: String,
    pub credentials: Option<Credentials>,
}

/// Errors returned by a [`ClusterDirectory`].
#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Read-only source of cluster descriptors.
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    /// All clusters currently marked active.
    async fn active_clusters(&self) -> Result<Vec<Cluster>, DirectoryError>;

    /// Look up a single active cluster.
    async fn cluster(&self, id: &str) -> Result<Option<Cluster>, DirectoryError> {
        Ok(self
            .active_clusters()
            .await?
            .into_iter()
            .find(|c| c.id == id))
    }
}

#[derive(Deserialize)]
struct ClusterFile {
    #[serde(default)]
    clusters: Vec<ClusterRecord>,
}

#[derive(Deserialize)]
struct ClusterRecord {
    id: String,
    name: String,
    #[serde(default)]
    hosts: Vec<String>,
    host: Option<String>,
    port: Option<u16>,
    datacenter: Option<String>,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

impl ClusterRecord {
    fn into_cluster(self) -> Result<Cluster, DirectoryError> {
        let mut hosts = self.hosts;
        if hosts.is_empty() {
            if let Some(host) = self.host.filter(|h| !h.trim().is_empty()) {
                hosts.push(match self.port {
                    Some(port) => format!("{}:{}", host.trim(), port),
                    None => host,
                });
            }
        }
        if hosts.is_empty() {
            return Err(DirectoryError::Invalid(format!(
                "cluster '{}' has no contact points",
                self.name
            )));
        }
        let contact_points = hosts
            .iter()
            .map(|h| h.parse())
            .collect::<Result<Vec<ContactPoint>, _>>()?;
        let datacenter = self
            .datacenter
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_DATACENTER.to_string());
        let credentials = match (self.username, self.password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Credentials { username, password })
            }
            _ => None,
        };
        Ok(Cluster {
            id: self.id,
            name: self.name,
            contact_points,
            datacenter,
            credentials,
        })
    }
}

/// Parse a cluster file body, returning only the active clusters.
pub fn parse_clusters(body: &str) -> Result<Vec<Cluster>, DirectoryError> {
    let file: ClusterFile = serde_json::from_str(body)?;
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    let mut out = Vec::new();
    for record in file.clusters {
        if !ids.insert(record.id.clone()) {
            return Err(DirectoryError::Invalid(format!(
                "duplicate cluster id '{}'",
                record.id
            )));
        }
        if !names.insert(record.name.clone()) {
            return Err(DirectoryError::Invalid(format!(
                "duplicate cluster name '{}'",
                record.name
            )));
        }
        let active = record.active;
        let cluster = record.into_cluster()?;
        if active {
            out.push(cluster);
        }
    }
    Ok(out)
}

/// Directory backed by a fixed list of clusters.
pub struct StaticDirectory {
    clusters: Vec<Cluster>,
}

impl StaticDirectory {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        Self { clusters }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let body = std::fs::read_to_string(path)?;
        Ok(Self::new(parse_clusters(&body)?))
    }
}

#[async_trait]
impl ClusterDirectory for StaticDirectory {
    async fn active_clusters(&self) -> Result<Vec<Cluster>, DirectoryError> {
        Ok(self.clusters.clone())
    }
}

/// Directory that re-reads its JSON file on every call, so edits are seen
/// by the next health pass without a restart.
pub struct FileDirectory {
    path: PathBuf,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ClusterDirectory for FileDirectory {
    async fn active_clusters(&self) -> Result<Vec<Cluster>, DirectoryError> {
        let body = tokio::fs::read_to_string(&self.path).await?;
        parse_clusters(&body)
    }
}
