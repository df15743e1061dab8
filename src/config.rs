use std::time::Duration;

/// Datacenter label used when a cluster descriptor does not name one.
pub const DEFAULT_DATACENTER: &str = "datacenter1";

/// Runtime budgets and knobs shared by the executor and the health monitor.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Upper bound for a single reachability probe.
    pub probe_timeout: Duration,
    /// Period between two scheduled health passes.
    pub health_interval: Duration,
    /// Budget for opening a data connection to a cluster.
    pub connect_timeout: Duration,
    /// Budget for a single query round trip once connected.
    pub read_timeout: Duration,
    /// Port used for data connections, and for probes of contact points
    /// that do not declare one. Defaults to Cassandra's native port.
    pub default_port: u16,
    /// Use the port declared on each contact point for data connections
    /// instead of `default_port`.
    pub honor_declared_ports: bool,
    /// Maximum number of rows returned to the caller.
    pub max_rows: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            health_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            default_port: 9042,
            honor_declared_ports: false,
            max_rows: 1000,
        }
    }
}

/// Errors raised for settings that cannot drive the service.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Settings {
    /// Reject settings that would make every probe or query fail instantly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("probe timeout", self.probe_timeout),
            ("health interval", self.health_interval),
            ("connect timeout", self.connect_timeout),
            ("read timeout", self.read_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.default_port == 0 {
            return Err(ConfigError::Zero("default port"));
        }
        if self.max_rows == 0 {
            return Err(ConfigError::Zero("max rows"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fixed_budgets() {
        let s = Settings::default();
        assert_eq!(s.probe_timeout, Duration::from_secs(3));
        assert_eq!(s.health_interval, Duration::from_secs(60));
        assert_eq!(s.connect_timeout, Duration::from_secs(10));
        assert_eq!(s.read_timeout, Duration::from_secs(30));
        assert!(!s.honor_declared_ports);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_budgets() {
        let s = Settings {
            read_timeout: Duration::ZERO,
            ..Settings::default()
        };
        assert_eq!(s.validate(), Err(ConfigError::Zero("read timeout")));
        let s = Settings {
            max_rows: 0,
            ..Settings::default()
        };
        assert_eq!(s.validate(), Err(ConfigError::Zero("max rows")));
    }
}
