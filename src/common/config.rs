//! Configuration for the Agency client

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::agency::endpoint::normalize_endpoint;
use crate::common::utils::normalize_prefix;

/// Environment variable prefix (`AGENCY_ENDPOINTS`, `AGENCY_PREFIX`, ...)
pub const ENV_PREFIX: &str = "AGENCY";

/// Agency client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgencyConfig {
    /// Agency replica endpoints (`tcp://host:port` or `ssl://host:port`)
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Global key prefix, fixed for the lifetime of a client
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Independently leasable connections per endpoint
    #[serde(default = "default_num_connections")]
    pub num_connections: usize,

    /// Learn endpoints from redirects
    #[serde(default = "default_add_new_endpoints")]
    pub add_new_endpoints: bool,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Default lock TTL and acquisition timeout
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Backoff step for lock retries
    #[serde(default = "default_initial_sleep_time")]
    pub initial_sleep_time_ms: u64,

    /// Backoff cap for lock retries
    #[serde(default = "default_max_sleep_time")]
    pub max_sleep_time_ms: u64,

    /// Pause between bootstrap attempts of processes that lost the init race
    #[serde(default = "default_init_retry_interval")]
    pub init_retry_interval_ms: u64,

    /// Pause between rounds of the startup connect loop
    #[serde(default = "default_connect_retry_interval")]
    pub connect_retry_interval_ms: u64,
}

fn default_prefix() -> String {
    "/arango/".to_string()
}
fn default_num_connections() -> usize {
    3
}
fn default_add_new_endpoints() -> bool {
    true
}
fn default_connect_timeout() -> u64 {
    15_000
}
fn default_request_timeout() -> u64 {
    3_000
}
fn default_lock_timeout() -> u64 {
    30_000
}
fn default_initial_sleep_time() -> u64 {
    5
}
fn default_max_sleep_time() -> u64 {
    50
}
fn default_init_retry_interval() -> u64 {
    1_000
}
fn default_connect_retry_interval() -> u64 {
    1_000
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            prefix: default_prefix(),
            num_connections: default_num_connections(),
            add_new_endpoints: default_add_new_endpoints(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            lock_timeout_ms: default_lock_timeout(),
            initial_sleep_time_ms: default_initial_sleep_time(),
            max_sleep_time_ms: default_max_sleep_time(),
            init_retry_interval_ms: default_init_retry_interval(),
            connect_retry_interval_ms: default_connect_retry_interval(),
        }
    }
}

impl AgencyConfig {
    /// Config with the given endpoints and defaults for everything else
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Load from an optional TOML file, then `AGENCY_*` environment variables.
    ///
    /// Environment values win over the file. `AGENCY_ENDPOINTS` is a
    /// comma-separated list.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("endpoints"),
        );

        let mut cfg: AgencyConfig = builder.build()?.try_deserialize()?;
        cfg.normalize()?;
        tracing::debug!("Loaded agency config: {:?}", cfg);
        Ok(cfg)
    }

    /// Canonicalize the prefix and endpoint specs, then validate
    pub fn normalize(&mut self) -> crate::Result<()> {
        self.prefix = normalize_prefix(&self.prefix);
        self.endpoints = self
            .endpoints
            .iter()
            .map(|e| normalize_endpoint(e))
            .collect::<crate::Result<Vec<_>>>()?;
        self.validate()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.num_connections == 0 {
            return Err(crate::Error::InvalidConfig(
                "num_connections must be at least 1".into(),
            ));
        }
        if self.max_sleep_time_ms < self.initial_sleep_time_ms {
            return Err(crate::Error::InvalidConfig(
                "max_sleep_time_ms must not be below initial_sleep_time_ms".into(),
            ));
        }
        if !self.prefix.starts_with('/') || !self.prefix.ends_with('/') {
            return Err(crate::Error::InvalidConfig(format!(
                "prefix must begin and end with '/': {}",
                self.prefix
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn initial_sleep_time(&self) -> Duration {
        Duration::from_millis(self.initial_sleep_time_ms)
    }

    pub fn max_sleep_time(&self) -> Duration {
        Duration::from_millis(self.max_sleep_time_ms)
    }

    pub fn init_retry_interval(&self) -> Duration {
        Duration::from_millis(self.init_retry_interval_ms)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AgencyConfig::default();
        assert_eq!(cfg.prefix, "/arango/");
        assert_eq!(cfg.num_connections, 3);
        assert!(cfg.add_new_endpoints);
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_normalize() {
        let mut cfg = AgencyConfig::with_endpoints(["127.0.0.1:4001", "https://agency-2:4001"]);
        cfg.prefix = "cluster".into();
        cfg.normalize().unwrap();
        assert_eq!(cfg.prefix, "/cluster/");
        assert_eq!(cfg.endpoints, vec!["tcp://127.0.0.1:4001", "ssl://agency-2:4001"]);
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let cfg = AgencyConfig {
            num_connections: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "endpoints = ['tcp://10.0.0.1:4001', 'tcp://10.0.0.2:4001']\nprefix = 'test'\nnum_connections = 2\nlock_timeout_ms = 500"
        )
        .unwrap();

        let cfg = AgencyConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.prefix, "/test/");
        assert_eq!(cfg.num_connections, 2);
        assert_eq!(cfg.lock_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(3));
    }
}
