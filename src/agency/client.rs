//! Agency client facade
//!
//! Primitive operations (get/set/remove/CAS/watch) on top of the failover
//! driver. Locking, unique ids and bootstrap live in their own modules and
//! are built from these primitives only.

use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::agency::endpoint::EndpointPool;
use crate::agency::failover::FailoverDriver;
use crate::agency::result::AgencyCommResult;
use crate::agency::transport::{HttpTransport, Transport};
use crate::common::utils::{escape_path, form_encode};
use crate::common::{encode_key, timestamp_now, AgencyConfig, Error, Result};

/// Path prefix of the key API
pub const AGENCY_URL_PREFIX: &str = "v2/keys";

/// Precondition of a compare-and-swap write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasCondition {
    /// Stored value must equal this JSON text
    PrevValue(String),
    /// Key must (true) or must not (false) exist
    PrevExist(bool),
}

impl CasCondition {
    pub fn prev_value(value: &Value) -> Self {
        CasCondition::PrevValue(value.to_string())
    }

    pub fn must_not_exist() -> Self {
        CasCondition::PrevExist(false)
    }

    fn query(&self) -> (&'static str, String) {
        match self {
            CasCondition::PrevValue(old) => ("prevValue", old.clone()),
            CasCondition::PrevExist(exist) => ("prevExist", exist.to_string()),
        }
    }
}

/// Append query parameters to a URL
fn with_query(url: String, params: &[(&str, String)]) -> String {
    if params.is_empty() {
        return url;
    }
    let query: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, form_encode(v)))
        .collect();
    format!("{}?{}", url, query.join("&"))
}

/// Whole seconds for a TTL, rounding sub-second values up
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

struct ClientInner {
    config: AgencyConfig,
    driver: FailoverDriver,
}

/// Handle to the Agency. Clones share the endpoint pool.
#[derive(Clone)]
pub struct AgencyClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for AgencyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgencyClient")
            .field("prefix", &self.inner.config.prefix)
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

impl AgencyClient {
    /// Client over HTTP
    pub fn new(config: AgencyConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(HttpTransport::new()?))
    }

    /// Client over an arbitrary transport
    pub fn with_transport(mut config: AgencyConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.normalize()?;

        let pool = Arc::new(EndpointPool::new(config.num_connections));
        for endpoint in &config.endpoints {
            pool.add_endpoint(endpoint, false)?;
        }
        let driver = FailoverDriver::new(pool, transport, config.add_new_endpoints);

        tracing::info!(
            "Agency client for prefix {} with endpoints [{}]",
            config.prefix,
            config.endpoints.join(", ")
        );

        Ok(Self {
            inner: Arc::new(ClientInner { config, driver }),
        })
    }

    pub fn config(&self) -> &AgencyConfig {
        &self.inner.config
    }

    /// Global key prefix; begins and ends with `/`
    pub fn prefix(&self) -> &str {
        &self.inner.config.prefix
    }

    pub fn pool(&self) -> &EndpointPool {
        self.inner.driver.pool()
    }

    // === Endpoint management ===

    pub fn add_endpoint(&self, spec: &str, to_front: bool) -> Result<bool> {
        self.pool().add_endpoint(spec, to_front)
    }

    pub fn has_endpoint(&self, spec: &str) -> bool {
        self.pool().has_endpoint(spec)
    }

    /// Known endpoint specs, most preferred first
    pub fn endpoints(&self) -> Vec<String> {
        self.pool().unique_specs()
    }

    pub fn endpoints_string(&self) -> String {
        self.endpoints().join(", ")
    }

    /// Block until at least one endpoint accepts a connection
    pub async fn try_connect(&self) -> bool {
        let config = self.config();
        self.pool()
            .try_connect_any(
                self.inner.driver.transport(),
                config.connect_timeout(),
                config.connect_retry_interval(),
            )
            .await
    }

    pub async fn disconnect(&self) {
        self.pool().disconnect(self.inner.driver.transport()).await;
    }

    /// Disconnect and forget all endpoints once every lease is back
    pub async fn cleanup(&self) {
        self.pool().cleanup(self.inner.driver.transport()).await;
    }

    // === Request plumbing ===

    /// Request path for a key relative to the global prefix
    pub fn build_url(&self, rel_key: &str) -> String {
        let full = format!("{}{}", self.prefix(), rel_key.trim_start_matches('/'));
        format!("/{}{}", AGENCY_URL_PREFIX, escape_path(&encode_key(&full)))
    }

    /// Request path for the global prefix itself
    fn build_prefix_url(&self) -> String {
        let prefix = self.prefix();
        let bare = &prefix[..prefix.len() - 1];
        format!("/{}{}", AGENCY_URL_PREFIX, escape_path(&encode_key(bare)))
    }

    /// Decoded key prefix that `parse` strips for results of `rel_key`
    fn strip_prefix_for(&self, rel_key: &str) -> String {
        let rel = rel_key.trim_matches('/');
        if rel.is_empty() {
            self.prefix().to_string()
        } else {
            format!("{}{}/", self.prefix(), rel)
        }
    }

    fn effective_timeout(&self, timeout: Duration) -> Duration {
        if timeout.is_zero() {
            self.config().request_timeout()
        } else {
            timeout
        }
    }

    async fn send(
        &self,
        method: Method,
        timeout: Duration,
        url: &str,
        body: &str,
        is_watch: bool,
    ) -> Result<AgencyCommResult> {
        self.inner
            .driver
            .send_with_failover(method, self.effective_timeout(timeout), url, body, is_watch)
            .await
    }

    // === Primitive operations ===

    /// Version document of the Agency
    pub async fn agency_version(&self) -> Result<String> {
        let result = self
            .send(Method::GET, Duration::ZERO, "/version", "", false)
            .await?;
        if result.successful() {
            Ok(result.body)
        } else {
            Err(Error::Http(result.error_details()))
        }
    }

    /// Read a key (and its subtree with `recursive`).
    ///
    /// On success `values` holds the entries relative to `key`, without
    /// directories.
    pub async fn get_values(&self, key: &str, recursive: bool) -> Result<AgencyCommResult> {
        self.get_values_with(key, recursive, key, false).await
    }

    /// Like [`get_values`](Self::get_values) with explicit strip prefix
    /// (relative to the global prefix) and directory markers.
    pub async fn get_values_with(
        &self,
        key: &str,
        recursive: bool,
        strip_key_prefix: &str,
        with_dirs: bool,
    ) -> Result<AgencyCommResult> {
        let mut params = Vec::new();
        if recursive {
            params.push(("recursive", "true".to_string()));
        }
        let url = with_query(self.build_url(key), &params);

        let mut result = self.send(Method::GET, Duration::ZERO, &url, "", false).await?;
        if result.successful() {
            result.parse(&self.strip_prefix_for(strip_key_prefix), with_dirs)?;
        }
        Ok(result)
    }

    /// Write a JSON value; a non-zero `ttl` makes the key expire
    pub async fn set_value(&self, key: &str, value: &Value, ttl: Duration) -> Result<AgencyCommResult> {
        let mut params = Vec::new();
        if !ttl.is_zero() {
            params.push(("ttl", ttl_secs(ttl).to_string()));
        }
        let url = with_query(self.build_url(key), &params);
        let body = format!("value={}", form_encode(&value.to_string()));

        self.send(Method::PUT, Duration::ZERO, &url, &body, false).await
    }

    /// Create a directory node
    pub async fn create_directory(&self, key: &str) -> Result<AgencyCommResult> {
        let url = with_query(self.build_url(key), &[("dir", "true".to_string())]);
        self.send(Method::PUT, Duration::ZERO, &url, "", false).await
    }

    /// Delete a key; an empty key deletes the whole namespace
    pub async fn remove_values(&self, key: &str, recursive: bool) -> Result<AgencyCommResult> {
        let url = if key.trim_matches('/').is_empty() {
            self.build_prefix_url()
        } else {
            self.build_url(key)
        };
        let mut params = Vec::new();
        if recursive {
            params.push(("recursive", "true".to_string()));
        }
        let url = with_query(url, &params);

        self.send(Method::DELETE, Duration::ZERO, &url, "", false).await
    }

    /// Conditional write. Every higher-level operation goes through here.
    pub async fn cas_value(
        &self,
        key: &str,
        condition: &CasCondition,
        new_value: &Value,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<AgencyCommResult> {
        let (name, cond) = condition.query();
        let mut params = vec![(name, cond)];
        if !ttl.is_zero() {
            params.push(("ttl", ttl_secs(ttl).to_string()));
        }
        let url = with_query(self.build_url(key), &params);
        let body = format!("value={}", form_encode(&new_value.to_string()));

        self.send(Method::PUT, timeout, &url, &body, false).await
    }

    /// Long-poll until `key` changes (at or after `wait_index` if non-zero)
    /// or `timeout` elapses.
    ///
    /// A timeout comes back as a connected result with status 0. On a hit
    /// `index` is the modification index of the changed node.
    pub async fn watch_value(
        &self,
        key: &str,
        wait_index: u64,
        timeout: Duration,
        recursive: bool,
    ) -> Result<AgencyCommResult> {
        let mut params = vec![("wait", "true".to_string())];
        if wait_index > 0 {
            params.push(("waitIndex", wait_index.to_string()));
        }
        if recursive {
            params.push(("recursive", "true".to_string()));
        }
        let url = with_query(self.build_url(key), &params);

        let mut result = self.send(Method::GET, timeout, &url, "", true).await?;
        if !result.successful() {
            return Ok(result);
        }
        let node = match result.node() {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!("Unreadable watch reply for {}: {}", key, e);
                return Ok(AgencyCommResult::failure(format!("unreadable watch reply: {}", e)));
            }
        };
        if let Some(node) = node {
            if node.modified_index > 0 {
                result.index = node.modified_index;
            }
        }
        result.parse(&self.strip_prefix_for(key), false)?;
        Ok(result)
    }

    /// Does `key` exist?
    pub async fn exists(&self, key: &str) -> bool {
        let url = self.build_url(key);
        match self.send(Method::GET, Duration::ZERO, &url, "", false).await {
            Ok(result) => result.successful(),
            Err(e) => {
                tracing::warn!("Existence check of {} failed: {}", key, e);
                false
            }
        }
    }

    /// CAS-bump a numeric counter, creating it as 1 when absent
    pub async fn increment_version(&self, key: &str) -> bool {
        let current = match self.get_values(key, false).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Reading version {} failed: {}", key, e);
                return false;
            }
        };

        let attempt = if current.is_not_found() {
            self.cas_value(key, &CasCondition::must_not_exist(), &json!(1), Duration::ZERO, Duration::ZERO)
                .await
        } else if current.successful() {
            let Some(entry) = current.values.values().next() else {
                return false;
            };
            let Some(version) = entry.as_u64() else {
                tracing::warn!("Version {} is not numeric: {}", key, entry.value);
                return false;
            };
            self.cas_value(
                key,
                &CasCondition::PrevValue(entry.value.clone()),
                &json!(version + 1),
                Duration::ZERO,
                Duration::ZERO,
            )
            .await
        } else {
            return false;
        };

        matches!(attempt, Ok(result) if result.successful())
    }

    /// Heartbeat this server's state under `Sync/ServerStates/<id>`
    pub async fn send_server_state(
        &self,
        server_id: &str,
        status: &str,
        ttl: Duration,
    ) -> Result<AgencyCommResult> {
        let value = json!({ "status": status, "time": timestamp_now() });
        self.set_value(&format!("Sync/ServerStates/{}", server_id), &value, ttl)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agency::memory::InMemoryAgency;

    fn client(prefix: &str) -> AgencyClient {
        let mut config = AgencyConfig::with_endpoints(["tcp://127.0.0.1:4001"]);
        config.prefix = prefix.into();
        AgencyClient::with_transport(config, Arc::new(InMemoryAgency::new())).unwrap()
    }

    #[test]
    fn test_build_url() {
        let c = client("/arango/");
        assert_eq!(c.build_url("Plan/Version"), "/v2/keys/arango/Plan/Version");
        assert_eq!(c.build_url("/Plan/_system"), "/v2/keys/arango/Plan/@Usystem");
        assert_eq!(c.build_prefix_url(), "/v2/keys/arango");
        assert_eq!(c.build_url("a b"), "/v2/keys/arango/a%20b");
    }

    #[test]
    fn test_with_query_and_ttl() {
        assert_eq!(with_query("/x".into(), &[]), "/x");
        assert_eq!(
            with_query("/x".into(), &[("prevValue", "\"UNLOCKED\"".into()), ("ttl", "5".into())]),
            "/x?prevValue=%22UNLOCKED%22&ttl=5"
        );
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_secs(10)), 10);
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let c = client("/arango/");
        assert!(c.set_value("Plan/Version", &json!(1), Duration::ZERO).await.unwrap().successful());

        let got = c.get_values("Plan/Version", false).await.unwrap();
        assert!(got.successful());
        assert_eq!(got.values.values().next().unwrap().as_u64(), Some(1));

        assert!(c.exists("Plan/Version").await);
        assert!(c.remove_values("Plan", true).await.unwrap().successful());
        assert!(!c.exists("Plan/Version").await);
        assert!(c.get_values("Plan/Version", false).await.unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_get_values_recursive_flattens() {
        let c = client("/foo/");
        c.set_value("bar/a", &json!(1), Duration::ZERO).await.unwrap();
        c.set_value("bar/b/c", &json!(2), Duration::ZERO).await.unwrap();

        let got = c.get_values("bar", true).await.unwrap();
        let flat: Vec<(&str, &str)> = got
            .values
            .iter()
            .map(|(k, v)| (k.as_str(), v.value.as_str()))
            .collect();
        assert_eq!(flat, vec![("a", "1"), ("b/c", "2")]);

        let with_dirs = c.get_values_with("bar", true, "bar", true).await.unwrap();
        assert!(with_dirs.values["b"].is_dir);
    }

    #[tokio::test]
    async fn test_cas_on_missing_key() {
        let c = client("/arango/");
        let new = json!("Y");

        let r = c
            .cas_value("K", &CasCondition::prev_value(&json!("X")), &new, Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();
        assert!(!r.successful());

        let r = c
            .cas_value("K", &CasCondition::must_not_exist(), &new, Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();
        assert!(r.successful());

        let r = c
            .cas_value("K", &CasCondition::must_not_exist(), &new, Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();
        assert!(!r.successful());
        assert_eq!(r.status_code, 412);
    }

    #[tokio::test]
    async fn test_increment_version() {
        let c = client("/arango/");
        assert!(c.increment_version("Plan/Version").await);
        assert!(c.increment_version("Plan/Version").await);
        let got = c.get_values("Plan/Version", false).await.unwrap();
        assert_eq!(got.values.values().next().unwrap().as_u64(), Some(2));
    }

    #[tokio::test]
    async fn test_send_server_state() {
        let c = client("/arango/");
        let r = c
            .send_server_state("DBServer001", "SERVING", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(r.successful());

        let got = c.get_values("Sync/ServerStates/DBServer001", false).await.unwrap();
        let state = got.values.values().next().unwrap().json().unwrap();
        assert_eq!(state["status"], "SERVING");
    }
}
