//! Drive one logical request across the endpoint pool
//!
//! Every iteration leases a slot, sends once and decides:
//! - transport `Err`: the slot goes back as successful and the whole call
//!   aborts without trying another endpoint
//! - 307: the call follows `Location` on the next iteration
//! - 2xx, 4xx, or status 0 on a watch: done (an empty 2xx watch reply is
//!   retried)
//! - anything else: try the next endpoint
//!
//! At most one iteration per pool slot is spent, redirects included. An
//! endpoint learned from a redirect adds one iteration.

use reqwest::Method;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::agency::endpoint::{normalize_endpoint, EndpointPool};
use crate::agency::result::AgencyCommResult;
use crate::agency::transport::{AgencyRequest, Transport};
use crate::common::{Error, Result};

/// Translate a redirect `Location` into `(endpoint spec, path)`.
///
/// `http://host:port/path` maps to `tcp://host:port`, `https://` to `ssl://`.
pub fn decode_location(location: &str) -> Result<(String, String)> {
    let (scheme, rest) = if let Some(rest) = location.strip_prefix("http://") {
        ("tcp", rest)
    } else if let Some(rest) = location.strip_prefix("https://") {
        ("ssl", rest)
    } else {
        return Err(Error::InvalidRedirect(location.to_string()));
    };

    let delim = rest
        .find('/')
        .ok_or_else(|| Error::InvalidRedirect(location.to_string()))?;
    let (host_port, path) = rest.split_at(delim);
    let spec = normalize_endpoint(&format!("{}://{}", scheme, host_port))
        .map_err(|_| Error::InvalidRedirect(location.to_string()))?;

    Ok((spec, path.to_string()))
}

pub struct FailoverDriver {
    pool: Arc<EndpointPool>,
    transport: Arc<dyn Transport>,
    add_new_endpoints: bool,
}

impl FailoverDriver {
    pub fn new(pool: Arc<EndpointPool>, transport: Arc<dyn Transport>, add_new_endpoints: bool) -> Self {
        Self {
            pool,
            transport,
            add_new_endpoints,
        }
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub async fn send_with_failover(
        &self,
        method: Method,
        timeout: Duration,
        url: &str,
        body: &str,
        is_watch: bool,
    ) -> Result<AgencyCommResult> {
        let mut num_endpoints = self.pool.len();
        let mut tries = 0;
        let mut forced_spec: Option<String> = None;
        let mut url = url.to_string();
        let mut tried = HashSet::new();

        while tries < num_endpoints {
            tries += 1;
            let lease = match forced_spec.as_deref() {
                Some(spec) => self.pool.pop_endpoint(Some(spec)).await?,
                None => self.pool.pop_endpoint_excluding(None, &tried).await?,
            };
            tried.insert(lease.id());

            let request = AgencyRequest::new(method.clone(), url.clone(), body, timeout);
            let response = match self.transport.send(lease.spec(), &request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(
                        "Transport failure on {} for {} {}: {}",
                        lease.spec(),
                        method,
                        url,
                        e
                    );
                    lease.release(true);
                    return Err(e);
                }
            };
            let result = AgencyCommResult::from_response(response);

            if result.status_code == 307 {
                let from = lease.spec().to_string();
                lease.release(false);

                let location = result
                    .location
                    .as_deref()
                    .ok_or_else(|| Error::InvalidRedirect("missing Location header".into()))?;
                let (new_spec, new_url) = decode_location(location)?;

                if !self.pool.has_endpoint(&new_spec) {
                    if !self.add_new_endpoints {
                        tracing::error!("Redirect from {} to unknown endpoint {}", from, new_spec);
                        return Err(Error::UnknownEndpoint(new_spec));
                    }
                    if self.pool.add_endpoint(&new_spec, true)? {
                        num_endpoints += 1;
                    }
                }

                tracing::warn!("Agency endpoint {} redirected to {}", from, new_spec);
                forced_spec = Some(new_spec);
                url = new_url;
                continue;
            }

            // an empty watch reply means the replica gave up, not that nothing changed
            let empty_watch = is_watch && result.successful() && result.body.trim().is_empty();
            let can_stop = (result.successful() && !empty_watch)
                || (is_watch && result.status_code == 0)
                || result.is_client_error();
            let spec = lease.spec().to_string();
            lease.release(can_stop);

            if can_stop {
                return Ok(result);
            }

            tracing::warn!(
                "Agency endpoint {} failed {} {}: {}",
                spec,
                method,
                url,
                result.error_details()
            );
            forced_spec = None;
        }

        Ok(AgencyCommResult::failure(format!(
            "no agency endpoint answered {} {} after {} tries",
            method, url, tries
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_location() {
        assert_eq!(
            decode_location("http://10.0.0.2:4001/v2/keys/arango/Plan?recursive=true").unwrap(),
            (
                "tcp://10.0.0.2:4001".to_string(),
                "/v2/keys/arango/Plan?recursive=true".to_string()
            )
        );
        assert_eq!(
            decode_location("https://agency:4001/v2/keys").unwrap().0,
            "ssl://agency:4001"
        );
    }

    #[test]
    fn test_decode_location_rejects_garbage() {
        assert!(decode_location("ftp://a:1/x").is_err());
        assert!(decode_location("http://a:1").is_err());
        assert!(decode_location("http:///x").is_err());
        assert!(decode_location("").is_err());
    }
}
