//! Transport seam between the client and a single Agency replica
//!
//! The failover driver only ever talks to a [`Transport`]. [`HttpTransport`]
//! is the production implementation on top of reqwest; tests plug in
//! [`InMemoryAgency`](crate::agency::memory::InMemoryAgency) or a scripted
//! fake.

use async_trait::async_trait;
use reqwest::Method;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::agency::endpoint::endpoint_base_url;
use crate::common::Result;

/// Header carrying the store-wide modification index
pub const ETCD_INDEX_HEADER: &str = "x-etcd-index";

/// One HTTP request against an Agency replica
#[derive(Debug, Clone)]
pub struct AgencyRequest {
    pub method: Method,
    /// Path and query string, starting with `/`
    pub url: String,
    /// Form-encoded body (empty for GET and DELETE)
    pub body: String,
    pub timeout: Duration,
}

impl AgencyRequest {
    pub fn new(method: Method, url: impl Into<String>, body: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            body: body.into(),
            timeout,
        }
    }
}

/// Raw outcome of one request against one replica
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    /// False when the replica could not be reached at all
    pub connected: bool,
    /// HTTP status, 0 when no response arrived
    pub status_code: u16,
    pub location: Option<String>,
    pub body: String,
    pub message: String,
    /// Response headers, names lowercased
    pub headers: BTreeMap<String, String>,
}

impl TransportResponse {
    pub fn new(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            connected: true,
            status_code,
            body: body.into(),
            ..Default::default()
        }
    }

    /// The replica refused or dropped the connection
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            connected: false,
            message: message.into(),
            ..Default::default()
        }
    }

    /// The replica accepted the request but did not answer in time
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            connected: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn redirect(location: impl Into<String>) -> Self {
        Self {
            connected: true,
            status_code: 307,
            location: Some(location.into()),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn etcd_index(&self) -> Option<u64> {
        self.header(ETCD_INDEX_HEADER).and_then(|v| v.trim().parse().ok())
    }
}

/// Sends single requests to Agency replicas addressed by endpoint spec
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish (or check) connectivity to a replica
    async fn connect(&self, endpoint: &str, timeout: Duration) -> Result<()>;

    async fn disconnect(&self, endpoint: &str);

    /// Send one request.
    ///
    /// Unreachable replicas and timeouts are reported inside the response;
    /// `Err` means the transport itself broke and the caller gives up.
    async fn send(&self, endpoint: &str, request: &AgencyRequest) -> Result<TransportResponse>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, endpoint: &str, timeout: Duration) -> Result<()> {
        let addr = endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(endpoint)
            .to_string();

        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => {
                tracing::debug!("Connected to agency endpoint {}", endpoint);
                Ok(())
            }
            Ok(Err(e)) => Err(crate::Error::ConnectionFailed(format!("{}: {}", endpoint, e))),
            Err(_) => Err(crate::Error::Timeout(format!("connect to {}", endpoint))),
        }
    }

    async fn disconnect(&self, endpoint: &str) {
        // reqwest pools connections internally; nothing to tear down per endpoint
        tracing::debug!("Disconnected from agency endpoint {}", endpoint);
    }

    async fn send(&self, endpoint: &str, request: &AgencyRequest) -> Result<TransportResponse> {
        let url = format!("{}{}", endpoint_base_url(endpoint)?, request.url);
        tracing::debug!("{} {} (timeout {:?})", request.method, url, request.timeout);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(request.timeout);
        if request.method == Method::PUT || !request.body.is_empty() {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(request.body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => return Ok(TransportResponse::unreachable(e.to_string())),
            Err(e) if e.is_timeout() => return Ok(TransportResponse::timed_out(e.to_string())),
            Err(e) => return Err(e.into()),
        };

        let status_code = response.status().as_u16();
        let message = response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        let location = headers.get("location").cloned();

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Ok(TransportResponse::timed_out(e.to_string())),
            Err(e) => return Err(e.into()),
        };

        Ok(TransportResponse {
            connected: true,
            status_code,
            location,
            body,
            message,
            headers,
        })
    }
}
