//! Failover driver against a scripted transport

use agencycomm::agency::{
    AgencyRequest, EndpointPool, FailoverDriver, Transport, TransportResponse,
};
use agencycomm::{AgencyClient, AgencyConfig, Error, Result};
use async_trait::async_trait;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Reply = Box<dyn Fn(&AgencyRequest) -> Result<TransportResponse> + Send + Sync>;

/// Answers per endpoint with a fixed closure and records every call
#[derive(Default)]
struct ScriptedTransport {
    replies: HashMap<String, Reply>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    fn on<F>(mut self, endpoint: &str, reply: F) -> Self
    where
        F: Fn(&AgencyRequest) -> Result<TransportResponse> + Send + Sync + 'static,
    {
        self.replies.insert(endpoint.to_string(), Box::new(reply));
        self
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _endpoint: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self, _endpoint: &str) {}

    async fn send(&self, endpoint: &str, request: &AgencyRequest) -> Result<TransportResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_string(), request.url.clone()));
        match self.replies.get(endpoint) {
            Some(reply) => reply(request),
            None => Ok(TransportResponse::unreachable("no route")),
        }
    }
}

fn driver(endpoints: &[&str], transport: Arc<ScriptedTransport>, add_new: bool) -> FailoverDriver {
    let pool = Arc::new(EndpointPool::new(1));
    for endpoint in endpoints {
        pool.add_endpoint(endpoint, false).unwrap();
    }
    FailoverDriver::new(pool, transport, add_new)
}

async fn get(driver: &FailoverDriver, url: &str) -> Result<agencycomm::AgencyCommResult> {
    driver
        .send_with_failover(Method::GET, Duration::from_secs(1), url, "", false)
        .await
}

#[tokio::test]
async fn test_redirect_is_followed_in_two_tries() {
    let transport = Arc::new(
        ScriptedTransport::default()
            .on("tcp://a:4001", |_| {
                Ok(TransportResponse::redirect("http://b:4001/v2/keys/x"))
            })
            .on("tcp://b:4001", |_| Ok(TransportResponse::new(200, "{}")))
            .on("tcp://c:4001", |_| Ok(TransportResponse::new(200, "{}"))),
    );
    let driver = driver(&["tcp://a:4001", "tcp://b:4001", "tcp://c:4001"], transport.clone(), true);

    let result = get(&driver, "/v2/keys/x").await.unwrap();
    assert!(result.successful());
    assert_eq!(
        transport.calls(),
        vec![
            ("tcp://a:4001".to_string(), "/v2/keys/x".to_string()),
            ("tcp://b:4001".to_string(), "/v2/keys/x".to_string()),
        ]
    );
    // the answering endpoint is now preferred
    assert_eq!(driver.pool().unique_specs()[0], "tcp://b:4001");
    assert_eq!(driver.pool().busy_count(), 0);
}

#[tokio::test]
async fn test_redirect_to_unknown_endpoint_is_learned() {
    let transport = Arc::new(
        ScriptedTransport::default()
            .on("tcp://a:4001", |_| {
                Ok(TransportResponse::redirect("https://c:4001/v2/keys/y"))
            })
            .on("ssl://c:4001", |_| Ok(TransportResponse::new(200, "{}"))),
    );
    let driver = driver(&["tcp://a:4001"], transport.clone(), true);

    let result = get(&driver, "/v2/keys/y").await.unwrap();
    assert!(result.successful());
    assert!(driver.pool().has_endpoint("ssl://c:4001"));
    assert_eq!(transport.calls()[1].0, "ssl://c:4001");
}

#[tokio::test]
async fn test_redirect_to_unknown_endpoint_rejected() {
    let transport = Arc::new(ScriptedTransport::default().on("tcp://a:4001", |_| {
        Ok(TransportResponse::redirect("http://c:4001/v2/keys/y"))
    }));
    let driver = driver(&["tcp://a:4001"], transport, false);

    let err = get(&driver, "/v2/keys/y").await.unwrap_err();
    assert!(matches!(err, Error::UnknownEndpoint(_)));
    assert!(!driver.pool().has_endpoint("tcp://c:4001"));
    assert_eq!(driver.pool().busy_count(), 0);
}

#[tokio::test]
async fn test_server_error_rotates_to_next_endpoint() {
    let transport = Arc::new(
        ScriptedTransport::default()
            .on("tcp://a:4001", |_| Ok(TransportResponse::new(503, "busy")))
            .on("tcp://b:4001", |_| Ok(TransportResponse::new(200, "{}"))),
    );
    let driver = driver(&["tcp://a:4001", "tcp://b:4001"], transport.clone(), true);

    let result = get(&driver, "/v2/keys/x").await.unwrap();
    assert!(result.successful());
    let endpoints: Vec<String> = transport.calls().into_iter().map(|(e, _)| e).collect();
    assert_eq!(endpoints, vec!["tcp://a:4001", "tcp://b:4001"]);
}

#[tokio::test]
async fn test_client_error_stops_immediately() {
    let transport = Arc::new(
        ScriptedTransport::default()
            .on("tcp://a:4001", |_| {
                Ok(TransportResponse::new(404, r#"{"errorCode":100,"message":"Key not found"}"#))
            })
            .on("tcp://b:4001", |_| Ok(TransportResponse::new(200, "{}"))),
    );
    let driver = driver(&["tcp://a:4001", "tcp://b:4001"], transport.clone(), true);

    let result = get(&driver, "/v2/keys/x").await.unwrap();
    assert!(result.is_not_found());
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn test_transport_error_aborts() {
    let transport = Arc::new(
        ScriptedTransport::default()
            .on("tcp://a:4001", |_| Err(Error::Http("broken pipe".into())))
            .on("tcp://b:4001", |_| Ok(TransportResponse::new(200, "{}"))),
    );
    let driver = driver(&["tcp://a:4001", "tcp://b:4001"], transport.clone(), true);

    assert!(get(&driver, "/v2/keys/x").await.is_err());
    assert_eq!(transport.calls().len(), 1);
    assert_eq!(driver.pool().busy_count(), 0);
}

#[tokio::test]
async fn test_all_endpoints_down_exhausts_tries() {
    let transport = Arc::new(ScriptedTransport::default());
    let driver = driver(&["tcp://a:4001", "tcp://b:4001", "tcp://c:4001"], transport.clone(), true);

    let result = get(&driver, "/v2/keys/x").await.unwrap();
    assert!(!result.successful());
    assert!(!result.connected);
    assert_eq!(transport.calls().len(), 3);
    assert_eq!(driver.pool().busy_count(), 0);
}

#[tokio::test]
async fn test_watch_timeout_is_final() {
    let transport = Arc::new(
        ScriptedTransport::default()
            .on("tcp://a:4001", |_| Ok(TransportResponse::timed_out("deadline")))
            .on("tcp://b:4001", |_| Ok(TransportResponse::new(200, "{}"))),
    );
    let driver = driver(&["tcp://a:4001", "tcp://b:4001"], transport.clone(), true);

    let result = driver
        .send_with_failover(Method::GET, Duration::from_millis(50), "/v2/keys/x?wait=true", "", true)
        .await
        .unwrap();
    assert!(result.connected);
    assert_eq!(result.status_code, 0);
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_pool() {
    let transport = Arc::new(
        ScriptedTransport::default()
            .on("tcp://a:4001", |_| Ok(TransportResponse::new(200, "{}")))
            .on("tcp://b:4001", |_| Ok(TransportResponse::new(200, "{}"))),
    );
    let driver = Arc::new(driver(&["tcp://a:4001", "tcp://b:4001"], transport.clone(), true));

    let mut handles = Vec::new();
    for i in 0..16 {
        let driver = driver.clone();
        handles.push(tokio::spawn(async move {
            get(&driver, &format!("/v2/keys/k{}", i)).await.unwrap().successful()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }
    assert_eq!(transport.calls().len(), 16);
    assert_eq!(driver.pool().busy_count(), 0);
}

fn client(endpoints: &[&str], transport: Arc<ScriptedTransport>) -> AgencyClient {
    let mut config = AgencyConfig::with_endpoints(endpoints.iter().copied());
    config.num_connections = 1;
    AgencyClient::with_transport(config, transport).unwrap()
}

const WATCH_HIT: &str =
    r#"{"action":"set","node":{"key":"/arango/Plan/Version","value":"5","modifiedIndex":12}}"#;

#[tokio::test]
async fn test_empty_watch_reply_moves_to_next_endpoint() {
    let transport = Arc::new(
        ScriptedTransport::default()
            .on("tcp://a:4001", |_| Ok(TransportResponse::new(200, "")))
            .on("tcp://b:4001", |_| Ok(TransportResponse::new(200, WATCH_HIT))),
    );
    let c = client(&["tcp://a:4001", "tcp://b:4001"], transport.clone());

    let hit = c
        .watch_value("Plan/Version", 0, Duration::from_millis(100), false)
        .await
        .unwrap();
    assert!(hit.successful());
    assert_eq!(hit.index, 12);
    assert_eq!(hit.values.values().next().unwrap().as_u64(), Some(5));
    let endpoints: Vec<String> = transport.calls().into_iter().map(|(e, _)| e).collect();
    assert_eq!(endpoints, vec!["tcp://a:4001", "tcp://b:4001"]);
}

#[tokio::test]
async fn test_empty_watch_replies_everywhere_fail_without_error() {
    let transport = Arc::new(
        ScriptedTransport::default()
            .on("tcp://a:4001", |_| Ok(TransportResponse::new(200, "")))
            .on("tcp://b:4001", |_| Ok(TransportResponse::new(200, "  \n"))),
    );
    let c = client(&["tcp://a:4001", "tcp://b:4001"], transport.clone());

    let result = c
        .watch_value("Plan/Version", 0, Duration::from_millis(100), false)
        .await
        .unwrap();
    assert!(!result.successful());
    assert_eq!(transport.calls().len(), 2);
    assert_eq!(c.pool().busy_count(), 0);
}

#[tokio::test]
async fn test_garbled_watch_reply_is_a_failed_result() {
    let transport = Arc::new(
        ScriptedTransport::default().on("tcp://a:4001", |_| Ok(TransportResponse::new(200, "{not json"))),
    );
    let c = client(&["tcp://a:4001"], transport);

    let result = c
        .watch_value("Plan/Version", 0, Duration::from_millis(100), false)
        .await
        .unwrap();
    assert!(!result.successful());
    assert!(result.values.is_empty());
}
