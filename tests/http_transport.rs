//! HttpTransport end to end against axum servers fronting the in-process Agency

use agencycomm::agency::{AgencyRequest, InMemoryAgency};
use agencycomm::{AgencyClient, AgencyConfig, CasCondition};
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn forward(
    State(agency): State<Arc<InMemoryAgency>>,
    method: Method,
    uri: Uri,
    body: String,
) -> Response {
    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let reply = agency
        .handle(&AgencyRequest::new(method, url, body, Duration::from_secs(5)))
        .await;

    let status = StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::GATEWAY_TIMEOUT);
    let mut response = (status, reply.body).into_response();
    for (name, value) in &reply.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_agency(agency: Arc<InMemoryAgency>) -> SocketAddr {
    spawn(Router::new().fallback(forward).with_state(agency)).await
}

/// A follower that redirects every request to `leader`
async fn spawn_follower(leader: SocketAddr) -> SocketAddr {
    let app = Router::new().fallback(move |uri: Uri| async move {
        let location = format!(
            "http://{}{}",
            leader,
            uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );
        (StatusCode::TEMPORARY_REDIRECT, [(axum::http::header::LOCATION, location)])
    });
    spawn(app).await
}

fn client(endpoints: &[SocketAddr]) -> AgencyClient {
    let config = AgencyConfig::with_endpoints(endpoints.iter().map(|a| format!("tcp://{}", a)));
    AgencyClient::new(config).unwrap()
}

#[tokio::test]
async fn test_http_roundtrip() {
    let agency = Arc::new(InMemoryAgency::new());
    let addr = spawn_agency(agency.clone()).await;
    let c = client(&[addr]);

    assert!(c.try_connect().await);
    assert!(c.agency_version().await.unwrap().contains("etcdserver"));

    let written = c
        .set_value("Plan/Databases/_system", &json!({"name": "_system"}), Duration::ZERO)
        .await
        .unwrap();
    assert!(written.successful());
    assert!(written.index > 0);

    let got = c.get_values("Plan", true).await.unwrap();
    assert_eq!(got.values["Databases/_system"].json().unwrap()["name"], "_system");
    assert_eq!(
        agency.raw_value("/arango/Plan/Databases/@Usystem").as_deref(),
        Some(r#"{"name":"_system"}"#)
    );

    let swapped = c
        .cas_value(
            "Plan/Databases/_system",
            &CasCondition::prev_value(&json!({"name": "_system"})),
            &json!({"name": "renamed"}),
            Duration::ZERO,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert!(swapped.successful());

    let removed = c.remove_values("Plan", true).await.unwrap();
    assert!(removed.successful());
    assert!(c.get_values("Plan", true).await.unwrap().is_not_found());
}

#[tokio::test]
async fn test_http_redirect_to_leader() {
    let agency = Arc::new(InMemoryAgency::new());
    let leader = spawn_agency(agency).await;
    let follower = spawn_follower(leader).await;
    let c = client(&[follower]);

    assert!(c.set_value("Target/Version", &json!(3), Duration::ZERO).await.unwrap().successful());
    assert!(c.has_endpoint(&format!("tcp://{}", leader)));
    assert_eq!(c.endpoints()[0], format!("tcp://{}", leader));

    let got = c.get_values("Target/Version", false).await.unwrap();
    assert_eq!(got.values.values().next().unwrap().as_u64(), Some(3));
}

#[tokio::test]
async fn test_http_dead_endpoint_is_skipped() {
    let agency = Arc::new(InMemoryAgency::new());
    let live = spawn_agency(agency).await;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let mut config = AgencyConfig::with_endpoints([format!("tcp://{}", dead), format!("tcp://{}", live)]);
    config.num_connections = 1;
    let c = AgencyClient::new(config).unwrap();

    let result = c.set_value("Current/Version", &json!(1), Duration::ZERO).await.unwrap();
    assert!(result.successful());
    assert_eq!(c.endpoints()[0], format!("tcp://{}", live));
}
