//! End-to-end tests: client socket, listener, proxy, mock upstream.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use common::{
    MockUpstream, PlainConnector, RecordingSink, environment, http_response, send_raw,
    static_context,
};
use neptune_proxy::config::Config;
use neptune_proxy::http::parser::MAX_BODY_BYTES;
use neptune_proxy::proxy::{Connector, ProxyHandler};
use neptune_proxy::server::{EnvironmentServer, ServerGroup, Supervision};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn start_server(
    name: &str,
    upstream_host: &str,
    connector: Arc<dyn Connector>,
) -> EnvironmentServer {
    let handler = Arc::new(ProxyHandler::new(
        &environment(name, 0, upstream_host),
        static_context(),
        connector,
        Arc::new(RecordingSink::default()),
    ));
    EnvironmentServer::bind(SocketAddr::new(LOCALHOST, 0), handler)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_request_round_trip_through_listener() {
    let upstream = MockUpstream::start(http_response("200 OK", "application/json", r#"{"result":[]}"#)).await;
    let connector = Arc::new(PlainConnector::new().route("db.staging.example.internal", upstream.addr));
    let server = start_server("staging", "db.staging.example.internal", connector).await;
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let body = r#"{"gremlin":"g.V().limit(1)"}"#;
    let raw = format!(
        "POST /gremlin HTTP/1.1\r\nHost: localhost\r\nX-Forwarded-For: 10.0.0.1\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = send_raw(addr, &raw).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: application/json\r\n"));
    assert!(response.ends_with(r#"{"result":[]}"#));

    let requests = upstream.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, body.as_bytes());
    assert!(requests[0].header("X-Forwarded-For").is_none());
}

#[tokio::test]
async fn test_keep_alive_serves_pipelined_requests() {
    let upstream = MockUpstream::start(http_response("200 OK", "text/plain", "ok")).await;
    let connector = Arc::new(PlainConnector::new().route("db.example.internal", upstream.addr));
    let server = start_server("staging", "db.example.internal", connector).await;
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let response = send_raw(
        addr,
        "GET /status HTTP/1.1\r\n\r\nGET /status HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2);
    assert_eq!(upstream.requests().len(), 2);
}

#[tokio::test]
async fn test_http10_client_is_closed_after_response() {
    let upstream = MockUpstream::start(http_response("200 OK", "text/plain", "ok")).await;
    let connector = Arc::new(PlainConnector::new().route("db.example.internal", upstream.addr));
    let server = start_server("staging", "db.example.internal", connector).await;
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        send_raw(addr, "GET /status HTTP/1.0\r\n\r\n"),
    )
    .await
    .expect("proxy should close the connection");

    assert!(response.contains("Connection: close\r\n"));
}

#[tokio::test]
async fn test_malformed_request_gets_bad_request() {
    let connector = Arc::new(PlainConnector::new());
    let server = start_server("staging", "db.example.internal", connector.clone()).await;
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let response = send_raw(addr, "GET / HTTP/1.1\r\nBrokenHeader\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(connector.dialed().is_empty());
}

#[tokio::test]
async fn test_oversized_body_gets_payload_too_large() {
    let connector = Arc::new(PlainConnector::new());
    let server = start_server("staging", "db.example.internal", connector.clone()).await;
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let raw = format!(
        "POST /gremlin HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        MAX_BODY_BYTES + 1
    );
    let response = send_raw(addr, &raw).await;

    assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(connector.dialed().is_empty());
}

#[tokio::test]
async fn test_slow_environment_does_not_block_others() {
    let slow = MockUpstream::start_with_delay(
        http_response("200 OK", "text/plain", "slow"),
        Duration::from_secs(3),
    )
    .await;
    let fast = MockUpstream::start(http_response("200 OK", "text/plain", "fast")).await;
    let connector: Arc<dyn Connector> = Arc::new(
        PlainConnector::new()
            .route("db.staging.example.internal", slow.addr)
            .route("db.prod.example.internal", fast.addr),
    );

    let staging = start_server("staging", "db.staging.example.internal", connector.clone()).await;
    let prod = start_server("prod", "db.prod.example.internal", connector).await;
    let group = ServerGroup::new(vec![staging, prod], Supervision::default());
    let addresses = group.addresses();
    assert_eq!(addresses[0].0, "staging");
    assert_eq!(addresses[1].0, "prod");
    tokio::spawn(group.run());

    let staging_addr = addresses[0].1;
    let pending = tokio::spawn(async move {
        send_raw(staging_addr, "GET /slow HTTP/1.1\r\nConnection: close\r\n\r\n").await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = tokio::time::timeout(
        Duration::from_secs(1),
        send_raw(addresses[1].1, "GET /fast HTTP/1.1\r\nConnection: close\r\n\r\n"),
    )
    .await
    .expect("prod must answer while staging is still waiting");
    assert!(response.ends_with("fast"));

    assert!(pending.await.unwrap().ends_with("slow"));
}

#[tokio::test]
async fn test_port_in_use_aborts_startup() {
    let taken = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let port = taken.local_addr().unwrap().port();

    let config = Config {
        environments: vec![environment("prod", port, "db.prod.example.internal")],
        bind: LOCALHOST,
        service: "neptune-db".to_string(),
        region: None,
        max_restarts: 0,
        restart_backoff: Duration::from_millis(10),
    };

    let err = ServerGroup::bind(
        &config,
        static_context(),
        Arc::new(PlainConnector::new()),
        Arc::new(RecordingSink::default()),
    )
    .await
    .err()
    .expect("binding a used port must fail");

    assert!(err.to_string().contains("prod"));
}
