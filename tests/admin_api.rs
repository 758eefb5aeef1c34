//! Admin endpoint: secret gating and connection snapshots over HTTP.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use proxychan::admin::{
    fetch_connection_count, fetch_connections_by_ip, start_admin_server, INTERNAL_HEADER,
};
use proxychan::connection::ConnectionRegistry;

fn start_endpoint(registry: Arc<ConnectionRegistry>, secret: &str) -> std::net::SocketAddr {
    start_admin_server(
        "127.0.0.1:0".parse().unwrap(),
        registry,
        secret.to_string(),
    )
    .unwrap()
}

fn raw_get(addr: std::net::SocketAddr, path: &str, secret: Option<&str>) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    let auth = secret
        .map(|s| format!("{INTERNAL_HEADER}: {s}\r\n"))
        .unwrap_or_default();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\n{auth}Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[tokio::test]
async fn snapshot_round_trips_through_the_endpoint() {
    let registry = ConnectionRegistry::new();
    let addr = start_endpoint(registry.clone(), "s3cret");

    let _a = registry.register("alice", "10.0.0.1".parse().unwrap(), "one.test:443");
    let _b = registry.register("bob", "10.0.0.1".parse().unwrap(), "two.test:443");
    let _c = registry.register("", "10.0.0.2".parse().unwrap(), "three.test:80");

    let (groups, total) = tokio::task::spawn_blocking(move || {
        (
            fetch_connections_by_ip(addr, "s3cret").unwrap(),
            fetch_connection_count(addr, "s3cret").unwrap(),
        )
    })
    .await
    .unwrap();

    assert_eq!(groups.len(), 2);
    assert_eq!(total, 3);
    for group in &groups {
        assert!(!group.source_ip.contains(':'));
        // Newest first within each group.
        for pair in group.conns.windows(2) {
            assert!(pair[0].started_at >= pair[1].started_at);
        }
    }
}

#[tokio::test]
async fn missing_or_wrong_secret_is_unauthorized() {
    let registry = ConnectionRegistry::new();
    let addr = start_endpoint(registry, "s3cret");

    let response = tokio::task::spawn_blocking(move || {
        (
            raw_get(addr, "/connections", None),
            raw_get(addr, "/connections", Some("wrong")),
            raw_get(addr, "/connections", Some("s3cret")),
            raw_get(addr, "/nope", Some("s3cret")),
        )
    })
    .await
    .unwrap();

    assert!(response.0.starts_with("HTTP/1.1 401"));
    assert!(response.1.starts_with("HTTP/1.1 401"));
    assert!(response.2.starts_with("HTTP/1.1 200"));
    assert!(response.3.starts_with("HTTP/1.1 404"));
}
