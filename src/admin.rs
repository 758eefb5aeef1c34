//! Admin HTTP endpoint
//!
//! A loopback-only HTTP responder serving connection snapshots as JSON,
//! plus the client side used by the `connections` CLI command. Requests
//! must carry the filesystem-stored internal secret.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::connection::{group_by_ip, ActiveConn, ConnGroup, ConnectionRegistry};

/// Fixed loopback bind for the admin endpoint.
pub const ADMIN_ADDR: &str = "127.0.0.1:6060";

/// Header carrying the internal admin secret.
pub const INTERNAL_HEADER: &str = "X-ProxyChan-Internal";

/// API response for /connections
#[derive(Serialize)]
struct ConnectionsResponse {
    count: usize,
    connections: Vec<ActiveConn>,
}

/// Bind the admin endpoint and serve it on its own thread. Binding
/// happens here so a port conflict fails startup instead of a detached
/// thread.
pub fn start_admin_server(
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    secret: String,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr)?;
    let bound = listener.local_addr()?;

    thread::spawn(move || {
        if let Err(e) = run_admin_server(listener, registry, secret) {
            error!(error = %e, "admin endpoint error");
        }
    });
    info!(addr = %bound, "admin endpoint started");
    Ok(bound)
}

fn run_admin_server(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    secret: String,
) -> std::io::Result<()> {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let registry = registry.clone();
                let secret = secret.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_request(stream, &registry, &secret) {
                        debug!(error = %e, "admin request error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "admin accept failed");
            }
        }
    }

    Ok(())
}

fn handle_request(
    mut stream: TcpStream,
    registry: &ConnectionRegistry,
    secret: &str,
) -> std::io::Result<()> {
    let mut buffer = [0u8; 4096];
    let n = stream.read(&mut buffer)?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..n]);
    let first_line = request.lines().next().unwrap_or("");
    let path = first_line.split_whitespace().nth(1).unwrap_or("/");

    let header_prefix = format!("{}:", INTERNAL_HEADER.to_ascii_lowercase());
    let presented = request
        .lines()
        .skip(1)
        .take_while(|line| !line.is_empty())
        .find(|line| line.to_ascii_lowercase().starts_with(&header_prefix))
        .and_then(|line| line.split_once(':').map(|(_, v)| v.trim()));

    let (status, body) = if presented != Some(secret) {
        ("401 Unauthorized", r#"{"error": "unauthorized"}"#.to_string())
    } else {
        match path {
            "/connections" => {
                let connections = registry.snapshot();
                let response = ConnectionsResponse {
                    count: connections.len(),
                    connections,
                };
                (
                    "200 OK",
                    serde_json::to_string_pretty(&response).unwrap_or_default(),
                )
            }
            "/connections/by-ip" => {
                let groups = group_by_ip(registry.snapshot());
                (
                    "200 OK",
                    serde_json::to_string_pretty(&groups).unwrap_or_default(),
                )
            }
            _ => ("404 Not Found", r#"{"error": "not found"}"#.to_string()),
        }
    };

    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes())?;
    stream.flush()?;

    Ok(())
}

/// CLI-side query against a running proxy's admin endpoint.
pub fn fetch_connections_by_ip(addr: SocketAddr, secret: &str) -> anyhow::Result<Vec<ConnGroup>> {
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(3))
        .map_err(|e| anyhow::anyhow!("failed to connect to proxy admin endpoint: {e}"))?;
    stream.set_read_timeout(Some(Duration::from_secs(3)))?;
    stream.set_write_timeout(Some(Duration::from_secs(3)))?;

    let request = format!(
        "GET /connections/by-ip HTTP/1.1\r\n\
         Host: {addr}\r\n\
         {INTERNAL_HEADER}: {secret}\r\n\
         Connection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes())?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;

    let (head, body) = response
        .split_once("\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("malformed admin response"))?;
    let status_line = head.lines().next().unwrap_or("");
    if !status_line.contains("200") {
        anyhow::bail!("admin endpoint returned {status_line:?}");
    }

    Ok(serde_json::from_str(body)?)
}

/// Total active connections, summed over groups.
pub fn fetch_connection_count(addr: SocketAddr, secret: &str) -> anyhow::Result<usize> {
    Ok(fetch_connections_by_ip(addr, secret)?
        .iter()
        .map(|group| group.count)
        .sum())
}
