//! HTTP CONNECT front-end
//!
//! Same authorize/dial/tunnel path as the SOCKS5 listener, entered through
//! a `CONNECT host:port HTTP/1.1` request line with optional Basic proxy
//! auth. The 200 acknowledgement goes to the raw stream; whatever the
//! buffered reader holds past the header terminator is discarded, because
//! a compliant client sends nothing before the tunnel opens.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::util::split_host_port;

use super::{relay, ServerState, DIAL_TIMEOUT, HANDSHAKE_TIMEOUT};

const PROXY_AGENT: &str = "ProxyChan";

/// HTTP CONNECT proxy listener
pub struct HttpServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl HttpServer {
    pub async fn bind(addr: &str, state: Arc<ServerState>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP proxy to {addr}"))?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("listener has a local addr")
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(bind = %self.local_addr(), "HTTP CONNECT proxy listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            debug!(client = %client_addr, "New HTTP connection");
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_http_client(stream, client_addr, state).await {
                                    debug!(error = %e, client = %client_addr, "HTTP session error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("HTTP listener stopped");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_http_client(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let src_ip = client_addr.ip();

    if !state.source_policy.is_allowed(src_ip) {
        warn!(client = %client_addr, "connection blocked by source allowlist");
        return Ok(());
    }

    let parsed = match timeout(HANDSHAKE_TIMEOUT, read_connect_request(&mut stream)).await {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(_)) => {
            write_http_error(&mut stream, 405, "Method Not Allowed", false).await?;
            bail!("not a CONNECT request");
        }
        Err(_) => {
            debug!(client = %client_addr, "request deadline exceeded");
            return Ok(());
        }
    };
    let (target, headers) = parsed;

    let username = if state.require_auth {
        match authenticate(&mut stream, &headers, &state).await? {
            Some(user) => user,
            None => bail!("proxy auth failed"),
        }
    } else {
        String::new()
    };

    let Ok((host, _port)) = split_host_port(&target) else {
        write_http_error(&mut stream, 405, "Method Not Allowed", false).await?;
        bail!("bad CONNECT target");
    };

    if let Some(hit) = state.dest_policy.decide(host) {
        write_http_error(&mut stream, 403, "Forbidden", false).await?;
        warn!(
            user = %username,
            client = %client_addr,
            dest = %target,
            rule_type = hit.rule_type,
            rule = %hit.pattern,
            "egress denied"
        );
        bail!("destination denied");
    }

    let guard = state.registry.register(&username, src_ip, &target);

    let upstream = match timeout(DIAL_TIMEOUT, state.plan.connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            write_http_error(&mut stream, 502, "Bad Gateway", false).await?;
            warn!(client = %client_addr, dest = %target, error = %e, "outbound dial failed");
            return Ok(());
        }
        Err(_) => {
            write_http_error(&mut stream, 502, "Bad Gateway", false).await?;
            warn!(client = %client_addr, dest = %target, "outbound dial timed out");
            return Ok(());
        }
    };

    stream
        .write_all(
            format!("HTTP/1.1 200 Connection Established\r\nProxy-Agent: {PROXY_AGENT}\r\n\r\n")
                .as_bytes(),
        )
        .await?;

    info!(
        conn_id = guard.id(),
        user = %username,
        client = %client_addr,
        dest = %target,
        "tunnel established"
    );

    let (tx, rx) = relay(stream, upstream, state.idle_timeout).await;

    debug!(conn_id = guard.id(), tx_bytes = tx, rx_bytes = rx, "tunnel closed");
    Ok(())
}

/// Read `CONNECT host:port HTTP/1.{0,1}` and the header block. The
/// buffered reader is dropped here; the tunnel uses the raw stream.
async fn read_connect_request(
    stream: &mut TcpStream,
) -> Result<(String, Vec<(String, String)>)> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let parts: Vec<&str> = request_line.trim().split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "CONNECT" {
        bail!("not CONNECT");
    }
    if parts[2] != "HTTP/1.1" && parts[2] != "HTTP/1.0" {
        bail!("unsupported HTTP version");
    }
    let target = parts[1].to_string();
    if split_host_port(&target).is_err() {
        bail!("bad CONNECT target");
    }

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            bail!("unexpected EOF in header block");
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    Ok((target, headers))
}

/// Returns the authenticated username, or `None` after the error response
/// has been written.
async fn authenticate(
    stream: &mut TcpStream,
    headers: &[(String, String)],
    state: &Arc<ServerState>,
) -> Result<Option<String>> {
    let credentials = headers
        .iter()
        .find(|(name, _)| name == "proxy-authorization")
        .and_then(|(_, value)| parse_basic_proxy_auth(value));

    let Some((user, pass)) = credentials else {
        write_http_error(stream, 407, "Proxy Authentication Required", true).await?;
        return Ok(None);
    };

    if !state.store.verify(&user, &pass) {
        write_http_error(stream, 407, "Proxy Authentication Required", true).await?;
        warn!(user = %user, "bad proxy credentials");
        return Ok(None);
    }

    match state.store.is_active(&user) {
        Ok(true) => Ok(Some(user)),
        Ok(false) => {
            write_http_error(stream, 403, "Forbidden", false).await?;
            warn!(user = %user, "inactive user rejected");
            Ok(None)
        }
        Err(e) => {
            warn!(user = %user, error = %e, "active check failed");
            Ok(None)
        }
    }
}

fn parse_basic_proxy_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let creds = String::from_utf8(decoded).ok()?;
    let (user, pass) = creds.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn write_http_error(
    stream: &mut TcpStream,
    code: u16,
    message: &str,
    challenge: bool,
) -> Result<()> {
    let mut response = format!("HTTP/1.1 {code} {message}\r\n");
    if challenge {
        response.push_str("Proxy-Authenticate: Basic realm=\"ProxyChan\"\r\n");
    }
    response.push_str(&format!(
        "Content-Length: 0\r\nProxy-Agent: {PROXY_AGENT}\r\n\r\n"
    ));
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
