//! SOCKS5 front-end
//!
//! Per connection: source check, handshake + auth, request, destination
//! check, registration, outbound dial, reply, tunnel. Step order is
//! strict; any failure terminates the session after the appropriate wire
//! reply.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::socks5::{self, Request};

use super::{relay, ServerState, DIAL_TIMEOUT, HANDSHAKE_TIMEOUT};

/// SOCKS5 proxy listener
pub struct SocksServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl SocksServer {
    pub async fn bind(addr: &str, state: Arc<ServerState>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind SOCKS5 proxy to {addr}"))?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("listener has a local addr")
    }

    /// Accept loop. Exits on shutdown; open tunnels finish in place.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(bind = %self.local_addr(), "SOCKS5 proxy listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            debug!(client = %client_addr, "New SOCKS5 connection");
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_socks_client(stream, client_addr, state).await {
                                    debug!(error = %e, client = %client_addr, "SOCKS5 session error");
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
                        info!("SOCKS5 listener stopped");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Handle a single SOCKS5 session.
async fn handle_socks_client(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let src_ip = client_addr.ip();

    // No handshake has happened yet, so a source rejection closes silently.
    if !state.source_policy.is_allowed(src_ip) {
        warn!(client = %client_addr, "connection blocked by source allowlist");
        return Ok(());
    }

    let setup = timeout(
        HANDSHAKE_TIMEOUT,
        session_setup(&mut stream, client_addr, &state),
    )
    .await;

    let (username, request) = match setup {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!(client = %client_addr, "handshake deadline exceeded");
            return Ok(());
        }
    };

    let address = request.address();

    // Committed to dialing: track the connection. The guard deregisters on
    // every exit path below.
    let guard = state.registry.register(&username, src_ip, &address);

    let upstream = match timeout(DIAL_TIMEOUT, state.plan.connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = socks5::write_reply(&mut stream, socks5::REP_CONN_REFUSED).await;
            warn!(client = %client_addr, dest = %address, error = %e, "outbound dial failed");
            return Ok(());
        }
        Err(_) => {
            let _ = socks5::write_reply(&mut stream, socks5::REP_CONN_REFUSED).await;
            warn!(client = %client_addr, dest = %address, "outbound dial timed out");
            return Ok(());
        }
    };

    socks5::write_reply(&mut stream, socks5::REP_SUCCESS).await?;

    info!(
        conn_id = guard.id(),
        user = %username,
        client = %client_addr,
        dest = %address,
        "tunnel established"
    );

    let (tx, rx) = relay(stream, upstream, state.idle_timeout).await;

    debug!(conn_id = guard.id(), tx_bytes = tx, rx_bytes = rx, "tunnel closed");
    Ok(())
}

/// Handshake, active-user gate, request read and destination check, all
/// under the caller's handshake deadline.
async fn session_setup(
    stream: &mut TcpStream,
    client_addr: SocketAddr,
    state: &Arc<ServerState>,
) -> Result<(String, Request)> {
    let require_auth = state.require_auth;
    let store = state.store.clone();

    let username = match socks5::handshake(stream, require_auth, move |user, pass| async move {
        if require_auth {
            store.verify(&user, &pass)
        } else {
            // Auth disabled: accept whatever the client insists on
            // offering, but keep the name for the registry.
            true
        }
    })
    .await
    {
        Ok(user) => user.unwrap_or_default(),
        Err(e) => {
            warn!(client = %client_addr, error = %e, "handshake failed");
            bail!("handshake failed: {e}");
        }
    };

    if require_auth {
        match state.store.is_active(&username) {
            Ok(true) => {}
            Ok(false) => {
                let _ = socks5::write_reply(stream, socks5::REP_CONN_REFUSED).await;
                warn!(client = %client_addr, user = %username, "inactive user rejected");
                bail!("user inactive");
            }
            Err(e) => {
                warn!(client = %client_addr, user = %username, error = %e, "active check failed");
                bail!("active check failed: {e}");
            }
        }
    }

    let request = match socks5::read_request(stream).await {
        Ok(req) => req,
        Err(e) => {
            let _ = socks5::write_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await;
            warn!(client = %client_addr, error = %e, "request rejected");
            bail!("request rejected: {e}");
        }
    };

    if let Some(hit) = state.dest_policy.decide(&request.host) {
        let _ = socks5::write_reply(stream, socks5::REP_CONN_NOT_ALLOWED).await;
        warn!(
            user = %username,
            client = %client_addr,
            dest = %request.address(),
            rule_type = hit.rule_type,
            rule = %hit.pattern,
            "egress denied"
        );
        bail!("destination denied");
    }

    Ok((username, request))
}
