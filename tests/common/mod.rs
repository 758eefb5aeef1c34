//! Shared test harness: a real proxy instance on ephemeral loopback ports.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use proxychan::connection::ConnectionRegistry;
use proxychan::dialer::{BaseDialer, DialPlan, DirectDialer};
use proxychan::policy::{DestPolicy, SourcePolicy};
use proxychan::server::{HttpServer, ServerState, SocksServer};
use proxychan::store::FileStore;

pub struct TestProxy {
    pub addr: SocketAddr,
    pub store: Arc<FileStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: watch::Sender<bool>,
    _dir: TempDir,
}

/// Build shared state over a fresh store. The store seeds localhost into
/// the allowlist, so loopback test clients are admitted by default.
fn build_state(
    dir: &TempDir,
    require_auth: bool,
    plan: DialPlan,
    setup: impl FnOnce(&FileStore),
) -> (Arc<ServerState>, Arc<FileStore>, Arc<ConnectionRegistry>) {
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    setup(&store);

    let source_policy = Arc::new(SourcePolicy::from_store(&store).unwrap());
    let dest_policy = Arc::new(DestPolicy::from_store(&store).unwrap());
    let registry = ConnectionRegistry::new();

    let state = Arc::new(ServerState {
        plan,
        store: store.clone(),
        source_policy: source_policy.clone(),
        dest_policy: dest_policy.clone(),
        registry: registry.clone(),
        require_auth,
        idle_timeout: Duration::from_secs(60),
    });

    (state, store, registry)
}

fn direct_plan() -> DialPlan {
    DialPlan::new(BaseDialer::Direct(DirectDialer::new(Duration::from_secs(5))))
}

/// Start a SOCKS5 proxy with pollers running, using a direct dial plan.
pub async fn start_socks_proxy(require_auth: bool, setup: impl FnOnce(&FileStore)) -> TestProxy {
    let dir = TempDir::new().unwrap();
    let (state, store, registry) = build_state(&dir, require_auth, direct_plan(), setup);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(
        state
            .source_policy
            .clone()
            .run_poller(store.clone(), shutdown_rx.clone()),
    );
    tokio::spawn(
        state
            .dest_policy
            .clone()
            .run_poller(store.clone(), shutdown_rx.clone()),
    );

    let server = SocksServer::bind("127.0.0.1:0", state).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run(shutdown_rx));

    TestProxy {
        addr,
        store,
        registry,
        shutdown: shutdown_tx,
        _dir: dir,
    }
}

/// Start an HTTP CONNECT proxy, no pollers.
pub async fn start_http_proxy(require_auth: bool, setup: impl FnOnce(&FileStore)) -> TestProxy {
    let dir = TempDir::new().unwrap();
    let (state, store, registry) = build_state(&dir, require_auth, direct_plan(), setup);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = HttpServer::bind("127.0.0.1:0", state).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run(shutdown_rx));

    TestProxy {
        addr,
        store,
        registry,
        shutdown: shutdown_tx,
        _dir: dir,
    }
}

/// One-shot echo server on an ephemeral port.
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Wait until `cond` holds, up to `max`.
pub async fn wait_for(max: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + max;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}
