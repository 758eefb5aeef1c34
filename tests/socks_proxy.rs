//! End-to-end SOCKS5 sessions against a live proxy instance.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{spawn_echo, start_socks_proxy, wait_for};

/// Greeting, method selection and CONNECT to an IPv4 target.
async fn connect_no_auth(proxy: std::net::SocketAddr, target: std::net::SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    let std::net::IpAddr::V4(ip) = target.ip() else {
        panic!("expected IPv4 echo addr");
    };
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..], &[0, 0, 0, 0, 0, 0]);

    client
}

#[tokio::test]
async fn happy_path_no_auth_direct() {
    let echo = spawn_echo().await;
    let proxy = start_socks_proxy(false, |_| {}).await;

    let mut client = connect_no_auth(proxy.addr, echo).await;

    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping");

    // Exactly one registered connection while the tunnel lives.
    assert_eq!(proxy.registry.len(), 1);
    let snapshot = proxy.registry.snapshot();
    assert_eq!(snapshot[0].username, "");
    assert_eq!(snapshot[0].source_ip, "127.0.0.1");

    drop(client);
    assert!(
        wait_for(Duration::from_secs(3), || proxy.registry.is_empty()).await,
        "registry entry must be released after the tunnel ends"
    );
}

#[tokio::test]
async fn userpass_rejected_leaves_no_registration() {
    let proxy = start_socks_proxy(true, |store| {
        store.add_user("alice", "pw").unwrap();
    })
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x02]);

    client.write_all(&[0x01, 5]).await.unwrap();
    client.write_all(b"alice").await.unwrap();
    client.write_all(&[3]).await.unwrap();
    client.write_all(b"bad").await.unwrap();

    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0x01]);

    // Server closes; nothing was registered.
    let mut tail = [0u8; 1];
    assert_eq!(client.read(&mut tail).await.unwrap(), 0);
    assert!(proxy.registry.is_empty());
}

#[tokio::test]
async fn valid_credentials_reach_the_target() {
    let echo = spawn_echo().await;
    let proxy = start_socks_proxy(true, |store| {
        store.add_user("alice", "pw").unwrap();
    })
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x02]);

    client.write_all(&[0x01, 5]).await.unwrap();
    client.write_all(b"alice").await.unwrap();
    client.write_all(&[2]).await.unwrap();
    client.write_all(b"pw").await.unwrap();
    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    let snapshot = proxy.registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].username, "alice");
}

#[tokio::test]
async fn inactive_user_refused_after_valid_credentials() {
    let proxy = start_socks_proxy(true, |store| {
        store.add_user("alice", "pw").unwrap();
        store.set_active("alice", false).unwrap();
    })
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();

    client.write_all(&[0x01, 5]).await.unwrap();
    client.write_all(b"alice").await.unwrap();
    client.write_all(&[2]).await.unwrap();
    client.write_all(b"pw").await.unwrap();
    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    // Credentials verify, but the active flag gates the session.
    assert_eq!(status, [0x01, 0x00]);

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x05);
    assert!(proxy.registry.is_empty());
}

#[tokio::test]
async fn destination_denied_by_suffix() {
    let proxy = start_socks_proxy(false, |store| {
        store.block_dest(".evil.test").unwrap();
    })
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 14];
    request.extend_from_slice(b"host.evil.test");
    request.extend_from_slice(&443u16.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, &[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    assert!(proxy.registry.is_empty());
}

#[tokio::test]
async fn bind_command_gets_command_not_supported() {
    let proxy = start_socks_proxy(false, |_| {}).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();

    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07);
}

#[tokio::test]
async fn zero_methods_refused() {
    let proxy = start_socks_proxy(false, |_| {}).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(&[0x05, 0x00]).await.unwrap();

    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0xFF]);

    let mut tail = [0u8; 1];
    assert_eq!(client.read(&mut tail).await.unwrap(), 0);
}

#[tokio::test]
async fn dial_failure_replies_connection_refused() {
    let proxy = start_socks_proxy(false, |_| {}).await;

    // Bind a port and close the listener so the dial is refused.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&dead_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x05);

    assert!(
        wait_for(Duration::from_secs(3), || proxy.registry.is_empty()).await,
        "failed dial must release its registration"
    );
}
