//! Live policy reload: store mutations become visible to a running proxy
//! within the poll bound, without touching established sessions.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{spawn_echo, start_socks_proxy};

#[tokio::test]
async fn denylist_mutation_applies_to_new_sessions() {
    let echo = spawn_echo().await;
    let proxy = start_socks_proxy(false, |_| {}).await;

    // Establish a tunnel before the rule lands.
    let mut established = TcpStream::connect(proxy.addr).await.unwrap();
    established.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    established.read_exact(&mut resp).await.unwrap();
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    established.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    established.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    // Admin blocks the suffix; the poller must pick it up within ~1s.
    proxy.store.block_dest(".evil.test").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut denied = TcpStream::connect(proxy.addr).await.unwrap();
    denied.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    denied.read_exact(&mut resp).await.unwrap();
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 14];
    request.extend_from_slice(b"host.evil.test");
    request.extend_from_slice(&443u16.to_be_bytes());
    denied.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    denied.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x02);

    // The pre-existing tunnel keeps flowing.
    established.write_all(b"still-alive").await.unwrap();
    let mut buf = [0u8; 11];
    established.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still-alive");
}

#[tokio::test]
async fn allowlist_mutation_applies_to_new_sessions() {
    let echo = spawn_echo().await;
    let proxy = start_socks_proxy(false, |_| {}).await;

    // Establish a tunnel while localhost is still allowed.
    let mut established = TcpStream::connect(proxy.addr).await.unwrap();
    established.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    established.read_exact(&mut resp).await.unwrap();
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    established.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    established.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    // Remove the seeded IPv4 localhost entry outright.
    proxy.store.delete_allowed_ip("127.0.0.1/32").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // A fresh connection is dropped before any protocol bytes.
    let mut rejected = TcpStream::connect(proxy.addr).await.unwrap();
    rejected.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut tail = [0u8; 1];
    assert_eq!(rejected.read(&mut tail).await.unwrap_or(0), 0);

    // The established session survives the reload.
    established.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    established.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // Re-allowing restores admission.
    proxy.store.allow_ip("127.0.0.1").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut readmitted = TcpStream::connect(proxy.addr).await.unwrap();
    readmitted.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    readmitted.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x00]);
}
