//! Bidirectional tunnel
//!
//! Two copy directions over the split halves of both streams, sharing one
//! idle deadline. Traffic in either direction pushes the deadline forward;
//! expiry surfaces as a read timeout and tears the tunnel down the same
//! way a read error would. EOF and read errors half-close the peer's write
//! side so it observes orderly EOF.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Shuttle bytes between the two streams until both directions finish.
/// Returns (client-to-upstream, upstream-to-client) byte counts.
pub async fn relay(client: TcpStream, upstream: TcpStream, idle_timeout: Duration) -> (u64, u64) {
    let idle = (idle_timeout > Duration::ZERO).then_some(idle_timeout);
    // Unused when idle is disabled; no deadline is ever armed then.
    let deadline = Arc::new(Mutex::new(
        Instant::now() + idle.unwrap_or(Duration::from_secs(0)),
    ));

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let tx = copy_with_idle(client_read, upstream_write, deadline.clone(), idle);
    let rx = copy_with_idle(upstream_read, client_write, deadline, idle);

    tokio::join!(tx, rx)
}

async fn copy_with_idle(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    deadline: Arc<Mutex<Instant>>,
    idle: Option<Duration>,
) -> u64 {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total: u64 = 0;

    loop {
        let read = match idle {
            Some(_) => loop {
                let current = *deadline.lock();
                match timeout_at(current, src.read(&mut buf)).await {
                    Ok(result) => break result,
                    Err(_) => {
                        // The peer direction may have pushed the deadline
                        // forward while we were parked on the old one.
                        if *deadline.lock() > Instant::now() {
                            continue;
                        }
                        break Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "tunnel idle timeout",
                        ));
                    }
                }
            },
            None => src.read(&mut buf).await,
        };

        match read {
            Ok(0) => {
                // EOF: propagate by closing only our peer's write side.
                let _ = dst.shutdown().await;
                return total;
            }
            Ok(n) => {
                if let Some(idle) = idle {
                    *deadline.lock() = Instant::now() + idle;
                }
                if dst.write_all(&buf[..n]).await.is_err() {
                    return total;
                }
                total += n as u64;
            }
            Err(_) => {
                let _ = dst.shutdown().await;
                return total;
            }
        }
    }
}
