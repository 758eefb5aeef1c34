//! Tor SOCKS5 egress
//!
//! Connects to a local Tor SOCKS endpoint and issues a single CONNECT to
//! the final target. Tor resolves domain targets itself.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::socks5;
use crate::util::split_host_port;

use super::DialError;

pub struct TorDialer {
    proxy_addr: String,
    connect_timeout: Duration,
}

impl TorDialer {
    pub fn new(proxy_addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            connect_timeout,
        }
    }

    pub async fn connect(&self, target: &str) -> Result<TcpStream, DialError> {
        let (host, port) =
            split_host_port(target).map_err(|_| DialError::BadAddress(target.to_string()))?;

        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(&self.proxy_addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(DialError::Connect {
                    addr: self.proxy_addr.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(DialError::Timeout {
                    addr: self.proxy_addr.clone(),
                })
            }
        };

        // Failure drops (and closes) the stream.
        socks5::connect_over_stream(&mut stream, host, port)
            .await
            .map_err(|source| DialError::Proxy {
                addr: self.proxy_addr.clone(),
                source,
            })?;

        Ok(stream)
    }
}
