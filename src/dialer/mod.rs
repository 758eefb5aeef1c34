//! Outbound dialers
//!
//! A dial plan composes a base egress (direct TCP or a Tor SOCKS5
//! endpoint) with an optional ordered chain of SOCKS5 hops. Plans are
//! immutable after construction and shared across all accept tasks.

mod chain;
mod direct;
mod tor;

pub use chain::{load_chain_config, ChainConfig, ChainConfigError, ChainHop};
pub use direct::DirectDialer;
pub use tor::TorDialer;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::socks5::{self, Socks5Error};
use crate::util::split_host_port;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect {addr}: timed out")]
    Timeout { addr: String },
    #[error("invalid target address {0:?}")]
    BadAddress(String),
    #[error("socks5 negotiation with {addr}: {source}")]
    Proxy {
        addr: String,
        #[source]
        source: Socks5Error,
    },
}

/// Base egress selection.
pub enum BaseDialer {
    Direct(DirectDialer),
    Tor(TorDialer),
}

impl BaseDialer {
    pub async fn connect(&self, target: &str) -> Result<TcpStream, DialError> {
        match self {
            BaseDialer::Direct(d) => d.connect(target).await,
            BaseDialer::Tor(d) => d.connect(target).await,
        }
    }
}

/// A base dialer plus an ordered, possibly empty hop list.
pub struct DialPlan {
    base: BaseDialer,
    hops: Vec<ChainHop>,
}

impl DialPlan {
    pub fn new(base: BaseDialer) -> Self {
        Self {
            base,
            hops: Vec::new(),
        }
    }

    pub fn chained(base: BaseDialer, hops: Vec<ChainHop>) -> Result<Self, ChainConfigError> {
        if hops.is_empty() {
            return Err(ChainConfigError::EmptyChain);
        }
        Ok(Self { base, hops })
    }

    /// Open an outbound stream bound to `target` (`host:port`).
    ///
    /// With hops, the first hop is reached via the base dialer and every
    /// subsequent hop (and finally the target) is nested with a SOCKS5
    /// CONNECT over the same stream. Any failure drops the stream; there
    /// is no retry. The caller's dial timeout bounds the whole setup.
    pub async fn connect(&self, target: &str) -> Result<TcpStream, DialError> {
        // No chain: behave exactly as the base dialer.
        if self.hops.is_empty() {
            return self.base.connect(target).await;
        }

        let mut stream = self.base.connect(&self.hops[0].addr).await?;

        for hop in &self.hops[1..] {
            connect_hop(&mut stream, &hop.addr).await?;
        }
        connect_hop(&mut stream, target).await?;

        Ok(stream)
    }
}

async fn connect_hop(stream: &mut TcpStream, addr: &str) -> Result<(), DialError> {
    let (host, port) =
        split_host_port(addr).map_err(|_| DialError::BadAddress(addr.to_string()))?;
    socks5::connect_over_stream(stream, host, port)
        .await
        .map_err(|source| DialError::Proxy {
            addr: addr.to_string(),
            source,
        })
}
