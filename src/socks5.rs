//! SOCKS5 wire codec
//!
//! Implements the RFC 1928 subset this proxy speaks (CONNECT only, NO-AUTH
//! and USERNAME/PASSWORD methods) plus the RFC 1929 sub-negotiation, both
//! the inbound server side and the outbound CONNECT-over-stream used to
//! nest hops.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::BufMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::host_port::join_host_port;

/// SOCKS5 version
pub const VERSION: u8 = 0x05;

/// Authentication methods
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_USERPASS: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// RFC 1929 sub-negotiation
pub const USERPASS_VERSION: u8 = 0x01;
pub const USERPASS_SUCCESS: u8 = 0x00;
pub const USERPASS_FAILURE: u8 = 0x01;

/// Commands
pub const CMD_CONNECT: u8 = 0x01;

/// Address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONN_NOT_ALLOWED: u8 = 0x02;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

/// Protocol-level failures. None of these are retryable.
#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("no acceptable auth method")]
    NoAcceptableMethod,
    #[error("authentication failed")]
    AuthFailed,
    #[error("bad auth sub-negotiation version {0:#04x}")]
    BadAuthVersion(u8),
    #[error("empty username")]
    EmptyUsername,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("unknown ATYP {0:#04x}")]
    UnknownAtyp(u8),
    #[error("empty domain")]
    EmptyDomain,
    #[error("domain of {0} bytes is too long")]
    DomainTooLong(usize),
    #[error("domain is not valid UTF-8")]
    InvalidDomain,
    #[error("upstream rejected auth method {0:#04x}")]
    MethodRejected(u8),
    #[error("upstream CONNECT failed, REP={0:#04x}")]
    ConnectFailed(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A parsed CONNECT request.
#[derive(Debug, Clone)]
pub struct Request {
    /// IPv4/IPv6 literal or DNS name
    pub host: String,
    pub port: u16,
}

impl Request {
    /// The requested target as `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

/// Server-side greeting, method negotiation and optional RFC 1929
/// sub-negotiation.
///
/// Method selection: USER/PASS when auth is required and offered, NO-AUTH
/// when offered, otherwise USER/PASS if that is all the client speaks.
/// Anything else gets `(0x05, 0xFF)` and the session ends.
///
/// The injected verifier decides the sub-negotiation outcome; exactly one
/// `(0x01, STATUS)` pair is written per sub-negotiation. Returns the
/// authenticated username, or `None` for NO-AUTH sessions.
pub async fn handshake<S, V, Fut>(
    stream: &mut S,
    require_auth: bool,
    verify: V,
) -> Result<Option<String>, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    V: FnOnce(String, String) -> Fut,
    Fut: Future<Output = bool>,
{
    // Client greeting: VER, NMETHODS, METHODS...
    let mut hdr = [0u8; 2];
    stream.read_exact(&mut hdr).await?;
    if hdr[0] != VERSION {
        return Err(Socks5Error::UnsupportedVersion(hdr[0]));
    }

    let nmethods = hdr[1] as usize;
    if nmethods == 0 {
        stream.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableMethod);
    }
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    let offers_none = methods.contains(&AUTH_NONE);
    let offers_userpass = methods.contains(&AUTH_USERPASS);

    let selected = if require_auth && offers_userpass {
        AUTH_USERPASS
    } else if offers_none {
        AUTH_NONE
    } else if offers_userpass {
        AUTH_USERPASS
    } else {
        AUTH_NO_ACCEPTABLE
    };

    // Server method selection: VER, METHOD
    stream.write_all(&[VERSION, selected]).await?;
    if selected == AUTH_NO_ACCEPTABLE {
        return Err(Socks5Error::NoAcceptableMethod);
    }
    if selected == AUTH_NONE {
        return Ok(None);
    }

    let (username, password) = read_userpass(stream).await?;
    let ok = verify(username.clone(), password).await;
    let status = if ok { USERPASS_SUCCESS } else { USERPASS_FAILURE };
    stream.write_all(&[USERPASS_VERSION, status]).await?;
    if !ok {
        return Err(Socks5Error::AuthFailed);
    }

    Ok(Some(username))
}

/// RFC 1929: VER=1, ULEN, UNAME, PLEN, PASSWD. ULEN must be > 0.
async fn read_userpass<S>(stream: &mut S) -> Result<(String, String), Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;
    if ver[0] != USERPASS_VERSION {
        return Err(Socks5Error::BadAuthVersion(ver[0]));
    }

    let mut ulen = [0u8; 1];
    stream.read_exact(&mut ulen).await?;
    if ulen[0] == 0 {
        return Err(Socks5Error::EmptyUsername);
    }
    let mut uname = vec![0u8; ulen[0] as usize];
    stream.read_exact(&mut uname).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut passwd = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut passwd).await?;

    Ok((
        String::from_utf8_lossy(&uname).into_owned(),
        String::from_utf8_lossy(&passwd).into_owned(),
    ))
}

/// Parse a SOCKS5 CONNECT request (CMD=0x01).
pub async fn read_request<S>(stream: &mut S) -> Result<Request, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    // VER CMD RSV ATYP
    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr).await?;
    if hdr[0] != VERSION {
        return Err(Socks5Error::UnsupportedVersion(hdr[0]));
    }
    if hdr[1] != CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(hdr[1]));
    }

    let host = read_addr(stream, hdr[3]).await?;

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok(Request { host, port })
}

async fn read_addr<S>(stream: &mut S, atyp: u8) -> Result<String, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ok(Ipv4Addr::from(octets).to_string())
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ok(Ipv6Addr::from(octets).to_string())
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(Socks5Error::EmptyDomain);
            }
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| Socks5Error::InvalidDomain)
        }
        other => Err(Socks5Error::UnknownAtyp(other)),
    }
}

/// Write a SOCKS5 reply with ATYP=IPv4 and a zero bind address.
pub async fn write_reply<S>(stream: &mut S, rep: u8) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    // VER REP RSV ATYP BND.ADDR BND.PORT
    stream
        .write_all(&[VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Perform a NO-AUTH greeting and a CONNECT to `host:port` over an
/// already-established stream. Used to nest chain hops and by the Tor
/// egress dialer.
pub async fn connect_over_stream<S>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER=5, NMETHODS=1, METHODS={no-auth}
    stream.write_all(&[VERSION, 1, AUTH_NONE]).await?;

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await?;
    if resp[0] != VERSION {
        return Err(Socks5Error::UnsupportedVersion(resp[0]));
    }
    if resp[1] != AUTH_NONE {
        return Err(Socks5Error::MethodRejected(resp[1]));
    }

    let req = build_connect_request(host, port)?;
    stream.write_all(&req).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr).await?;
    if hdr[0] != VERSION {
        return Err(Socks5Error::UnsupportedVersion(hdr[0]));
    }
    if hdr[1] != REP_SUCCESS {
        return Err(Socks5Error::ConnectFailed(hdr[1]));
    }

    drain_bind(stream, hdr[3]).await
}

/// Build a CONNECT request frame. The ATYP follows the address form of
/// `host`; domains are limited to 255 bytes by the length octet.
fn build_connect_request(host: &str, port: u16) -> Result<Vec<u8>, Socks5Error> {
    let mut req = Vec::with_capacity(6 + host.len());
    req.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00]);

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.is_empty() {
                return Err(Socks5Error::EmptyDomain);
            }
            if host.len() > 255 {
                return Err(Socks5Error::DomainTooLong(host.len()));
            }
            req.push(ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }

    req.put_u16(port);
    Ok(req)
}

/// Discard the BND.ADDR/BND.PORT fields of an upstream reply.
async fn drain_bind<S>(stream: &mut S, atyp: u8) -> Result<(), Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let len = match atyp {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut l = [0u8; 1];
            stream.read_exact(&mut l).await?;
            l[0] as usize + 2
        }
        other => return Err(Socks5Error::UnknownAtyp(other)),
    };

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(())
}
