//! `host:port` splitting shared by the front-ends and the dialers.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid host:port {0:?}")]
pub struct InvalidHostPort(pub String);

/// Split a `host:port` string, handling bracketed IPv6 like `[::1]:443`.
pub fn split_host_port(target: &str) -> Result<(&str, u16), InvalidHostPort> {
    if let Some(rest) = target.strip_prefix('[') {
        // IPv6
        if let Some((host, port_part)) = rest.split_once(']') {
            if let Some(port_str) = port_part.strip_prefix(':') {
                let port = port_str
                    .parse()
                    .map_err(|_| InvalidHostPort(target.to_string()))?;
                return Ok((host, port));
            }
        }
        return Err(InvalidHostPort(target.to_string()));
    }

    // Regular host:port
    let (host, port_str) = target
        .rsplit_once(':')
        .ok_or_else(|| InvalidHostPort(target.to_string()))?;
    if host.is_empty() || host.contains(':') {
        // Unbracketed IPv6 is ambiguous
        return Err(InvalidHostPort(target.to_string()));
    }

    let port = port_str
        .parse()
        .map_err(|_| InvalidHostPort(target.to_string()))?;
    Ok((host, port))
}

/// Render a `host:port` address, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
