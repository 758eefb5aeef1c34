//! Deny-rule classification and pattern normalization.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::StoreError;

/// Destination deny rule categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyKind {
    Ip,
    Cidr,
    DomainExact,
    DomainSuffix,
}

impl DenyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyKind::Ip => "ip",
            DenyKind::Cidr => "cidr",
            DenyKind::DomainExact => "domain_exact",
            DenyKind::DomainSuffix => "domain_suffix",
        }
    }
}

/// A destination deny rule as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenyRule {
    pub pattern: String,
    pub kind: DenyKind,
    pub enabled: bool,
}

/// DNS is case-insensitive; tolerate one trailing dot.
pub fn normalize_domain(domain: &str) -> Result<String, StoreError> {
    let d = domain.trim().to_lowercase();
    let d = d.strip_suffix('.').unwrap_or(&d);
    if d.is_empty() {
        return Err(StoreError::InvalidPattern(domain.to_string()));
    }
    Ok(d.to_string())
}

/// Classify a user-supplied pattern and normalize it to its stored form:
/// bare IPs to their canonical string, CIDRs with host bits truncated,
/// domains lowercased, suffixes with a leading dot.
pub fn classify_pattern(input: &str) -> Result<(String, DenyKind), StoreError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(StoreError::InvalidPattern(input.to_string()));
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok((ip.to_string(), DenyKind::Ip));
    }

    if input.contains('/') {
        if let Ok(net) = input.parse::<IpNet>() {
            return Ok((net.trunc().to_string(), DenyKind::Cidr));
        }
        // Not a CIDR; domains with slashes are unsupported anyway.
    }

    if let Some(rest) = input.strip_prefix('.') {
        let d = normalize_domain(rest)?;
        return Ok((format!(".{d}"), DenyKind::DomainSuffix));
    }

    let d = normalize_domain(input)?;
    Ok((d, DenyKind::DomainExact))
}

/// Normalize an allowlist entry: bare IPs become `/32` or `/128`.
pub fn normalize_cidr(input: &str) -> Result<String, StoreError> {
    let input = input.trim();

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(match ip {
            IpAddr::V4(_) => format!("{ip}/32"),
            IpAddr::V6(_) => format!("{ip}/128"),
        });
    }

    input
        .parse::<IpNet>()
        .map(|_| input.to_string())
        .map_err(|_| StoreError::InvalidPattern(input.to_string()))
}
