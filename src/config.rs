//! Run configuration
//!
//! Flags for the `run` subcommand, their validation, and the derivation of
//! the auth requirement from the bind address.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::dialer::load_chain_config;
use crate::error::CliError;
use crate::util::split_host_port;

const DEFAULT_TOR_SOCKS: &str = "127.0.0.1:9050";

/// Base egress selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Direct,
    Tor,
}

/// Flags for `proxychan run`.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Listen address for the SOCKS5 proxy
    #[arg(long, default_value = "127.0.0.1:1080")]
    pub listen: String,

    /// Listen address for the HTTP CONNECT proxy (off when empty)
    #[arg(long, default_value = "")]
    pub http_listen: String,

    /// Egress mode
    #[arg(long, value_enum, default_value_t = Mode::Direct)]
    pub mode: Mode,

    /// Tor SOCKS5 address (mode=tor only)
    #[arg(long, default_value = DEFAULT_TOR_SOCKS)]
    pub tor_socks: String,

    /// Outbound connect timeout
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub connect_timeout: Duration,

    /// Idle timeout for tunnels (0 disables)
    #[arg(long, value_parser = parse_duration, default_value = "2m")]
    pub idle_timeout: Duration,

    /// Disable username/password authentication (the source allowlist is
    /// still enforced)
    #[arg(long)]
    pub no_auth: bool,

    /// Enable SOCKS5 hop chaining from a YAML config
    #[arg(long)]
    pub dynamic_chain: bool,

    /// Path to the YAML chain config (required with --dynamic-chain)
    #[arg(long, default_value = "")]
    pub chain_config: String,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

impl RunArgs {
    /// Reject invalid flag combinations before any resource is touched.
    pub fn validate(&self) -> Result<(), CliError> {
        if self.dynamic_chain {
            if self.chain_config.is_empty() {
                return Err(CliError::Usage(
                    "--chain-config is required when --dynamic-chain is enabled".to_string(),
                ));
            }
            load_chain_config(&PathBuf::from(&self.chain_config))?;
        }

        if self.mode != Mode::Tor && self.tor_socks != DEFAULT_TOR_SOCKS {
            return Err(CliError::Usage(
                "--tor-socks can only be used with --mode tor".to_string(),
            ));
        }

        let Ok((host, _)) = split_host_port(&self.listen) else {
            return Err(CliError::Usage(format!(
                "invalid listen address {:?}",
                self.listen
            )));
        };
        if self.no_auth && is_loopback_host(host) {
            return Err(CliError::Usage(
                "--no-auth is unnecessary when binding to localhost".to_string(),
            ));
        }

        Ok(())
    }

    /// Loopback binds never require credentials; any other bind does
    /// unless --no-auth says otherwise.
    pub fn require_auth(&self) -> bool {
        match split_host_port(&self.listen) {
            Ok((host, _)) if is_loopback_host(host) => false,
            _ => !self.no_auth,
        }
    }
}

fn is_loopback_host(host: &str) -> bool {
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}
