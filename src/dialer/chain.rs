//! Chain configuration
//!
//! A YAML document with a single top-level `chain` key holding an ordered
//! list of SOCKS5 hops. An empty list, a missing addr, or a non-socks5
//! type is a hard error at load.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::util::split_host_port;

#[derive(Debug, Error)]
pub enum ChainConfigError {
    #[error("read chain config: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse chain config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("chain config: empty chain")]
    EmptyChain,
    #[error("chain hop {index}: unsupported type {kind:?}")]
    UnsupportedHopType { index: usize, kind: String },
    #[error("chain hop {index}: invalid addr {addr:?}")]
    InvalidAddr { index: usize, addr: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainHop {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Deserialize)]
pub struct ChainConfig {
    pub chain: Vec<ChainHop>,
}

/// Load and validate a chain config file.
pub fn load_chain_config(path: &Path) -> Result<ChainConfig, ChainConfigError> {
    let data = std::fs::read_to_string(path)?;
    parse_chain_config(&data)
}

fn parse_chain_config(data: &str) -> Result<ChainConfig, ChainConfigError> {
    let config: ChainConfig = serde_yaml::from_str(data)?;

    if config.chain.is_empty() {
        return Err(ChainConfigError::EmptyChain);
    }

    for (index, hop) in config.chain.iter().enumerate() {
        if hop.kind != "socks5" {
            return Err(ChainConfigError::UnsupportedHopType {
                index,
                kind: hop.kind.clone(),
            });
        }
        if split_host_port(&hop.addr).is_err() {
            return Err(ChainConfigError::InvalidAddr {
                index,
                addr: hop.addr.clone(),
            });
        }
    }

    Ok(config)
}
