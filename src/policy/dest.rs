//! Destination denylist
//!
//! Denies requested targets by IP/CIDR containment, exact domain, or
//! domain suffix. IP and CIDR rules collapse into one network list at
//! build time; suffixes keep their stored order.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::store::{DenyKind, DenyRule, FileStore, StoreError};

use super::POLL_INTERVAL;

/// A matched deny rule, for logging and the SOCKS/HTTP refusal path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyMatch {
    pub rule_type: &'static str,
    pub pattern: String,
}

/// Immutable decision snapshot.
#[derive(Debug, Default)]
pub struct DestRuntime {
    pub version: u64,
    networks: Vec<IpNet>,
    exact: HashSet<String>,
    /// each stored like ".example.com"
    suffixes: Vec<String>,
}

impl DestRuntime {
    /// Classify stored rules into the decision structures.
    pub fn build(version: u64, rules: &[DenyRule]) -> Result<Self, StoreError> {
        let mut runtime = DestRuntime {
            version,
            ..Default::default()
        };

        for rule in rules {
            match rule.kind {
                DenyKind::Ip => {
                    let ip: IpAddr = rule
                        .pattern
                        .parse()
                        .map_err(|_| StoreError::InvalidPattern(rule.pattern.clone()))?;
                    let prefix = if ip.is_ipv4() { 32 } else { 128 };
                    let net = IpNet::new(ip, prefix)
                        .map_err(|_| StoreError::InvalidPattern(rule.pattern.clone()))?;
                    runtime.networks.push(net);
                }
                DenyKind::Cidr => {
                    let net: IpNet = rule
                        .pattern
                        .parse()
                        .map_err(|_| StoreError::InvalidPattern(rule.pattern.clone()))?;
                    runtime.networks.push(net);
                }
                DenyKind::DomainExact => {
                    runtime
                        .exact
                        .insert(crate::store::normalize_domain(&rule.pattern)?);
                }
                DenyKind::DomainSuffix => {
                    let stripped = rule
                        .pattern
                        .strip_prefix('.')
                        .ok_or_else(|| StoreError::InvalidPattern(rule.pattern.clone()))?;
                    let d = crate::store::normalize_domain(stripped)?;
                    runtime.suffixes.push(format!(".{d}"));
                }
            }
        }

        Ok(runtime)
    }

    /// Decide on a host literal from a CONNECT request. `None` is allow.
    pub fn decide(&self, host: &str) -> Option<DenyMatch> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.networks.iter().find(|net| net.contains(&ip)).map(|net| DenyMatch {
                rule_type: "ip/cidr",
                pattern: net.to_string(),
            });
        }

        let d = host.trim().to_lowercase();
        let d = d.strip_suffix('.').unwrap_or(&d);
        if d.is_empty() {
            return None;
        }

        if self.exact.contains(d) {
            return Some(DenyMatch {
                rule_type: "domain_exact",
                pattern: d.to_string(),
            });
        }

        self.suffixes
            .iter()
            .find(|suffix| d.ends_with(suffix.as_str()))
            .map(|suffix| DenyMatch {
                rule_type: "domain_suffix",
                pattern: suffix.clone(),
            })
    }

    pub fn rule_counts(&self) -> (usize, usize, usize) {
        (self.networks.len(), self.exact.len(), self.suffixes.len())
    }
}

pub struct DestPolicy {
    current: ArcSwap<DestRuntime>,
}

impl DestPolicy {
    pub fn from_store(store: &FileStore) -> Result<Self, StoreError> {
        let runtime = Self::build(store)?;
        Ok(Self {
            current: ArcSwap::from_pointee(runtime),
        })
    }

    fn build(store: &FileStore) -> Result<DestRuntime, StoreError> {
        let version = store.deny_version();
        let rules = store.load_denylist()?;
        DestRuntime::build(version, &rules)
    }

    pub fn decide(&self, host: &str) -> Option<DenyMatch> {
        self.current.load().decide(host)
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Poll the store version and swap in a fresh snapshot when it moves.
    /// Failures keep the last good snapshot.
    pub async fn run_poller(
        self: Arc<Self>,
        store: Arc<FileStore>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let store_version = store.deny_version();
                    if store_version == self.version() {
                        continue;
                    }
                    match Self::build(&store) {
                        Ok(runtime) => {
                            let (nets, exact, suffixes) = runtime.rule_counts();
                            self.current.store(Arc::new(runtime));
                            info!(
                                version = store_version,
                                ip_cidr = nets,
                                exact,
                                suffixes,
                                "destination denylist reloaded"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "destination denylist reload failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
