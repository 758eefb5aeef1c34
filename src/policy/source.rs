//! Source allowlist
//!
//! Admits an inbound connection iff its source IP falls inside any enabled
//! allowlist network.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::store::{FileStore, StoreError};

use super::POLL_INTERVAL;

/// Immutable decision snapshot. `version` is the store version it was
/// built from.
#[derive(Debug)]
pub struct SourceRuntime {
    pub version: u64,
    networks: Vec<IpNet>,
}

impl SourceRuntime {
    pub fn new(version: u64, networks: Vec<IpNet>) -> Self {
        Self { version, networks }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(&ip))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

pub struct SourcePolicy {
    current: ArcSwap<SourceRuntime>,
}

impl SourcePolicy {
    /// Build the initial snapshot from the store.
    pub fn from_store(store: &FileStore) -> Result<Self, StoreError> {
        let runtime = Self::build(store)?;
        Ok(Self {
            current: ArcSwap::from_pointee(runtime),
        })
    }

    fn build(store: &FileStore) -> Result<SourceRuntime, StoreError> {
        // Version first: a concurrent mutation between the two reads makes
        // the next poll tick rebuild, never miss.
        let version = store.allow_version();
        let networks = store.load_allowlist()?;
        Ok(SourceRuntime::new(version, networks))
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.current.load().contains(ip)
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
                    let store_version = store.allow_version();
                    if store_version == self.version() {
                        continue;
                    }
                    match Self::build(&store) {
                        Ok(runtime) => {
                            let entries = runtime.len();
                            self.current.store(Arc::new(runtime));
                            info!(entries, version = store_version, "source allowlist reloaded");
                        }
                        Err(e) => {
                            warn!(error = %e, "source allowlist reload failed");
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
