//! Active-connection registry
//!
//! Tracks in-flight tunnels by a process-unique, strictly increasing ID.
//! Registration happens right before the outbound dial is committed; the
//! returned guard deregisters on drop, so every exit path releases the
//! slot.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A registered in-flight tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveConn {
    pub id: u64,
    /// Empty when authentication is disabled.
    pub username: String,
    pub source_ip: String,
    /// Literal `host:port` as requested by the client.
    pub destination: String,
    /// Unix milliseconds.
    pub started_at: u64,
}

/// Connections from one source IP, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnGroup {
    pub source_ip: String,
    pub count: usize,
    pub conns: Vec<ActiveConn>,
}

/// Registry shared by both front-ends and the admin endpoint.
pub struct ConnectionRegistry {
    conns: DashMap<u64, ActiveConn>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a tunnel and return its deregistration guard.
    pub fn register(
        self: &Arc<Self>,
        username: &str,
        source_ip: IpAddr,
        destination: &str,
    ) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(
            id,
            ActiveConn {
                id,
                username: username.to_string(),
                source_ip: source_ip.to_string(),
                destination: destination.to_string(),
                started_at: unix_ms(),
            },
        );
        ConnectionGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Copy of all records.
    pub fn snapshot(&self) -> Vec<ActiveConn> {
        self.conns.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Deregisters its connection when dropped.
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: u64,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.conns.remove(&self.id);
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `source_ip` might be "ip:port" or just "ip".
fn normalize_source_ip(source: &str) -> String {
    match source.parse::<std::net::SocketAddr>() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => source.to_string(),
    }
}

/// Group connections by source IP. Within a group, newest first; groups
/// ordered by their newest member. Ties break on ID descending.
pub fn group_by_ip(conns: Vec<ActiveConn>) -> Vec<ConnGroup> {
    let mut by_ip: HashMap<String, Vec<ActiveConn>> = HashMap::new();
    for mut conn in conns {
        let ip = normalize_source_ip(&conn.source_ip);
        conn.source_ip = ip.clone();
        by_ip.entry(ip).or_default().push(conn);
    }

    let mut groups: Vec<ConnGroup> = by_ip
        .into_iter()
        .map(|(source_ip, mut list)| {
            list.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
            ConnGroup {
                source_ip,
                count: list.len(),
                conns: list,
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        let (na, nb) = (&a.conns[0], &b.conns[0]);
        nb.started_at.cmp(&na.started_at).then(nb.id.cmp(&na.id))
    });

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: u64, source_ip: &str, started_at: u64) -> ActiveConn {
        ActiveConn {
            id,
            username: String::new(),
            source_ip: source_ip.to_string(),
            destination: "example.test:80".to_string(),
            started_at,
        }
    }

    #[test]
    fn test_register_and_guard_drop() {
        let registry = ConnectionRegistry::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        let guard = registry.register("alice", ip, "example.test:80");
        assert_eq!(registry.len(), 1);
        let snap = registry.snapshot();
        assert_eq!(snap[0].id, guard.id());
        assert_eq!(snap[0].username, "alice");

        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_strictly_increasing() {
        let registry = ConnectionRegistry::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        let mut last = 0;
        for _ in 0..100 {
            let guard = registry.register("", ip, "t:1");
            assert!(guard.id() > last);
            last = guard.id();
        }
    }

    #[test]
    fn test_group_by_ip_normalizes_and_sorts() {
        let groups = group_by_ip(vec![
            conn(1, "10.0.0.1:5555", 100),
            conn(2, "10.0.0.1", 300),
            conn(3, "10.0.0.2:6666", 200),
        ]);

        // Group with the newest member first.
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].source_ip, "10.0.0.1");
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].conns[0].id, 2);
        assert_eq!(groups[0].conns[1].id, 1);
        assert_eq!(groups[1].source_ip, "10.0.0.2");

        for group in &groups {
            assert!(!group.source_ip.contains(':'));
        }
    }

    #[test]
    fn test_group_ties_break_on_id_descending() {
        let groups = group_by_ip(vec![
            conn(1, "10.0.0.1", 100),
            conn(2, "10.0.0.1", 100),
            conn(3, "10.0.0.2", 100),
        ]);

        assert_eq!(groups[0].source_ip, "10.0.0.2");
        assert_eq!(groups[1].conns[0].id, 2);
        assert_eq!(groups[1].conns[1].id, 1);
    }

    #[test]
    fn test_ipv6_source_normalization() {
        let groups = group_by_ip(vec![conn(1, "[::1]:9999", 100)]);
        assert_eq!(groups[0].source_ip, "::1");
    }
}
