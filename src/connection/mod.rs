//! Active-connection tracking

mod registry;

pub use registry::{group_by_ip, ActiveConn, ConnGroup, ConnectionGuard, ConnectionRegistry};
