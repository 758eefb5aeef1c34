//! Proxy front-ends
//!
//! The SOCKS5 and HTTP CONNECT listeners share one state: the dial plan,
//! the store, both policies and the connection registry.

mod http;
mod socks;
mod tunnel;

pub use http::HttpServer;
pub use socks::SocksServer;
pub use tunnel::relay;

use std::sync::Arc;
use std::time::Duration;

use crate::connection::ConnectionRegistry;
use crate::dialer::DialPlan;
use crate::policy::{DestPolicy, SourcePolicy};
use crate::store::FileStore;

/// Inbound handshake deadline, covering method negotiation through the
/// CONNECT request.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for the entire chain-dial operation.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared per-process state for both front-ends.
pub struct ServerState {
    pub plan: DialPlan,
    pub store: Arc<FileStore>,
    pub source_policy: Arc<SourcePolicy>,
    pub dest_policy: Arc<DestPolicy>,
    pub registry: Arc<ConnectionRegistry>,
    pub require_auth: bool,
    /// Zero disables the tunnel idle deadline.
    pub idle_timeout: Duration,
}
