//! Utility modules

pub mod host_port;
pub mod tracing_setup;

pub use host_port::split_host_port;
pub use tracing_setup::init_tracing;
