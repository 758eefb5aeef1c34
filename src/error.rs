//! CLI error type and process exit codes.

use thiserror::Error;

use crate::dialer::ChainConfigError;
use crate::store::StoreError;

// Exit codes, kept small and consistent across commands.
pub const EXIT_OK: i32 = 0;
pub const EXIT_RUNTIME: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_CONFIG: i32 = 3;
pub const EXIT_IO: i32 = 4;
pub const EXIT_AUTH: i32 = 5;
pub const EXIT_EXTERNAL: i32 = 6;

/// User-facing error carrying the process exit code.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid flags or bad CLI usage.
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration or validation failure.
    #[error("{0}")]
    Config(String),
    /// Filesystem or I/O failure.
    #[error("{0}")]
    Io(String),
    /// Credential failure.
    #[error("{0}")]
    Auth(String),
    /// External dependency or service failure.
    #[error("{0}")]
    External(String),
    /// Generic runtime failure.
    #[error("{0}")]
    Runtime(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) => EXIT_USAGE,
            CliError::Config(_) => EXIT_CONFIG,
            CliError::Io(_) => EXIT_IO,
            CliError::Auth(_) => EXIT_AUTH,
            CliError::External(_) => EXIT_EXTERNAL,
            CliError::Runtime(_) => EXIT_RUNTIME,
        }
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(_) | StoreError::Serde(_) => CliError::Io(err.to_string()),
            StoreError::InvalidPattern(_) | StoreError::EmptyPassword => {
                CliError::Usage(err.to_string())
            }
            StoreError::BadCredentials => CliError::Auth(err.to_string()),
            _ => CliError::Runtime(err.to_string()),
        }
    }
}

// Chain-config problems are configuration errors wherever they surface.
impl From<ChainConfigError> for CliError {
    fn from(err: ChainConfigError) -> Self {
        CliError::Config(err.to_string())
    }
}
