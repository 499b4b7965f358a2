//! Query layer errors.

use thiserror::Error;
use turbo_rpc::RpcError;

/// Errors raised while building queries or loading configuration.
///
/// Cache reads and writes never fail; a miss is `None`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The underlying call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
