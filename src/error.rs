//! Error types for Halley

use thiserror::Error;

/// Main error type for Halley operations
#[derive(Error, Debug)]
pub enum HalleyError {
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("no handler for resource: {0}")]
    NotFound(String),

    #[error("module failure in {module}: {reason}")]
    ModuleFailure { module: String, reason: String },

    #[error("event queue closed")]
    QueueClosed,

    #[error("cannot bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<crate::eds::queue::QueueError> for HalleyError {
    fn from(_: crate::eds::queue::QueueError) -> Self {
        HalleyError::QueueClosed
    }
}

impl From<crate::http::parser::ParseError> for HalleyError {
    fn from(err: crate::http::parser::ParseError) -> Self {
        HalleyError::ClientProtocol(err.to_string())
    }
}

impl From<crate::http::module::ModuleError> for HalleyError {
    fn from(err: crate::http::module::ModuleError) -> Self {
        match err {
            crate::http::module::ModuleError::ChainCycle { module } => {
                HalleyError::Internal(format!("module chain cycle at {module}"))
            }
            crate::http::module::ModuleError::Failed { module, reason } => {
                HalleyError::ModuleFailure { module, reason }
            }
        }
    }
}

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, HalleyError>;
