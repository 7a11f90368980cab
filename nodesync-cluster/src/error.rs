//! Error types for the sync engine

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Registry returned status {status}: {body}")]
    RegistryStatus { status: u16, body: String },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Message loop already running for driver {0}")]
    LoopAlreadyRunning(String),

    #[error("Fan-out incomplete: {failed} of {total} recipients failed")]
    FanOutIncomplete { failed: usize, total: usize },
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Registry(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
