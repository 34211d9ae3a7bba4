//! Error types for kgm-state

use thiserror::Error;

/// Errors that can occur in the KGM persistence layer
#[derive(Error, Debug)]
pub enum KgmError {
    /// Missing or ambiguous request input (e.g. no resolvable scope)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Actor attempted to reach a scope outside its partition
    #[error("scope not allowed: {0}")]
    ScopeNotAllowed(String),

    /// KGM is disabled or not configured
    #[error("KGM is disabled or not configured")]
    ProviderUnavailable,

    /// Graph store failure (connection or statement execution)
    #[error("graph store error: {0}")]
    Store(String),

    /// Schema script loading or application failure
    #[error("schema error: {0}")]
    Schema(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for KgmError {
    fn from(err: serde_json::Error) -> Self {
        KgmError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for KgmError {
    fn from(err: std::io::Error) -> Self {
        KgmError::Io(err.to_string())
    }
}
