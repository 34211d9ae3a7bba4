//! Graph executor seam
//!
//! The backing graph engine is an external collaborator reached through this
//! trait: run one statement with bound parameters against an optional
//! database, get rows back as JSON objects. The Bolt driver adapter and the
//! in-memory fake both live behind it.

use async_trait::async_trait;

use crate::Result;

/// Rows and property bags are plain JSON objects.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Opaque capability to execute one graph statement.
#[async_trait]
pub trait GraphExecutor: Send + Sync {
    async fn run(
        &self,
        statement: &str,
        params: &JsonObject,
        database: Option<&str>,
    ) -> Result<Vec<JsonObject>>;
}

/// Whether a store error message indicates a transient condition worth
/// retrying (connection loss, engine restart, expired session).
pub fn is_retryable_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("connection")
        || lowered.contains("service unavailable")
        || lowered.contains("session expired")
        || lowered.contains("terminated")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_messages() {
        assert!(is_retryable_error("Connection refused"));
        assert!(is_retryable_error("Service Unavailable"));
        assert!(is_retryable_error("session expired, please retry"));
        assert!(is_retryable_error("stream terminated"));
    }

    #[test]
    fn rejects_permanent_messages() {
        assert!(!is_retryable_error("syntax error near MATCH"));
        assert!(!is_retryable_error("constraint violation"));
    }
}
