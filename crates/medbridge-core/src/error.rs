//! Error taxonomy for the reconciliation pipeline.
//!
//! Classification drives the handling policy: transport errors are retryable
//! at the caller's discretion, auth errors are fatal for the current call but
//! recoverable on the next pass, remote API errors carry the status and body
//! and are not retried automatically, and per-record local lookup misses are
//! skips rather than failures.

use thiserror::Error;

/// Error that can occur anywhere in the sync pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network-level failure (timeout, connection refused, DNS).
    ///
    /// Always retryable at the caller's discretion; this layer performs no
    /// automatic retry.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Token refresh or authentication failure.
    ///
    /// Fatal for the current call; the next pass may succeed after
    /// re-authentication.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Non-2xx response from the CRM.
    #[error("CRM returned {status}: {body}")]
    RemoteApi { status: u16, body: String },

    /// A referenced local record vanished between listing and processing.
    ///
    /// Treated as a skipped record, never a pass failure.
    #[error("local {kind} not found: {id}")]
    NotFoundLocal { kind: &'static str, id: i64 },

    /// Missing or inconsistent routing/field configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Source store query failure. Aborts the current pass.
    #[error("source store error: {0}")]
    Database(String),
}

impl SyncError {
    /// Build a transport error from any underlying cause.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Whether the error is worth retrying on a later pass without operator
    /// intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Auth(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_is_retryable() {
        assert!(SyncError::transport("connection reset").is_retryable());
        assert!(SyncError::Auth("refresh token revoked".into()).is_retryable());
    }

    #[test]
    fn remote_api_is_not_retryable() {
        let err = SyncError::RemoteApi {
            status: 400,
            body: "bad field".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "CRM returned 400: bad field");
    }

    #[test]
    fn not_found_local_display() {
        let err = SyncError::NotFoundLocal {
            kind: "patient",
            id: 42,
        };
        assert_eq!(err.to_string(), "local patient not found: 42");
    }
}
