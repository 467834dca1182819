//! Common error types for ScanVault.

use thiserror::Error;

/// Top-level error type for ScanVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Key derivation was requested with unusable input.
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Authentication tag did not verify (tampering or wrong key).
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Envelope or record bytes are malformed.
    #[error("Format error: {0}")]
    Format(String),

    /// Vault address has an unknown scheme or no path.
    #[error("Malformed vault address: {0}")]
    MalformedAddress(String),

    /// Backend stayed unreachable after all retries.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient network failure (connection error, 5xx).
    #[error("Network error: {0}")]
    Network(String),

    /// Backend signalled rate limiting.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Backend call exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Caller cancelled the operation.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Credentials were missing, expired or rejected.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Backend refused access.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Permanent backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Generic cryptographic failure.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the failure is worth retrying against the same backend.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::RateLimited(_) | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Whether the error signals a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::RateLimited("429".into()).is_transient());
        assert!(Error::Timeout("30s".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
        assert!(!Error::Integrity("tag".into()).is_transient());
        assert!(!Error::BackendUnavailable("down".into()).is_transient());
    }
}
