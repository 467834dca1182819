//! Shared HTTP plumbing for the cloud adapters.

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use scanvault_common::{Error, Result};

/// Build the HTTP client used by every adapter.
pub(crate) fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("ScanVault/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Classify a transport-level failure.
pub(crate) fn send_error(err: reqwest::Error, context: &str) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{}: {}", context, err))
    } else {
        Error::Network(format!("{}: {}", context, err))
    }
}

/// Map a non-success response to an error.
///
/// The response body is logged at debug level and never copied into the
/// returned error.
pub(crate) async fn status_error(response: Response, context: &str) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    debug!(status = %status, context, body = %body, "Backend returned error");

    match status {
        StatusCode::NOT_FOUND => Error::NotFound(format!("{}: not found", context)),
        StatusCode::UNAUTHORIZED => {
            Error::Authentication(format!("{}: invalid or expired token", context))
        }
        StatusCode::FORBIDDEN => Error::PermissionDenied(format!("{}: access denied", context)),
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(format!("{}: {}", context, status)),
        StatusCode::REQUEST_TIMEOUT => Error::Timeout(format!("{}: {}", context, status)),
        s if s.is_server_error() => Error::Network(format!("{}: {}", context, status)),
        s => Error::Storage(format!("{}: {}", context, s)),
    }
}

/// Parse a JSON body, or map the status to an error.
pub(crate) async fn json_or_error<T: DeserializeOwned>(response: Response, context: &str) -> Result<T> {
    if !response.status().is_success() {
        return Err(status_error(response, context).await);
    }
    response
        .json()
        .await
        .map_err(|e| Error::Serialization(format!("{}: failed to parse response: {}", context, e)))
}

/// Succeed on any 2xx, otherwise map the status to an error.
pub(crate) async fn ok_or_error(response: Response, context: &str) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(response, context).await)
    }
}
