//! Access tokens for the cloud backends.
//!
//! Acquiring credentials (consent flows, key files) happens elsewhere; this
//! module only turns an identity into a bearer token, refreshing and caching
//! where needed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicTokenResponse;
use oauth2::{AccessToken, ClientId, ClientSecret, RefreshToken, TokenResponse};
use reqwest::{header, Client, StatusCode};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::http;
use scanvault_common::{Error, Result};

/// Default OAuth2 token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_SKEW_MINUTES: i64 = 5;

/// Who a backend call is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// The vault's own service identity.
    Service,
    /// An end user the service acts for.
    Impersonated(String),
}

impl Identity {
    /// Parse an identity from an optional email address.
    pub fn from_subject(subject: Option<&str>) -> Self {
        match subject {
            Some(email) if !email.is_empty() => Identity::Impersonated(email.to_string()),
            _ => Identity::Service,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Service => f.write_str("service"),
            Identity::Impersonated(email) => write!(f, "impersonated:{}", email),
        }
    }
}

/// Hands out bearer tokens to the backend adapters.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Get a token valid for at least the next few minutes.
    ///
    /// # Errors
    /// - `Authentication` if no credential exists for `identity` or it was rejected
    async fn access_token(&self, identity: &Identity) -> Result<AccessToken>;
}

/// Fixed tokens, one per identity.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    tokens: HashMap<Identity, AccessToken>,
}

impl StaticCredentials {
    /// Credentials holding only a service token.
    pub fn service(token: impl Into<String>) -> Self {
        Self::default().with_token(Identity::Service, token)
    }

    /// Add a token for an identity.
    pub fn with_token(mut self, identity: Identity, token: impl Into<String>) -> Self {
        self.tokens.insert(identity, AccessToken::new(token.into()));
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self, identity: &Identity) -> Result<AccessToken> {
        self.tokens
            .get(identity)
            .cloned()
            .ok_or_else(|| Error::Authentication(format!("No credential for {}", identity)))
    }
}

/// An access token with expiration tracking.
#[derive(Debug, Clone)]
struct CachedToken {
    token: AccessToken,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        self.expires_at < Utc::now() + Duration::minutes(EXPIRY_SKEW_MINUTES)
    }
}

/// Refresh-token grant against an OAuth2 token endpoint.
pub struct OAuthRefreshCredentials {
    http: Client,
    token_url: String,
    client_id: ClientId,
    client_secret: ClientSecret,
    refresh_tokens: HashMap<Identity, RefreshToken>,
    cache: RwLock<HashMap<Identity, CachedToken>>,
}

impl OAuthRefreshCredentials {
    /// Create a provider for the given OAuth client.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: http::build_client()?,
            token_url: GOOGLE_TOKEN_URL.to_string(),
            client_id: ClientId::new(client_id.into()),
            client_secret: ClientSecret::new(client_secret.into()),
            refresh_tokens: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Override the token endpoint.
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// Register the refresh token for an identity.
    pub fn with_refresh_token(mut self, identity: Identity, token: impl Into<String>) -> Self {
        self.refresh_tokens
            .insert(identity, RefreshToken::new(token.into()));
        self
    }

    async fn refresh(&self, identity: &Identity) -> Result<CachedToken> {
        let refresh_token = self
            .refresh_tokens
            .get(identity)
            .ok_or_else(|| Error::Authentication(format!("No refresh token for {}", identity)))?;

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", refresh_token.secret())
            .append_pair("client_id", self.client_id.as_str())
            .append_pair("client_secret", self.client_secret.secret())
            .finish();

        let response = self
            .http
            .post(&self.token_url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| http::send_error(e, "token refresh"))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication(format!(
                "Token refresh for {} rejected ({})",
                identity, status
            )));
        }

        let token: BasicTokenResponse = http::json_or_error(response, "token refresh").await?;
        let lifetime = token
            .expires_in()
            .and_then(|d| Duration::from_std(d).ok())
            .unwrap_or_else(|| Duration::hours(1));

        Ok(CachedToken {
            token: token.access_token().clone(),
            expires_at: Utc::now() + lifetime,
        })
    }
}

#[async_trait]
impl CredentialProvider for OAuthRefreshCredentials {
    async fn access_token(&self, identity: &Identity) -> Result<AccessToken> {
        if let Some(cached) = self.cache.read().await.get(identity) {
            if !cached.is_expired() {
                return Ok(cached.token.clone());
            }
        }

        let mut cache = self.cache.write().await;

        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = cache.get(identity) {
            if !cached.is_expired() {
                return Ok(cached.token.clone());
            }
        }

        info!(identity = %identity, "Refreshing access token");
        let fresh = self.refresh(identity).await?;
        debug!(identity = %identity, expires_at = %fresh.expires_at, "Access token refreshed");
        let token = fresh.token.clone();
        cache.insert(identity.clone(), fresh);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_token_expiration_skew() {
        let expired = CachedToken {
            token: AccessToken::new("t".to_string()),
            expires_at: Utc::now() + Duration::minutes(4),
        };
        assert!(expired.is_expired());

        let valid = CachedToken {
            token: AccessToken::new("t".to_string()),
            expires_at: Utc::now() + Duration::hours(1),
        };
        assert!(!valid.is_expired());
    }

    #[test]
    fn test_identity_from_subject() {
        assert_eq!(Identity::from_subject(None), Identity::Service);
        assert_eq!(Identity::from_subject(Some("")), Identity::Service);
        assert_eq!(
            Identity::from_subject(Some("a@example.com")),
            Identity::Impersonated("a@example.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_static_credentials_per_identity() {
        let creds = StaticCredentials::service("svc-token")
            .with_token(Identity::Impersonated("u@example.com".into()), "user-token");

        let svc = creds.access_token(&Identity::Service).await.unwrap();
        assert_eq!(svc.secret(), "svc-token");

        let user = creds
            .access_token(&Identity::Impersonated("u@example.com".into()))
            .await
            .unwrap();
        assert_eq!(user.secret(), "user-token");

        let err = creds
            .access_token(&Identity::Impersonated("other@example.com".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_refresh_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-token",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let creds = OAuthRefreshCredentials::new("id", "secret")
            .unwrap()
            .with_token_url(format!("{}/token", server.uri()))
            .with_refresh_token(Identity::Service, "refresh");

        let first = creds.access_token(&Identity::Service).await.unwrap();
        let second = creds.access_token(&Identity::Service).await.unwrap();
        assert_eq!(first.secret(), "fresh-token");
        assert_eq!(second.secret(), "fresh-token");
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let creds = OAuthRefreshCredentials::new("id", "secret")
            .unwrap()
            .with_token_url(format!("{}/token", server.uri()))
            .with_refresh_token(Identity::Service, "revoked");

        let err = creds.access_token(&Identity::Service).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }
}
