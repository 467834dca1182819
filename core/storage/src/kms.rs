//! Cloud KMS master key.
//!
//! Data keys are wrapped by the key service's `:encrypt` / `:decrypt` REST
//! methods; the master key never leaves the service.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroize;

use crate::credentials::{CredentialProvider, Identity};
use crate::http;
use scanvault_common::{Error, Result};
use scanvault_crypto::{DataKey, KeyWrapper};

/// Public Cloud KMS endpoint.
pub const KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com";

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

/// Wraps data keys under a Cloud KMS crypto key.
pub struct CloudKmsKeyWrapper {
    key_name: String,
    endpoint: String,
    http: Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl CloudKmsKeyWrapper {
    /// Create a wrapper for `key_name`
    /// (`projects/*/locations/*/keyRings/*/cryptoKeys/*`).
    pub fn new(key_name: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let key_name = key_name.into();
        if !key_name.starts_with("projects/") || !key_name.contains("/cryptoKeys/") {
            return Err(Error::Config(format!("Invalid KMS key name '{}'", key_name)));
        }
        Ok(Self {
            key_name,
            endpoint: KMS_ENDPOINT.to_string(),
            http: http::build_client()?,
            credentials,
        })
    }

    /// Override the API endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let token = self.credentials.access_token(&Identity::Service).await?;
        self.http
            .post(format!("{}/v1/{}:{}", self.endpoint, self.key_name, method))
            .header(header::AUTHORIZATION, format!("Bearer {}", token.secret()))
            .json(&body)
            .send()
            .await
            .map_err(|e| http::send_error(e, method))
    }
}

#[async_trait]
impl KeyWrapper for CloudKmsKeyWrapper {
    fn key_reference(&self) -> &str {
        &self.key_name
    }

    async fn wrap_key(&self, key: &DataKey) -> Result<Vec<u8>> {
        let mut encoded = STANDARD.encode(key.as_bytes());
        let response = self
            .call("encrypt", serde_json::json!({ "plaintext": &encoded }))
            .await;
        encoded.zeroize();

        let wrapped: EncryptResponse = http::json_or_error(response?, "kms encrypt").await?;
        STANDARD
            .decode(wrapped.ciphertext)
            .map_err(|e| Error::Crypto(format!("KMS returned invalid ciphertext: {}", e)))
    }

    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey> {
        let response = self
            .call("decrypt", serde_json::json!({ "ciphertext": STANDARD.encode(wrapped) }))
            .await?;

        // The service rejects ciphertext it did not produce with 400.
        if response.status() == StatusCode::BAD_REQUEST {
            return Err(Error::Integrity(
                "Wrapped key was not produced by this master key".to_string(),
            ));
        }

        let unwrapped: DecryptResponse = http::json_or_error(response, "kms decrypt").await?;
        let mut plain = STANDARD
            .decode(unwrapped.plaintext)
            .map_err(|e| Error::Crypto(format!("KMS returned invalid plaintext: {}", e)))?;
        let key = DataKey::from_slice(&plain);
        plain.zeroize();
        debug!(key = %self.key_name, "Unwrapped data key via KMS");
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "projects/p/locations/global/keyRings/r/cryptoKeys/k";

    fn wrapper(server: &MockServer) -> CloudKmsKeyWrapper {
        CloudKmsKeyWrapper::new(KEY, Arc::new(StaticCredentials::service("tok")))
            .unwrap()
            .with_endpoint(server.uri())
    }

    #[test]
    fn test_rejects_bad_key_name() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(StaticCredentials::service("tok"));
        assert!(CloudKmsKeyWrapper::new("not-a-key", creds).is_err());
    }

    #[tokio::test]
    async fn test_wrap_and_unwrap() {
        let server = MockServer::start().await;
        let key = DataKey::from_bytes([9u8; 32]);

        Mock::given(method("POST"))
            .and(path(format!("/v1/{}:encrypt", KEY)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": KEY,
                "ciphertext": STANDARD.encode(b"wrapped-bytes")
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/v1/{}:decrypt", KEY)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "plaintext": STANDARD.encode([9u8; 32])
            })))
            .mount(&server)
            .await;

        let kms = wrapper(&server);
        let wrapped = kms.wrap_key(&key).await.unwrap();
        assert_eq!(wrapped, b"wrapped-bytes");

        let recovered = kms.unwrap_key(&wrapped).await.unwrap();
        assert_eq!(recovered.as_bytes(), key.as_bytes());
        assert_eq!(kms.key_reference(), KEY);
    }

    #[tokio::test]
    async fn test_foreign_ciphertext_is_integrity_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/v1/{}:decrypt", KEY)))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": 400, "message": "Decryption failed" }
            })))
            .mount(&server)
            .await;

        let err = wrapper(&server).unwrap_key(b"junk").await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }
}
