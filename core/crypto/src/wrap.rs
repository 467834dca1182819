//! Data-key wrapping under a master key.
//!
//! A `KeyWrapper` hides where the master key lives. The local implementation
//! holds it in memory; a managed key service can implement the same trait
//! without the master key ever leaving the service.

use async_trait::async_trait;
use tracing::debug;

use crate::aead::{self, IV_SIZE, TAG_SIZE};
use crate::keys::{DataKey, KEY_LENGTH};
use scanvault_common::{Error, Result};

/// Wraps and unwraps per-document data keys.
#[async_trait]
pub trait KeyWrapper: Send + Sync {
    /// Stable identifier of the master key, recorded with each object.
    fn key_reference(&self) -> &str;

    /// Encrypt a data key under the master key.
    async fn wrap_key(&self, key: &DataKey) -> Result<Vec<u8>>;

    /// Recover a data key.
    ///
    /// # Errors
    /// - `Integrity` if the wrapped bytes were not produced by this master key
    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey>;
}

/// AES-256-GCM key wrapping with an in-process master key.
///
/// Wrapped form: `iv (12) | encrypted key (32) | tag (16)`.
pub struct LocalKeyWrapper {
    master: DataKey,
    reference: String,
}

/// Length of a key wrapped by `LocalKeyWrapper`.
pub const LOCAL_WRAPPED_LEN: usize = IV_SIZE + KEY_LENGTH + TAG_SIZE;

const WRAP_AAD: &[u8] = b"scanvault-key-wrap-v1";

impl LocalKeyWrapper {
    /// Create a wrapper around an existing master key.
    pub fn new(master: DataKey, reference: impl Into<String>) -> Self {
        Self {
            master,
            reference: reference.into(),
        }
    }

    /// Create a wrapper with a freshly generated master key.
    pub fn generate(reference: impl Into<String>) -> Self {
        Self::new(DataKey::generate(), reference)
    }
}

#[async_trait]
impl KeyWrapper for LocalKeyWrapper {
    fn key_reference(&self) -> &str {
        &self.reference
    }

    async fn wrap_key(&self, key: &DataKey) -> Result<Vec<u8>> {
        let iv = aead::generate_iv();
        let (ciphertext, tag) = aead::seal(&self.master, &iv, WRAP_AAD, key.as_bytes())?;

        let mut wrapped = Vec::with_capacity(LOCAL_WRAPPED_LEN);
        wrapped.extend_from_slice(&iv);
        wrapped.extend_from_slice(&ciphertext);
        wrapped.extend_from_slice(&tag);
        Ok(wrapped)
    }

    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey> {
        if wrapped.len() != LOCAL_WRAPPED_LEN {
            return Err(Error::Integrity(format!(
                "Wrapped key has length {}, expected {}",
                wrapped.len(),
                LOCAL_WRAPPED_LEN
            )));
        }

        let (iv_bytes, rest) = wrapped.split_at(IV_SIZE);
        let (ciphertext, tag_bytes) = rest.split_at(KEY_LENGTH);

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(iv_bytes);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(tag_bytes);

        let plain = aead::open(&self.master, &iv, WRAP_AAD, ciphertext, &tag)?;
        debug!(reference = %self.reference, "Unwrapped data key");
        DataKey::from_slice(&plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wrap_unwrap_roundtrip() {
        let wrapper = LocalKeyWrapper::generate("local/test");
        let key = DataKey::generate();

        let wrapped = wrapper.wrap_key(&key).await.unwrap();
        assert_eq!(wrapped.len(), LOCAL_WRAPPED_LEN);

        let recovered = wrapper.unwrap_key(&wrapped).await.unwrap();
        assert_eq!(recovered.as_bytes(), key.as_bytes());
    }

    #[tokio::test]
    async fn test_other_master_fails_integrity() {
        let a = LocalKeyWrapper::generate("a");
        let b = LocalKeyWrapper::generate("b");
        let wrapped = a.wrap_key(&DataKey::generate()).await.unwrap();

        let err = b.unwrap_key(&wrapped).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[tokio::test]
    async fn test_wrong_length_fails_integrity() {
        let wrapper = LocalKeyWrapper::generate("a");
        let err = wrapper.unwrap_key(&[0u8; 10]).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_key_reference() {
        assert_eq!(LocalKeyWrapper::generate("kms/ref").key_reference(), "kms/ref");
    }
}
