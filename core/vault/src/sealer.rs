//! Turns plaintext into stored envelope bytes and back.

use std::fmt;
use std::sync::Arc;
use tokio::task;

use scanvault_common::{Error, Result, SensitiveBytes};
use scanvault_crypto::{
    decrypt, derive_key, encrypt, EncryptionEnvelope, KdfParams, KeyMode, KeyWrapper, OpeningKey,
    SealingKey,
};

/// Where envelope keys come from.
pub enum KeySource {
    /// Keys derived from a passphrase with PBKDF2.
    Passphrase {
        passphrase: Arc<SensitiveBytes>,
        params: KdfParams,
    },
    /// Random data keys wrapped under a master key.
    MasterKey(Arc<dyn KeyWrapper>),
}

impl KeySource {
    /// Passphrase source.
    ///
    /// # Errors
    /// - `KeyDerivation` if the passphrase is empty or `iterations` is out of range
    pub fn passphrase(passphrase: SensitiveBytes, iterations: u32) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::KeyDerivation("Passphrase cannot be empty".to_string()));
        }
        Ok(KeySource::Passphrase {
            passphrase: Arc::new(passphrase),
            params: KdfParams::new(iterations)?,
        })
    }

    pub fn master_key(wrapper: Arc<dyn KeyWrapper>) -> Self {
        KeySource::MasterKey(wrapper)
    }

    /// Mode of envelopes sealed with this source.
    pub fn key_mode(&self) -> KeyMode {
        match self {
            KeySource::Passphrase { .. } => KeyMode::Passphrase,
            KeySource::MasterKey(_) => KeyMode::MasterKey,
        }
    }

    /// Master key reference, if any.
    pub fn key_reference(&self) -> Option<&str> {
        match self {
            KeySource::Passphrase { .. } => None,
            KeySource::MasterKey(wrapper) => Some(wrapper.key_reference()),
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Passphrase { params, .. } => f
                .debug_struct("Passphrase")
                .field("passphrase", &"[REDACTED]")
                .field("iterations", &params.iterations)
                .finish(),
            KeySource::MasterKey(wrapper) => f
                .debug_tuple("MasterKey")
                .field(&wrapper.key_reference())
                .finish(),
        }
    }
}

/// Seals plaintext into serialized envelopes.
#[derive(Debug)]
pub struct Sealer {
    keys: KeySource,
}

impl Sealer {
    pub fn new(keys: KeySource) -> Self {
        Self { keys }
    }

    pub fn key_source(&self) -> &KeySource {
        &self.keys
    }

    /// Encrypt `plaintext` under a fresh key and IV.
    pub async fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = match &self.keys {
            KeySource::Passphrase { passphrase, params } => {
                let passphrase = Arc::clone(passphrase);
                let params = *params;
                off_runtime(move || SealingKey::from_passphrase(passphrase.as_bytes(), &params))
                    .await?
            }
            KeySource::MasterKey(wrapper) => {
                let (data_key, salt) = derive_key(None, &KdfParams::default())?;
                let wrapped = wrapper.wrap_key(&data_key).await?;
                SealingKey::wrapped(data_key, salt, wrapped)?
            }
        };
        Ok(encrypt(plaintext, &key)?.to_bytes())
    }

    /// Verify and decrypt serialized envelope bytes.
    ///
    /// # Errors
    /// - `Format` if the bytes are not an envelope
    /// - `Integrity` on tampering, a wrong passphrase, or a foreign master key
    /// - `KeyDerivation` if the envelope needs a key this sealer does not hold
    pub async fn open(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let envelope = EncryptionEnvelope::from_bytes(bytes)?;
        match (&self.keys, envelope.key_mode) {
            (KeySource::Passphrase { passphrase, .. }, KeyMode::Passphrase) => {
                let passphrase = Arc::clone(passphrase);
                off_runtime(move || decrypt(&envelope, OpeningKey::Passphrase(passphrase.as_bytes())))
                    .await
            }
            (KeySource::MasterKey(wrapper), KeyMode::MasterKey) => {
                let data_key = wrapper.unwrap_key(&envelope.wrapped_key).await?;
                decrypt(&envelope, OpeningKey::DataKey(&data_key))
            }
            (_, mode) => Err(Error::KeyDerivation(format!(
                "Envelope uses {} keys, which this vault is not configured for",
                mode.as_str()
            ))),
        }
    }
}

/// Run PBKDF2-bound work on the blocking pool.
async fn off_runtime<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Crypto(format!("Key derivation task failed: {}", e)))?
}
