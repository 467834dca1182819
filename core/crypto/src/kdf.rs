//! Key derivation using PBKDF2-HMAC-SHA256.
//!
//! PBKDF2 with a SHA-256 core is FIPS 140-2 approved. The iteration count
//! is recorded in every passphrase envelope so the key can be re-derived
//! without outside configuration.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::keys::{DataKey, Salt, KEY_LENGTH};
use scanvault_common::{Error, Result};

/// Lowest iteration count accepted anywhere in the vault.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Highest iteration count accepted, for sealing and for stored envelopes.
///
/// The count in an envelope header is read before the tag is checked, so it
/// bounds the work a forged envelope can demand.
pub const MAX_ITERATIONS: u32 = 10 * MIN_ITERATIONS;

/// Parameters for PBKDF2 key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Number of HMAC iterations.
    pub iterations: u32,
}

impl KdfParams {
    /// Create parameters with an explicit iteration count.
    ///
    /// # Errors
    /// - Returns `KeyDerivation` if `iterations` is outside
    ///   MIN_ITERATIONS..=MAX_ITERATIONS
    pub fn new(iterations: u32) -> Result<Self> {
        let params = Self { iterations };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<()> {
        if self.iterations < MIN_ITERATIONS {
            return Err(Error::KeyDerivation(format!(
                "Iteration count {} is below the minimum of {}",
                self.iterations, MIN_ITERATIONS
            )));
        }
        if self.iterations > MAX_ITERATIONS {
            return Err(Error::KeyDerivation(format!(
                "Iteration count {} is above the maximum of {}",
                self.iterations, MAX_ITERATIONS
            )));
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: MIN_ITERATIONS,
        }
    }
}

/// Produce a fresh key and salt.
///
/// With no passphrase, the key comes straight from the OS CSPRNG and a random
/// salt is still generated so every envelope has the same shape. With a
/// passphrase, the key is derived over a freshly generated salt.
///
/// # Errors
/// - `KeyDerivation` if the passphrase is empty or the parameters are too weak
pub fn derive_key(passphrase: Option<&[u8]>, params: &KdfParams) -> Result<(DataKey, Salt)> {
    let salt = Salt::generate();
    match passphrase {
        None => Ok((DataKey::generate(), salt)),
        Some(passphrase) => {
            let key = derive_key_with_salt(passphrase, &salt, params)?;
            Ok((key, salt))
        }
    }
}

/// Re-derive a key from a passphrase and a known salt.
///
/// # Errors
/// - `KeyDerivation` if the passphrase is empty or the parameters are too weak
pub fn derive_key_with_salt(passphrase: &[u8], salt: &Salt, params: &KdfParams) -> Result<DataKey> {
    if passphrase.is_empty() {
        return Err(Error::KeyDerivation(
            "Passphrase cannot be empty".to_string(),
        ));
    }
    params.validate()?;

    let mut key_bytes = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(passphrase, salt.as_bytes(), params.iterations, &mut key_bytes);

    Ok(DataKey::from_bytes(key_bytes))
}
