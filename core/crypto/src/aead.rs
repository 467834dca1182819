//! Authenticated encryption using AES-256-GCM.
//!
//! The tag is kept detached so the envelope can store it in a fixed header
//! slot. IVs are 96 bits and drawn from the OS CSPRNG on every call.

use aes_gcm::{
    aead::{rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use zeroize::Zeroize;

use crate::keys::DataKey;
use scanvault_common::{Error, Result};

/// IV size for AES-GCM (12 bytes).
pub const IV_SIZE: usize = 12;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Generate a fresh random IV.
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

fn cipher_for(key: &DataKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::Crypto(format!("Invalid AES-256 key: {}", e)))
}

/// Encrypt plaintext, returning the ciphertext and its detached tag.
///
/// # Preconditions
/// - `iv` must never be reused under the same key
///
/// # Postconditions
/// - Ciphertext length equals plaintext length
/// - `aad` is authenticated but not encrypted
///
/// # Errors
/// - Returns `Crypto` if the cipher rejects the input
pub fn seal(
    key: &DataKey,
    iv: &[u8; IV_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE])> {
    let cipher = cipher_for(key)?;
    let mut buffer = plaintext.to_vec();

    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(iv), aad, &mut buffer)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);
    Ok((buffer, tag_bytes))
}

/// Verify and decrypt a ciphertext with a detached tag.
///
/// # Postconditions
/// - Returns plaintext only if the tag verifies; nothing otherwise
///
/// # Errors
/// - Returns `Integrity` if authentication fails (tampering or wrong key)
pub fn open(
    key: &DataKey,
    iv: &[u8; IV_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let mut buffer = ciphertext.to_vec();

    match cipher.decrypt_in_place_detached(
        Nonce::from_slice(iv),
        aad,
        &mut buffer,
        Tag::from_slice(tag),
    ) {
        Ok(()) => Ok(buffer),
        Err(_) => {
            buffer.zeroize();
            Err(Error::Integrity(
                "Authentication tag did not verify".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LENGTH;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = DataKey::from_bytes([42u8; KEY_LENGTH]);
        let iv = generate_iv();

        let (ct, tag) = seal(&key, &iv, b"hdr", b"Hello, World!").unwrap();
        let pt = open(&key, &iv, b"hdr", &ct, &tag).unwrap();

        assert_eq!(pt, b"Hello, World!");
    }

    #[test]
    fn test_ciphertext_size() {
        let key = DataKey::from_bytes([42u8; KEY_LENGTH]);
        let (ct, _) = seal(&key, &generate_iv(), b"", b"Test message").unwrap();
        assert_eq!(ct.len(), b"Test message".len());
    }

    #[test]
    fn test_different_iv_each_time() {
        assert_ne!(generate_iv(), generate_iv());
    }

    #[test]
    fn test_wrong_key_fails() {
        let iv = generate_iv();
        let (ct, tag) = seal(&DataKey::from_bytes([1u8; KEY_LENGTH]), &iv, b"", b"x").unwrap();
        let err = open(&DataKey::from_bytes([2u8; KEY_LENGTH]), &iv, b"", &ct, &tag).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_tampered_aad_fails() {
        let key = DataKey::from_bytes([9u8; KEY_LENGTH]);
        let iv = generate_iv();
        let (ct, tag) = seal(&key, &iv, b"header-v1", b"payload").unwrap();
        assert!(open(&key, &iv, b"header-v2", &ct, &tag).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = DataKey::from_bytes([42u8; KEY_LENGTH]);
        let iv = generate_iv();
        let (ct, tag) = seal(&key, &iv, b"", b"").unwrap();
        assert!(ct.is_empty());
        assert_eq!(open(&key, &iv, b"", &ct, &tag).unwrap(), b"");
    }
}
