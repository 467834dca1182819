//! Cryptographic primitives for ScanVault.
//!
//! This module provides:
//! - Key derivation using PBKDF2-HMAC-SHA256
//! - Authenticated encryption using AES-256-GCM
//! - A self-describing envelope binding header fields to the ciphertext
//! - Data-key wrapping under a master key
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Decryption never returns unauthenticated plaintext

pub mod aead;
pub mod envelope;
pub mod kdf;
pub mod keys;
pub mod wrap;

pub use envelope::{decrypt, encrypt, EncryptionEnvelope, KeyMode, OpeningKey, SealingKey};
pub use kdf::{derive_key, derive_key_with_salt, KdfParams, MAX_ITERATIONS, MIN_ITERATIONS};
pub use keys::{DataKey, Salt};
pub use wrap::{KeyWrapper, LocalKeyWrapper};
