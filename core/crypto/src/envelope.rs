//! Self-describing encryption envelope.
//!
//! Layout (version 1, big-endian):
//!
//! ```text
//! magic "SVE1" (4) | version u8 | key_mode u8 | iterations u32 | salt (32)
//! | iv (12) | tag (16) | wrapped_key_len u16 | wrapped_key | ciphertext
//! ```
//!
//! Everything but the tag and ciphertext is bound into the AEAD as associated
//! data, so an envelope opens only with the exact header it was sealed with.
//! Decryption needs the envelope bytes plus either the passphrase or the
//! unwrapped data key, never any session state.

use tracing::debug;

use crate::aead::{self, IV_SIZE, TAG_SIZE};
use crate::kdf::{derive_key, derive_key_with_salt, KdfParams, MAX_ITERATIONS, MIN_ITERATIONS};
use crate::keys::{DataKey, Salt, SALT_LENGTH};
use scanvault_common::{Error, Result};

/// Magic prefix identifying a vault envelope.
pub const MAGIC: &[u8; 4] = b"SVE1";

/// Current envelope format version.
pub const FORMAT_VERSION: u8 = 1;

const HEADER_FIXED_LEN: usize = 4 + 1 + 1 + 4 + SALT_LENGTH + IV_SIZE + TAG_SIZE + 2;

/// How the data key of an envelope is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Derived from a passphrase and the embedded salt.
    Passphrase,
    /// Random data key wrapped under a master key.
    MasterKey,
}

impl KeyMode {
    fn to_byte(self) -> u8 {
        match self {
            KeyMode::Passphrase => 0,
            KeyMode::MasterKey => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(KeyMode::Passphrase),
            1 => Ok(KeyMode::MasterKey),
            other => Err(Error::Format(format!("Unknown key mode {}", other))),
        }
    }

    /// Label stored alongside objects.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyMode::Passphrase => "passphrase",
            KeyMode::MasterKey => "master_key",
        }
    }
}

/// A sealed document payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionEnvelope {
    /// Format version.
    pub version: u8,
    /// Key recovery mode.
    pub key_mode: KeyMode,
    /// PBKDF2 iterations (zero for master-key envelopes).
    pub iterations: u32,
    /// Key-derivation salt.
    pub salt: Salt,
    /// AES-GCM IV.
    pub iv: [u8; IV_SIZE],
    /// AES-GCM tag.
    pub tag: [u8; TAG_SIZE],
    /// Data key wrapped under the master key (empty for passphrase envelopes).
    pub wrapped_key: Vec<u8>,
    /// Encrypted payload.
    pub ciphertext: Vec<u8>,
}

/// Key material used to seal one envelope.
pub struct SealingKey {
    key: DataKey,
    salt: Salt,
    mode: KeyMode,
    iterations: u32,
    wrapped_key: Vec<u8>,
}

impl SealingKey {
    /// Derive a sealing key from a passphrase over a fresh salt.
    ///
    /// # Errors
    /// - `KeyDerivation` on an empty passphrase or weak parameters
    pub fn from_passphrase(passphrase: &[u8], params: &KdfParams) -> Result<Self> {
        let (key, salt) = derive_key(Some(passphrase), params)?;
        Ok(Self {
            key,
            salt,
            mode: KeyMode::Passphrase,
            iterations: params.iterations,
            wrapped_key: Vec::new(),
        })
    }

    /// Use a random data key whose wrapped form travels with the envelope.
    pub fn wrapped(key: DataKey, salt: Salt, wrapped_key: Vec<u8>) -> Result<Self> {
        if wrapped_key.is_empty() || wrapped_key.len() > u16::MAX as usize {
            return Err(Error::InvalidInput(format!(
                "Wrapped key length {} out of range",
                wrapped_key.len()
            )));
        }
        Ok(Self {
            key,
            salt,
            mode: KeyMode::MasterKey,
            iterations: 0,
            wrapped_key,
        })
    }

    /// Key recovery mode this key produces.
    pub fn mode(&self) -> KeyMode {
        self.mode
    }
}

/// Credential able to open an envelope.
pub enum OpeningKey<'a> {
    /// Passphrase; the key is re-derived from the embedded salt.
    Passphrase(&'a [u8]),
    /// Already recovered data key.
    DataKey(&'a DataKey),
}

impl EncryptionEnvelope {
    /// Associated data covering every header field except the tag.
    fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(HEADER_FIXED_LEN - TAG_SIZE + self.wrapped_key.len());
        aad.extend_from_slice(MAGIC);
        aad.push(self.version);
        aad.push(self.key_mode.to_byte());
        aad.extend_from_slice(&self.iterations.to_be_bytes());
        aad.extend_from_slice(self.salt.as_bytes());
        aad.extend_from_slice(&self.iv);
        aad.extend_from_slice(&(self.wrapped_key.len() as u16).to_be_bytes());
        aad.extend_from_slice(&self.wrapped_key);
        aad
    }

    /// Serialize to the binary layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_FIXED_LEN + self.wrapped_key.len() + self.ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.push(self.version);
        out.push(self.key_mode.to_byte());
        out.extend_from_slice(&self.iterations.to_be_bytes());
        out.extend_from_slice(self.salt.as_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&(self.wrapped_key.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.wrapped_key);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the binary layout.
    ///
    /// # Errors
    /// - `Format` on bad magic, unsupported version, unknown key mode or truncation
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_FIXED_LEN {
            return Err(Error::Format(format!(
                "Envelope too short: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[..4] != MAGIC {
            return Err(Error::Format("Bad envelope magic".to_string()));
        }

        let mut reader = Reader::new(&bytes[4..]);
        let version = reader.u8()?;
        if version != FORMAT_VERSION {
            return Err(Error::Format(format!(
                "Unsupported envelope version {}",
                version
            )));
        }
        let key_mode = KeyMode::from_byte(reader.u8()?)?;
        let iterations = u32::from_be_bytes(reader.array()?);
        let salt = Salt::from_bytes(reader.array()?);
        let iv: [u8; IV_SIZE] = reader.array()?;
        let tag: [u8; TAG_SIZE] = reader.array()?;
        let wrapped_len = u16::from_be_bytes(reader.array()?) as usize;
        let wrapped_key = reader.take(wrapped_len)?.to_vec();
        let ciphertext = reader.rest().to_vec();

        match key_mode {
            KeyMode::Passphrase if !wrapped_key.is_empty() => {
                return Err(Error::Format(
                    "Passphrase envelope carries a wrapped key".to_string(),
                ));
            }
            KeyMode::MasterKey if wrapped_key.is_empty() => {
                return Err(Error::Format(
                    "Master-key envelope has no wrapped key".to_string(),
                ));
            }
            _ => {}
        }

        Ok(Self {
            version,
            key_mode,
            iterations,
            salt,
            iv,
            tag,
            wrapped_key,
            ciphertext,
        })
    }
}

/// Encrypt a payload into a new envelope under a fresh IV.
///
/// # Errors
/// - `Crypto` if the cipher fails
pub fn encrypt(plaintext: &[u8], key: &SealingKey) -> Result<EncryptionEnvelope> {
    let mut envelope = EncryptionEnvelope {
        version: FORMAT_VERSION,
        key_mode: key.mode,
        iterations: key.iterations,
        salt: key.salt.clone(),
        iv: aead::generate_iv(),
        tag: [0u8; TAG_SIZE],
        wrapped_key: key.wrapped_key.clone(),
        ciphertext: Vec::new(),
    };

    let aad = envelope.associated_data();
    let (ciphertext, tag) = aead::seal(&key.key, &envelope.iv, &aad, plaintext)?;
    envelope.ciphertext = ciphertext;
    envelope.tag = tag;

    debug!(
        key_mode = key.mode.as_str(),
        size = plaintext.len(),
        "Sealed envelope"
    );
    Ok(envelope)
}

/// Verify and decrypt an envelope.
///
/// # Errors
/// - `Integrity` if the tag does not verify, or the recorded iteration count
///   is outside the accepted range (checked before any key derivation)
/// - `KeyDerivation` if a passphrase is offered for a master-key envelope
pub fn decrypt(envelope: &EncryptionEnvelope, key: OpeningKey<'_>) -> Result<Vec<u8>> {
    let aad = envelope.associated_data();
    match key {
        OpeningKey::DataKey(data_key) => {
            aead::open(data_key, &envelope.iv, &aad, &envelope.ciphertext, &envelope.tag)
        }
        OpeningKey::Passphrase(passphrase) => {
            if envelope.key_mode != KeyMode::Passphrase {
                return Err(Error::KeyDerivation(
                    "Envelope was sealed under a master key".to_string(),
                ));
            }
            if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&envelope.iterations) {
                return Err(Error::Integrity(format!(
                    "Envelope iteration count {} is outside {}..={}",
                    envelope.iterations, MIN_ITERATIONS, MAX_ITERATIONS
                )));
            }
            let params = KdfParams::new(envelope.iterations)?;
            let data_key = derive_key_with_salt(passphrase, &envelope.salt, &params)?;
            aead::open(&data_key, &envelope.iv, &aad, &envelope.ciphertext, &envelope.tag)
        }
    }
}

/// Minimal cursor over envelope bytes.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(Error::Format("Envelope truncated".to_string()));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(self) -> &'a [u8] {
        self.bytes
    }
}
