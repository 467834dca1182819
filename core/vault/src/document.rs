//! Logical vault documents and their object representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use scanvault_common::{BackendKind, Error, MetadataMap, Result, StorageLocation, VaultAddress};
use scanvault_storage::ObjectInfo;

/// Object metadata keys written with every stored envelope.
pub mod keys {
    pub const ORIGINAL_FILE_ID: &str = "original_file_id";
    pub const ORIGINAL_FILE_NAME: &str = "original_file_name";
    pub const CONTENT_TYPE: &str = "content_type";
    pub const STORAGE_TIMESTAMP: &str = "storage_timestamp";
    pub const PLAINTEXT_SHA256: &str = "plaintext_sha256";
    pub const PLAINTEXT_SIZE: &str = "plaintext_size";
    pub const ENCRYPTED: &str = "encrypted";
    pub const ENCRYPTION_TYPE: &str = "encryption_type";
    pub const KEY_MODE: &str = "key_mode";
    pub const COMPLIANCE_LEVEL: &str = "compliance_level";
    pub const RETENTION_POLICY: &str = "retention_policy";

    /// Prefix for caller-supplied metadata.
    pub const CALLER_PREFIX: &str = "x-";
}

/// Encryption label stored with every object.
pub const ENCRYPTION_TYPE: &str = "FIPS_AES256_GCM";

/// Retention label matching the bucket lifecycle rule.
pub const RETENTION_POLICY: &str = "7_years";

/// Content type of stored envelopes.
pub const ENVELOPE_CONTENT_TYPE: &str = "application/octet-stream";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Hex SHA-256 of a plaintext.
pub fn plaintext_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Reject identifiers that would break object naming.
pub fn validate_source_id(source_id: &str) -> Result<()> {
    if source_id.is_empty() {
        return Err(Error::InvalidInput("Source id cannot be empty".to_string()));
    }
    if source_id.contains('/') || source_id.chars().any(char::is_control) {
        return Err(Error::InvalidInput(format!(
            "Source id '{}' contains a reserved character",
            source_id
        )));
    }
    Ok(())
}

/// A stored item and every copy of it.
///
/// Hybrid storage writes the same envelope to both backends, so every
/// location of a document decrypts to the same plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultDocument {
    /// Identity of the document in its originating system.
    pub source_id: String,
    pub name: String,
    pub content_type: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// When this version was stored.
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the plaintext.
    pub plaintext_sha256: String,
    /// Caller-supplied metadata (finding counts, risk label, ...).
    pub metadata: MetadataMap,
    /// Backends currently holding a copy.
    pub locations: Vec<StorageLocation>,
}

impl VaultDocument {
    /// Describe a new version of a document with no locations yet.
    pub fn new(
        source_id: impl Into<String>,
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: &[u8],
        metadata: MetadataMap,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            name: name.into(),
            content_type: content_type.into(),
            size: data.len() as u64,
            created_at: Utc::now(),
            plaintext_sha256: plaintext_digest(data),
            metadata,
            locations: Vec::new(),
        }
    }

    /// Whether `other` describes the same version of the same document.
    pub fn same_version(&self, other: &VaultDocument) -> bool {
        self.source_id == other.source_id
            && self.plaintext_sha256 == other.plaintext_sha256
            && self.created_at == other.created_at
    }

    /// Location on a backend, if any.
    pub fn location(&self, backend: BackendKind) -> Option<&StorageLocation> {
        self.locations.iter().find(|loc| loc.backend == backend)
    }

    /// Addresses of every copy.
    pub fn addresses(&self) -> Vec<VaultAddress> {
        self.locations.iter().map(StorageLocation::address).collect()
    }

    /// Backends in `wanted` that hold no copy yet.
    pub fn missing_backends(&self, wanted: &[BackendKind]) -> Vec<BackendKind> {
        wanted
            .iter()
            .copied()
            .filter(|backend| self.location(*backend).is_none())
            .collect()
    }

    /// Object key: `<prefix><source_id>/<yyyymmddThhmmssZ>_<name>`.
    pub fn object_key(&self, prefix: &str) -> String {
        let name = self.name.replace('/', "_");
        format!(
            "{}{}/{}_{}",
            prefix,
            self.source_id,
            self.created_at.format(TIMESTAMP_FORMAT),
            name
        )
    }

    /// Metadata stored alongside each copy.
    pub fn object_metadata(&self, key_mode: &str, compliance_level: &str) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        metadata.insert(keys::ORIGINAL_FILE_ID.into(), self.source_id.clone());
        metadata.insert(keys::ORIGINAL_FILE_NAME.into(), self.name.clone());
        metadata.insert(keys::CONTENT_TYPE.into(), self.content_type.clone());
        metadata.insert(keys::STORAGE_TIMESTAMP.into(), self.created_at.to_rfc3339());
        metadata.insert(keys::PLAINTEXT_SHA256.into(), self.plaintext_sha256.clone());
        metadata.insert(keys::PLAINTEXT_SIZE.into(), self.size.to_string());
        metadata.insert(keys::ENCRYPTED.into(), "true".into());
        metadata.insert(keys::ENCRYPTION_TYPE.into(), ENCRYPTION_TYPE.into());
        metadata.insert(keys::KEY_MODE.into(), key_mode.into());
        metadata.insert(keys::COMPLIANCE_LEVEL.into(), compliance_level.into());
        metadata.insert(keys::RETENTION_POLICY.into(), RETENTION_POLICY.into());
        for (key, value) in &self.metadata {
            metadata.insert(format!("{}{}", keys::CALLER_PREFIX, key), value.clone());
        }
        metadata
    }

    /// Recover a single-location document from a listed object.
    ///
    /// Returns `None` for objects not written by the vault.
    pub fn from_object(info: &ObjectInfo) -> Option<Self> {
        let meta = &info.metadata;
        let source_id = meta.get(keys::ORIGINAL_FILE_ID)?.clone();
        let created_at = DateTime::parse_from_rfc3339(meta.get(keys::STORAGE_TIMESTAMP)?)
            .ok()?
            .with_timezone(&Utc);
        let size = meta.get(keys::PLAINTEXT_SIZE)?.parse().ok()?;

        let metadata = meta
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(keys::CALLER_PREFIX)
                    .map(|key| (key.to_string(), value.clone()))
            })
            .collect();

        Some(Self {
            source_id,
            name: meta.get(keys::ORIGINAL_FILE_NAME).cloned().unwrap_or_default(),
            content_type: meta
                .get(keys::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| ENVELOPE_CONTENT_TYPE.to_string()),
            size,
            created_at,
            plaintext_sha256: meta.get(keys::PLAINTEXT_SHA256)?.clone(),
            metadata,
            locations: vec![info.location.clone()],
        })
    }
}
