//! Vault settings.
//!
//! Settings are read once at process start (JSON file plus environment
//! overlay) and injected into the vault manager. Components never read
//! ambient configuration themselves.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use scanvault_common::{BackendKind, Error, Result};
use scanvault_crypto::{MAX_ITERATIONS, MIN_ITERATIONS};
use scanvault_storage::{BucketConfig, FolderConfig, RetryConfig};

/// Highest retry count accepted.
pub const MAX_RETRIES: u32 = 10;

/// Which backends receive new documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoragePreference {
    /// Bucket only.
    Bucket,
    /// Folder only.
    Folder,
    /// Both backends, written independently.
    Hybrid,
}

impl StoragePreference {
    /// Backends enabled by this preference, in write order.
    pub fn backends(&self) -> &'static [BackendKind] {
        match self {
            StoragePreference::Bucket => &[BackendKind::Bucket],
            StoragePreference::Folder => &[BackendKind::Folder],
            StoragePreference::Hybrid => &BackendKind::ALL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoragePreference::Bucket => "bucket",
            StoragePreference::Folder => "folder",
            StoragePreference::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for StoragePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoragePreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bucket" | "gcs" => Ok(StoragePreference::Bucket),
            "folder" | "drive" => Ok(StoragePreference::Folder),
            "hybrid" => Ok(StoragePreference::Hybrid),
            other => Err(Error::Config(format!("Unknown storage preference '{}'", other))),
        }
    }
}

/// Backoff settings applied to every backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetrySettings {
    /// Convert to the storage layer's retry configuration.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.max_retries,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Migration thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Documents with at least this many findings are moved into the vault.
    pub min_findings: u32,
    /// Finding count at which a document is rated high risk.
    pub high_risk_findings: u32,
    /// Remove the source copy once every enabled backend holds the document.
    pub remove_source: bool,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            min_findings: 1,
            high_risk_findings: 10,
            remove_source: false,
        }
    }
}

/// Where audit period objects are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub backend: BackendKind,
    pub prefix: String,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Bucket,
            prefix: "audit_logs/".to_string(),
        }
    }
}

/// Process-wide vault settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    /// Backends new documents are written to.
    pub storage_preference: StoragePreference,
    /// Label stored objects as FIPS 140-2 compliant.
    pub fips_mode: bool,
    /// Actor recorded in audit entries.
    pub actor: String,
    /// Bucket backend; `None` disables it.
    pub bucket: Option<BucketConfig>,
    /// Folder backend; `None` disables it.
    pub folder: Option<FolderConfig>,
    /// Cloud KMS key wrapping data keys. Without it, a passphrase is required.
    pub kms_key_name: Option<String>,
    pub kdf_iterations: u32,
    pub retry: RetrySettings,
    /// Per-call backend deadline.
    pub call_timeout_secs: u64,
    pub migration: MigrationSettings,
    pub audit: AuditSettings,
    pub list_page_size: usize,
    /// Key prefix for document objects.
    pub document_prefix: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            storage_preference: StoragePreference::Hybrid,
            fips_mode: true,
            actor: "vault-service".to_string(),
            bucket: Some(BucketConfig::default()),
            folder: Some(FolderConfig::default()),
            kms_key_name: None,
            kdf_iterations: MIN_ITERATIONS,
            retry: RetrySettings::default(),
            call_timeout_secs: 30,
            migration: MigrationSettings::default(),
            audit: AuditSettings::default(),
            list_page_size: 100,
            document_prefix: "documents/".to_string(),
        }
    }
}

impl VaultSettings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Serialization` if it is not valid settings JSON
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Parse settings from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize settings to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`.
    ///
    /// Recognized variables: `VAULT_BUCKET`, `VAULT_STORAGE_PREFERENCE`,
    /// `FIPS_ENABLED`, `DRIVE_VAULT_FOLDER_ID`, `DRIVE_VAULT_FOLDER_NAME`,
    /// `KMS_KEY_NAME`.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bucket) = lookup("VAULT_BUCKET") {
            self.bucket.get_or_insert_with(BucketConfig::default).bucket = bucket;
        }
        if let Some(preference) = lookup("VAULT_STORAGE_PREFERENCE") {
            self.storage_preference = preference.parse()?;
        }
        if let Some(fips) = lookup("FIPS_ENABLED") {
            self.fips_mode = fips.trim().eq_ignore_ascii_case("true");
        }
        if let Some(folder_id) = lookup("DRIVE_VAULT_FOLDER_ID") {
            self.folder.get_or_insert_with(FolderConfig::default).folder_id = Some(folder_id);
        }
        if let Some(name) = lookup("DRIVE_VAULT_FOLDER_NAME") {
            self.folder.get_or_insert_with(FolderConfig::default).folder_name = name;
        }
        if let Some(key) = lookup("KMS_KEY_NAME") {
            self.kms_key_name = Some(key);
        }
        Ok(self)
    }

    /// Whether a backend has settings.
    pub fn is_configured(&self, backend: BackendKind) -> bool {
        match backend {
            BackendKind::Bucket => self.bucket.is_some(),
            BackendKind::Folder => self.folder.is_some(),
        }
    }

    /// Check the settings for consistency.
    ///
    /// # Errors
    /// - `Config` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&self.kdf_iterations) {
            return Err(Error::Config(format!(
                "kdf_iterations must be between {} and {}",
                MIN_ITERATIONS, MAX_ITERATIONS
            )));
        }
        if self.retry.max_retries > MAX_RETRIES {
            return Err(Error::Config(format!(
                "retry.max_retries must not exceed {}",
                MAX_RETRIES
            )));
        }
        if self.list_page_size == 0 {
            return Err(Error::Config("list_page_size must be positive".to_string()));
        }
        if self.call_timeout_secs == 0 {
            return Err(Error::Config("call_timeout_secs must be positive".to_string()));
        }
        if self.migration.min_findings == 0 {
            return Err(Error::Config("migration.min_findings must be positive".to_string()));
        }
        for backend in self.storage_preference.backends() {
            if !self.is_configured(*backend) {
                return Err(Error::Config(format!(
                    "Storage preference '{}' needs the {} backend, which is not configured",
                    self.storage_preference, backend
                )));
            }
        }
        if !self.is_configured(self.audit.backend) {
            return Err(Error::Config(format!(
                "Audit backend {} is not configured",
                self.audit.backend
            )));
        }
        Ok(())
    }

    /// Per-call backend deadline.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Compliance label stored with every object.
    pub fn compliance_level(&self) -> &'static str {
        if self.fips_mode {
            "FIPS_140_2"
        } else {
            "STANDARD"
        }
    }
}
