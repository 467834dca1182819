//! Vault manager: the public surface over sealing, storage, catalog and audit.

use arc_swap::ArcSwap;
use futures::future::join_all;
use futures::TryStreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::catalog::{Catalog, DocumentPage};
use crate::config::{StoragePreference, VaultSettings};
use crate::document::{validate_source_id, VaultDocument, ENVELOPE_CONTENT_TYPE};
use crate::sealer::{KeySource, Sealer};
use scanvault_common::{BackendKind, Error, MetadataMap, Result, SensitiveBytes, VaultAddress};
use scanvault_crypto::KeyWrapper;
use scanvault_storage::{
    list_all, BucketPolicy, CloudKmsKeyWrapper, CredentialProvider, DeleteOutcome,
    DriveFolderBackend, GcsBucketBackend, Identity, PutObject, ResilientBackend, StorageBackend,
};

/// A document to be stored.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub source_id: String,
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
    pub metadata: MetadataMap,
}

impl StoreRequest {
    pub fn new(source_id: impl Into<String>, name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            source_id: source_id.into(),
            name: name.into(),
            content_type: ENVELOPE_CONTENT_TYPE.to_string(),
            data,
            metadata: MetadataMap::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A backend write that did not land.
#[derive(Debug)]
pub struct BackendFailure {
    pub backend: BackendKind,
    pub error: Error,
}

/// Result of a store.
#[derive(Debug)]
pub enum StoreOutcome {
    /// Every enabled backend holds a copy.
    Complete(VaultDocument),
    /// Some backends hold a copy; storing again writes only the missing ones.
    Partial {
        document: VaultDocument,
        failures: Vec<BackendFailure>,
    },
}

impl StoreOutcome {
    pub fn document(&self) -> &VaultDocument {
        match self {
            StoreOutcome::Complete(document) | StoreOutcome::Partial { document, .. } => document,
        }
    }

    pub fn into_document(self) -> VaultDocument {
        match self {
            StoreOutcome::Complete(document) | StoreOutcome::Partial { document, .. } => document,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, StoreOutcome::Partial { .. })
    }

    pub fn failures(&self) -> &[BackendFailure] {
        match self {
            StoreOutcome::Complete(_) => &[],
            StoreOutcome::Partial { failures, .. } => failures,
        }
    }
}

/// Aggregate counts reported by `get_statistics`.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatistics {
    pub document_count: u64,
    pub total_bytes: u64,
    pub per_backend_counts: BTreeMap<BackendKind, u64>,
    pub storage_preference: StoragePreference,
}

/// Security posture reported by `security_status`.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStatus {
    pub encryption: &'static str,
    pub key_derivation: &'static str,
    pub fips_mode: bool,
    pub compliance_level: &'static str,
    pub key_mode: &'static str,
    pub key_reference: Option<String>,
    pub storage_preference: StoragePreference,
    pub backends: Vec<BackendKind>,
    /// Bucket settings as reported by the bucket API, when reachable.
    pub bucket_policy: Option<BucketPolicy>,
    pub folder_id: Option<String>,
    pub audit_backend: BackendKind,
    pub audit_write_failures: u64,
}

/// The cloud adapters behind a connected vault.
#[derive(Default)]
struct Adapters {
    bucket: Option<Arc<GcsBucketBackend>>,
    folder: Option<Arc<DriveFolderBackend>>,
}

/// Vault manager.
///
/// Owns the only copy of the current storage preference. Each operation
/// reads it once on entry, so a change applies to later operations only.
pub struct VaultManager {
    settings: VaultSettings,
    preference: ArcSwap<StoragePreference>,
    backends: BTreeMap<BackendKind, Arc<ResilientBackend>>,
    sealer: Sealer,
    catalog: Catalog,
    audit: AuditLog,
    adapters: Adapters,
}

impl VaultManager {
    /// Assemble a vault over already constructed backends.
    ///
    /// Every backend is wrapped with the configured retry and timeout.
    ///
    /// # Errors
    /// - `Config` if the settings are invalid or a backend they name is missing
    pub fn new(
        settings: VaultSettings,
        backends: Vec<Arc<dyn StorageBackend>>,
        keys: KeySource,
    ) -> Result<Self> {
        settings.validate()?;

        let backends: BTreeMap<BackendKind, Arc<ResilientBackend>> = backends
            .into_iter()
            .map(|backend| {
                let kind = backend.kind();
                let wrapped = ResilientBackend::new(
                    backend,
                    settings.retry.to_retry_config(),
                    settings.call_timeout(),
                );
                (kind, Arc::new(wrapped))
            })
            .collect();

        for kind in settings.storage_preference.backends() {
            if !backends.contains_key(kind) {
                return Err(Error::Config(format!("No {} backend was provided", kind)));
            }
        }
        let audit_backend: Arc<dyn StorageBackend> = backends
            .get(&settings.audit.backend)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!("No {} backend for the audit log", settings.audit.backend))
            })?;

        info!(
            preference = %settings.storage_preference,
            key_mode = keys.key_mode().as_str(),
            fips = settings.fips_mode,
            "Vault manager ready"
        );

        Ok(Self {
            preference: ArcSwap::from_pointee(settings.storage_preference),
            audit: AuditLog::new(audit_backend, settings.audit.prefix.clone()),
            backends,
            sealer: Sealer::new(keys),
            catalog: Catalog::new(),
            adapters: Adapters::default(),
            settings,
        })
    }

    /// Build the cloud adapters named by the settings and assemble a vault.
    ///
    /// The bucket's access policy is enforced before the vault is returned.
    /// Data keys are wrapped by Cloud KMS when `kms_key_name` is set;
    /// otherwise `passphrase` is required.
    ///
    /// # Errors
    /// - `Config` if neither a KMS key nor a passphrase is available
    /// - Any backend error raised while enforcing the bucket policy
    pub async fn connect(
        settings: VaultSettings,
        credentials: Arc<dyn CredentialProvider>,
        identity: Identity,
        passphrase: Option<SensitiveBytes>,
    ) -> Result<Self> {
        settings.validate()?;

        let keys = match (&settings.kms_key_name, passphrase) {
            (Some(key_name), _) => {
                let wrapper: Arc<dyn KeyWrapper> =
                    Arc::new(CloudKmsKeyWrapper::new(key_name.clone(), credentials.clone())?);
                KeySource::master_key(wrapper)
            }
            (None, Some(passphrase)) => KeySource::passphrase(passphrase, settings.kdf_iterations)?,
            (None, None) => {
                return Err(Error::Config(
                    "Either kms_key_name or a passphrase is required".to_string(),
                ))
            }
        };

        let mut adapters = Adapters::default();
        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();

        if let Some(config) = &settings.bucket {
            let bucket = Arc::new(GcsBucketBackend::new(
                config.clone(),
                credentials.clone(),
                identity.clone(),
            )?);
            let policy = bucket.ensure_bucket().await?;
            info!(bucket = bucket.bucket(), ?policy, "Bucket policy enforced");
            backends.push(bucket.clone());
            adapters.bucket = Some(bucket);
        }
        if let Some(config) = &settings.folder {
            let folder = Arc::new(DriveFolderBackend::new(
                config.clone(),
                credentials.clone(),
                identity.clone(),
            )?);
            backends.push(folder.clone());
            adapters.folder = Some(folder);
        }

        let mut manager = Self::new(settings, backends, keys)?;
        manager.adapters = adapters;
        Ok(manager)
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Current storage preference.
    pub fn storage_preference(&self) -> StoragePreference {
        **self.preference.load()
    }

    /// Change the preference for subsequent operations.
    ///
    /// # Errors
    /// - `Config` if the preference needs a backend this vault does not have
    pub fn set_storage_preference(&self, preference: StoragePreference) -> Result<()> {
        for kind in preference.backends() {
            if !self.backends.contains_key(kind) {
                return Err(Error::Config(format!(
                    "Cannot switch to '{}': no {} backend",
                    preference, kind
                )));
            }
        }
        self.preference.store(Arc::new(preference));
        info!(preference = %preference, "Storage preference changed");
        Ok(())
    }

    fn actor(&self) -> &str {
        &self.settings.actor
    }

    fn backend(&self, kind: BackendKind) -> Option<&Arc<ResilientBackend>> {
        self.backends.get(&kind)
    }

    /// Store a document on every backend enabled by the current preference.
    pub async fn store(
        &self,
        source_id: &str,
        name: &str,
        data: &[u8],
        metadata: MetadataMap,
    ) -> Result<StoreOutcome> {
        let request = StoreRequest::new(source_id, name, data.to_vec()).with_metadata(metadata);
        self.store_with(request, &CancellationToken::new()).await
    }

    /// Store a document, abandoning outstanding uploads when `cancel` fires.
    ///
    /// The plaintext is sealed once and the same envelope is written to each
    /// backend independently. Copies that land are kept even when another
    /// backend fails. Storing unchanged content again writes only to backends
    /// that are still missing a copy.
    ///
    /// # Errors
    /// - `InvalidInput` on an unusable source id or name
    /// - Sealing errors, which are never retried
    /// - The first backend error when no backend accepted the document
    pub async fn store_with(
        &self,
        request: StoreRequest,
        cancel: &CancellationToken,
    ) -> Result<StoreOutcome> {
        validate_source_id(&request.source_id)?;
        if request.name.is_empty() {
            return Err(Error::InvalidInput("Document name cannot be empty".to_string()));
        }

        let preference = self.storage_preference();
        let enabled = preference.backends();

        let candidate = VaultDocument::new(
            request.source_id.clone(),
            request.name.clone(),
            request.content_type.clone(),
            &request.data,
            request.metadata.clone(),
        );

        let (version, targets) = match self.catalog.get(&request.source_id).await {
            Some(existing) if existing.plaintext_sha256 == candidate.plaintext_sha256 => {
                let missing = existing.missing_backends(enabled);
                if missing.is_empty() {
                    debug!(source_id = %request.source_id, "Document already stored");
                    return Ok(StoreOutcome::Complete(existing));
                }
                (existing, missing)
            }
            _ => (candidate, enabled.to_vec()),
        };

        let sealed = match self.sealer.seal(&request.data).await {
            Ok(sealed) => sealed,
            Err(err) => {
                self.audit.record(
                    AuditEntry::new(AuditAction::Store, &request.source_id, self.actor())
                        .failed(&err),
                );
                return Err(err);
            }
        };

        let key = version.object_key(&self.settings.document_prefix);
        let metadata = version.object_metadata(
            self.sealer.key_source().key_mode().as_str(),
            self.settings.compliance_level(),
        );
        let object = PutObject::new(key, sealed, ENVELOPE_CONTENT_TYPE).with_metadata(metadata);

        let writes = targets.iter().map(|kind| {
            let object = object.clone();
            let version = &version;
            async move {
                let result = match self.backend(*kind) {
                    Some(backend) => backend.put_cancellable(object, cancel).await,
                    None => Err(Error::Config(format!("No {} backend", kind))),
                };
                let entry = AuditEntry::new(AuditAction::Store, &version.source_id, self.actor())
                    .with_backend(*kind);
                match result {
                    Ok(location) => {
                        let address = location.address().to_string();
                        self.catalog.record_location(version, location).await;
                        self.audit.record(entry.with_address(&address));
                        info!(source_id = %version.source_id, address = %address, "Document stored");
                        Ok(())
                    }
                    Err(error) => {
                        self.audit.record(entry.failed(&error));
                        warn!(
                            source_id = %version.source_id,
                            backend = %kind,
                            error = %error,
                            "Backend write failed"
                        );
                        Err(BackendFailure {
                            backend: *kind,
                            error,
                        })
                    }
                }
            }
        });

        let failures: Vec<BackendFailure> = join_all(writes)
            .await
            .into_iter()
            .filter_map(|result| result.err())
            .collect();

        let stored = self
            .catalog
            .get(&version.source_id)
            .await
            .filter(|doc| doc.same_version(&version) && !doc.locations.is_empty());

        match stored {
            None => Err(failures
                .into_iter()
                .next()
                .map(|failure| failure.error)
                .unwrap_or_else(|| Error::Storage("No backend accepted the document".to_string()))),
            Some(document) if failures.is_empty() => Ok(StoreOutcome::Complete(document)),
            Some(document) => Ok(StoreOutcome::Partial { document, failures }),
        }
    }

    /// Fetch and decrypt the object at `address`.
    ///
    /// # Errors
    /// - `MalformedAddress` if the address does not parse
    /// - `NotFound` if nothing is stored there
    /// - `Integrity` if the stored envelope fails verification
    pub async fn retrieve(&self, address: &str) -> Result<Vec<u8>> {
        let parsed = VaultAddress::parse(address)?;
        let result = self.retrieve_parsed(&parsed).await;
        self.audit.record(
            AuditEntry::new(AuditAction::Retrieve, address, self.actor())
                .with_backend(parsed.backend())
                .outcome_of(&result),
        );
        result
    }

    async fn retrieve_parsed(&self, address: &VaultAddress) -> Result<Vec<u8>> {
        let backend = self
            .backend(address.backend())
            .ok_or_else(|| Error::NotFound(address.to_string()))?;
        let sealed = backend
            .get(address.native_path())
            .await
            .map_err(|err| not_found_as(err, address))?;
        let plaintext = self.sealer.open(&sealed).await?;
        debug!(address = %address, size = plaintext.len(), "Document retrieved");
        Ok(plaintext)
    }

    /// One page of documents whose source id starts with `prefix`.
    pub async fn list(&self, prefix: &str, page_token: Option<&str>) -> Result<DocumentPage> {
        self.list_page(prefix, page_token, self.settings.list_page_size)
            .await
    }

    /// `list` with an explicit page size.
    pub async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<DocumentPage> {
        if page_size == 0 {
            return Err(Error::InvalidInput("Page size must be positive".to_string()));
        }
        let page = self.catalog.page(prefix, page_token, page_size).await;
        self.audit
            .record(AuditEntry::new(AuditAction::List, prefix, self.actor()));
        Ok(page)
    }

    /// Remove the object at `address`.
    ///
    /// # Errors
    /// - `MalformedAddress` if the address does not parse
    /// - Backend errors other than a missing object
    pub async fn delete(&self, address: &str) -> Result<DeleteOutcome> {
        let parsed = VaultAddress::parse(address)?;
        let result = self.delete_parsed(&parsed).await;

        let entry = AuditEntry::new(AuditAction::Delete, address, self.actor())
            .with_backend(parsed.backend());
        let entry = match &result {
            Ok(DeleteOutcome::Deleted) => entry,
            Ok(DeleteOutcome::NotFound) => entry.failed("not found"),
            Err(err) => entry.failed(err),
        };
        self.audit.record(entry);
        result
    }

    async fn delete_parsed(&self, address: &VaultAddress) -> Result<DeleteOutcome> {
        let Some(backend) = self.backend(address.backend()) else {
            return Ok(DeleteOutcome::NotFound);
        };
        let outcome = match backend.delete(address.native_path()).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_not_found() => DeleteOutcome::NotFound,
            Err(err) => return Err(err),
        };
        self.catalog.remove_location(address).await;
        if outcome == DeleteOutcome::Deleted {
            info!(address = %address, "Document copy deleted");
        }
        Ok(outcome)
    }

    /// Delete every copy of a document.
    ///
    /// # Errors
    /// - `NotFound` if the catalog has no document for `source_id`
    pub async fn delete_document(&self, source_id: &str) -> Result<Vec<(VaultAddress, DeleteOutcome)>> {
        let document = self
            .catalog
            .get(source_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("Document '{}'", source_id)))?;

        let mut outcomes = Vec::with_capacity(document.locations.len());
        for address in document.addresses() {
            let outcome = self.delete(&address.to_string()).await?;
            outcomes.push((address, outcome));
        }
        Ok(outcomes)
    }

    /// Document counts and sizes from the catalog.
    pub async fn get_statistics(&self) -> VaultStatistics {
        let stats = self.catalog.stats().await;
        VaultStatistics {
            document_count: stats.document_count,
            total_bytes: stats.total_bytes,
            per_backend_counts: stats.per_backend_counts,
            storage_preference: self.storage_preference(),
        }
    }

    /// Summarize encryption, key handling and backend lockdown.
    pub async fn security_status(&self) -> SecurityStatus {
        let bucket_policy = match &self.adapters.bucket {
            Some(bucket) => match bucket.policy().await {
                Ok(policy) => Some(policy),
                Err(err) => {
                    warn!(error = %err, "Could not read bucket policy");
                    None
                }
            },
            None => None,
        };
        let folder_id = match &self.adapters.folder {
            Some(folder) => match folder.folder_id().await {
                Ok(id) => Some(id.to_string()),
                Err(err) => {
                    warn!(error = %err, "Could not resolve vault folder");
                    None
                }
            },
            None => None,
        };

        let keys = self.sealer.key_source();
        SecurityStatus {
            encryption: "AES-256-GCM",
            key_derivation: "PBKDF2-HMAC-SHA256",
            fips_mode: self.settings.fips_mode,
            compliance_level: self.settings.compliance_level(),
            key_mode: keys.key_mode().as_str(),
            key_reference: keys.key_reference().map(str::to_string),
            storage_preference: self.storage_preference(),
            backends: self.backends.keys().copied().collect(),
            bucket_policy,
            folder_id,
            audit_backend: self.audit.backend_kind(),
            audit_write_failures: self.audit.write_failures(),
        }
    }

    /// Rebuild the catalog from object metadata on every backend.
    ///
    /// Returns the number of documents found.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let mut recovered = Vec::new();
        for backend in self.backends.values() {
            let objects: Vec<_> = list_all(
                backend.as_ref(),
                &self.settings.document_prefix,
                self.settings.list_page_size,
            )
            .try_collect()
            .await?;
            recovered.extend(objects.iter().filter_map(VaultDocument::from_object));
        }

        let count = self.catalog.rebuild(recovered).await;
        info!(documents = count, "Catalog rebuilt from backends");
        Ok(count)
    }
}

/// Replace a backend's not-found error with one naming only the address.
fn not_found_as(err: Error, address: &VaultAddress) -> Error {
    if err.is_not_found() {
        Error::NotFound(address.to_string())
    } else {
        err
    }
}
