//! In-memory storage backend for tests and local runs.
//!
//! Can stand in for either backend kind and supports fault injection so
//! retry, partial-write and cancellation paths can be exercised without
//! network access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{DeleteOutcome, ListPage, ObjectInfo, PutObject, StorageBackend};
use scanvault_common::{BackendKind, Error, MetadataMap, Result, StorageLocation};

/// Injected failure behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call succeeds.
    Healthy,
    /// The next `n` calls fail with a transient network error.
    Transient(u32),
    /// Every call fails with a transient network error.
    Down,
    /// Every call fails with a permanent storage error.
    Rejecting,
}

#[derive(Debug, Clone)]
struct StoredObject {
    native_path: String,
    data: Vec<u8>,
    content_type: String,
    metadata: MetadataMap,
    stored_at: DateTime<Utc>,
}

impl StoredObject {
    fn info(&self, kind: BackendKind, key: &str) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            location: StorageLocation {
                backend: kind,
                native_path: self.native_path.clone(),
                stored_at: self.stored_at,
            },
            size: self.data.len() as u64,
            content_type: self.content_type.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// In-memory storage backend.
///
/// All data is lost on drop. Objects are keyed by their logical key; folder
/// mode hands out `<container>/<id>` native paths like the Drive adapter.
pub struct MemoryBackend {
    kind: BackendKind,
    container: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    fault: RwLock<Fault>,
    put_delay: RwLock<Option<Duration>>,
    put_attempts: AtomicU64,
    discards: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend of the given kind.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            container: "memory-vault".to_string(),
            objects: RwLock::new(BTreeMap::new()),
            fault: RwLock::new(Fault::Healthy),
            put_delay: RwLock::new(None),
            put_attempts: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    /// Create an in-memory bucket.
    pub fn bucket() -> Self {
        Self::new(BackendKind::Bucket)
    }

    /// Create an in-memory folder.
    pub fn folder() -> Self {
        Self::new(BackendKind::Folder)
    }

    /// Change the injected failure behavior.
    pub async fn set_fault(&self, fault: Fault) {
        *self.fault.write().await = fault;
    }

    /// Make `put` hang for `delay` after writing, as if the upload stalled
    /// before being finalized.
    pub async fn set_put_delay(&self, delay: Option<Duration>) {
        *self.put_delay.write().await = delay;
    }

    /// Number of `put` calls that reached the backend, failed ones included.
    pub fn put_attempts(&self) -> u64 {
        self.put_attempts.load(Ordering::SeqCst)
    }

    /// Number of `discard` calls.
    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::SeqCst)
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Whether an object is stored under `key`.
    pub async fn contains_key(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    async fn check_fault(&self, operation: &str) -> Result<()> {
        let mut fault = self.fault.write().await;
        match *fault {
            Fault::Healthy => Ok(()),
            Fault::Transient(remaining) => {
                *fault = if remaining <= 1 {
                    Fault::Healthy
                } else {
                    Fault::Transient(remaining - 1)
                };
                Err(Error::Network(format!("Injected transient failure on {}", operation)))
            }
            Fault::Down => Err(Error::Network(format!("{} backend is down", self.kind))),
            Fault::Rejecting => Err(Error::Storage(format!("Injected rejection of {}", operation))),
        }
    }

    fn native_path_for(&self, existing: Option<&StoredObject>, key: &str) -> String {
        match (self.kind, existing) {
            (_, Some(object)) => object.native_path.clone(),
            (BackendKind::Bucket, None) => key.to_string(),
            (BackendKind::Folder, None) => format!("{}/{}", self.container, Uuid::new_v4().simple()),
        }
    }

    fn by_native_path<'a>(
        objects: &'a BTreeMap<String, StoredObject>,
        native_path: &str,
    ) -> Option<(&'a String, &'a StoredObject)> {
        objects.iter().find(|(_, object)| object.native_path == native_path)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn put(&self, object: PutObject) -> Result<StorageLocation> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_fault("put").await?;

        let location = {
            let mut objects = self.objects.write().await;
            let native_path = self.native_path_for(objects.get(&object.key), &object.key);
            let stored = StoredObject {
                native_path: native_path.clone(),
                data: object.data,
                content_type: object.content_type,
                metadata: object.metadata,
                stored_at: Utc::now(),
            };
            let location = StorageLocation {
                backend: self.kind,
                native_path,
                stored_at: stored.stored_at,
            };
            objects.insert(object.key, stored);
            location
        };

        let delay = *self.put_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(location)
    }

    async fn get(&self, native_path: &str) -> Result<Vec<u8>> {
        self.check_fault("get").await?;
        let objects = self.objects.read().await;
        Self::by_native_path(&objects, native_path)
            .map(|(_, object)| object.data.clone())
            .ok_or_else(|| Error::NotFound(format!("Object not found: {}", native_path)))
    }

    async fn head(&self, native_path: &str) -> Result<ObjectInfo> {
        self.check_fault("head").await?;
        let objects = self.objects.read().await;
        Self::by_native_path(&objects, native_path)
            .map(|(key, object)| object.info(self.kind, key))
            .ok_or_else(|| Error::NotFound(format!("Object not found: {}", native_path)))
    }

    async fn find(&self, key: &str) -> Result<Option<ObjectInfo>> {
        self.check_fault("find").await?;
        let objects = self.objects.read().await;
        Ok(objects.get(key).map(|object| object.info(self.kind, key)))
    }

    async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage> {
        self.check_fault("list").await?;
        if page_size == 0 {
            return Err(Error::InvalidInput("Page size must be positive".to_string()));
        }

        let objects = self.objects.read().await;
        let lower = match page_token {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut matching = objects
            .range::<String, _>((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix));

        let page: Vec<ObjectInfo> = matching
            .by_ref()
            .take(page_size)
            .map(|(key, object)| object.info(self.kind, key))
            .collect();

        let next_page_token = match (matching.next(), page.last()) {
            (Some(_), Some(last)) => Some(last.key.clone()),
            _ => None,
        };

        Ok(ListPage {
            objects: page,
            next_page_token,
        })
    }

    async fn delete(&self, native_path: &str) -> Result<DeleteOutcome> {
        self.check_fault("delete").await?;
        let mut objects = self.objects.write().await;
        let key = match Self::by_native_path(&objects, native_path) {
            Some((key, _)) => key.clone(),
            None => return Ok(DeleteOutcome::NotFound),
        };
        objects.remove(&key);
        Ok(DeleteOutcome::Deleted)
    }

    async fn discard(&self, key: &str) -> Result<()> {
        self.discards.fetch_add(1, Ordering::SeqCst);
        self.objects.write().await.remove(key);
        Ok(())
    }
}
