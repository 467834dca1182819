//! Storage backend trait definition.

use async_trait::async_trait;
use futures::stream::{self, Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use scanvault_common::{BackendKind, Error, MetadataMap, Result, StorageLocation};

/// A stored object as reported by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Logical key the object was written under.
    pub key: String,
    /// Where the object lives.
    pub location: StorageLocation,
    /// Size of the stored (encrypted) bytes.
    pub size: u64,
    /// Content type recorded at upload.
    pub content_type: String,
    /// Backend-side object metadata.
    pub metadata: MetadataMap,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects on this page, ordered by key.
    pub objects: Vec<ObjectInfo>,
    /// Token resuming the listing after this page, if more remain.
    pub next_page_token: Option<String>,
}

/// Result of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object existed and was removed.
    Deleted,
    /// Nothing was stored at that location.
    NotFound,
}

/// An object to be written.
#[derive(Debug, Clone)]
pub struct PutObject {
    /// Logical key (object name or file name).
    pub key: String,
    /// Opaque bytes, usually a serialized envelope.
    pub data: Vec<u8>,
    /// Content type to record.
    pub content_type: String,
    /// Metadata stored alongside the object.
    pub metadata: MetadataMap,
}

impl PutObject {
    /// Create a put request with no metadata.
    pub fn new(key: impl Into<String>, data: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data,
            content_type: content_type.into(),
            metadata: MetadataMap::new(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Uniform capability over one physical storage system.
///
/// Implementations report transient failures as `Network`, `RateLimited` or
/// `Timeout` so callers can retry them, and everything else as permanent.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which backend variant this is.
    fn kind(&self) -> BackendKind;

    /// Write an object, replacing any object already stored under the same key.
    ///
    /// # Postconditions
    /// - Returns the location the object can be read back from
    async fn put(&self, object: PutObject) -> Result<StorageLocation>;

    /// Read an object's bytes.
    ///
    /// # Errors
    /// - `NotFound` if nothing is stored at `native_path`
    async fn get(&self, native_path: &str) -> Result<Vec<u8>>;

    /// Read an object's description without its bytes.
    ///
    /// # Errors
    /// - `NotFound` if nothing is stored at `native_path`
    async fn head(&self, native_path: &str) -> Result<ObjectInfo>;

    /// Look up the object stored under exactly `key`.
    ///
    /// Returns `Ok(None)` when no such object exists. Unlike a listing, the
    /// answer does not depend on what else shares the key's prefix.
    async fn find(&self, key: &str) -> Result<Option<ObjectInfo>>;

    /// List objects whose key starts with `prefix`, one page at a time.
    ///
    /// Pages are ordered by key; passing back `next_page_token` resumes the
    /// listing where it stopped.
    async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage>;

    /// Remove an object.
    async fn delete(&self, native_path: &str) -> Result<DeleteOutcome>;

    /// Best-effort removal of whatever a cancelled `put` under `key` left
    /// behind. Errors are swallowed by callers.
    async fn discard(&self, key: &str) -> Result<()>;
}

/// Stream of listed objects.
pub type ObjectStream<'a> = Pin<Box<dyn Stream<Item = Result<ObjectInfo>> + Send + 'a>>;

/// Lazily walk every page of a listing.
///
/// Pages are fetched only as the stream is polled. A listing interrupted by an
/// error can be restarted from the last page token the caller observed.
pub fn list_all<'a>(
    backend: &'a dyn StorageBackend,
    prefix: &'a str,
    page_size: usize,
) -> ObjectStream<'a> {
    let pages = stream::try_unfold(Some(None), move |cursor| {
        next_page(backend, prefix, page_size, cursor)
    });
    Box::pin(
        pages
            .map_ok(|objects| stream::iter(objects.into_iter().map(Ok::<_, Error>)))
            .try_flatten(),
    )
}

/// `cursor` is `None` once the last page was returned.
async fn next_page(
    backend: &dyn StorageBackend,
    prefix: &str,
    page_size: usize,
    cursor: Option<Option<String>>,
) -> Result<Option<(Vec<ObjectInfo>, Option<Option<String>>)>> {
    let Some(token) = cursor else {
        return Ok(None);
    };
    let page = backend.list_page(prefix, token.as_deref(), page_size).await?;
    Ok(Some((page.objects, page.next_page_token.map(Some))))
}
