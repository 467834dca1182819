//! In-process index of vault documents.
//!
//! The catalog is a cache: every entry can be rebuilt from backend object
//! metadata, so no state lives only here.

use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Bound;
use tokio::sync::RwLock;

use crate::document::VaultDocument;
use scanvault_common::{BackendKind, StorageLocation, VaultAddress};

/// One page of documents.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentPage {
    pub documents: Vec<VaultDocument>,
    /// Pass back to continue after this page.
    pub next_page_token: Option<String>,
}

/// Aggregate counts over the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub document_count: u64,
    /// Sum of plaintext sizes.
    pub total_bytes: u64,
    /// Documents holding a copy on each backend.
    pub per_backend_counts: BTreeMap<BackendKind, u64>,
}

/// Documents keyed by source id.
#[derive(Default)]
pub struct Catalog {
    documents: RwLock<BTreeMap<String, VaultDocument>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a document.
    pub async fn get(&self, source_id: &str) -> Option<VaultDocument> {
        self.documents.read().await.get(source_id).cloned()
    }

    /// Record a freshly written copy of `version`.
    ///
    /// A different version already in the catalog is superseded. Returns the
    /// document as it stands after the update.
    pub async fn record_location(
        &self,
        version: &VaultDocument,
        location: StorageLocation,
    ) -> VaultDocument {
        let mut documents = self.documents.write().await;
        let entry = documents
            .entry(version.source_id.clone())
            .or_insert_with(|| VaultDocument {
                locations: Vec::new(),
                ..version.clone()
            });

        if !entry.same_version(version) {
            *entry = VaultDocument {
                locations: Vec::new(),
                ..version.clone()
            };
        }

        entry.locations.retain(|loc| loc.backend != location.backend);
        entry.locations.push(location);
        entry.locations.sort_by_key(|loc| loc.backend);
        entry.clone()
    }

    /// Find the document owning an address.
    pub async fn find_by_address(&self, address: &VaultAddress) -> Option<VaultDocument> {
        self.documents
            .read()
            .await
            .values()
            .find(|doc| owns(doc, address))
            .cloned()
    }

    /// Drop one location. A document left without locations is removed.
    pub async fn remove_location(&self, address: &VaultAddress) -> Option<VaultDocument> {
        let mut documents = self.documents.write().await;
        let source_id = documents
            .values()
            .find(|doc| owns(doc, address))
            .map(|doc| doc.source_id.clone())?;

        let doc = documents.get_mut(&source_id)?;
        doc.locations.retain(|loc| {
            !(loc.backend == address.backend() && loc.native_path == address.native_path())
        });
        let updated = doc.clone();
        if updated.locations.is_empty() {
            documents.remove(&source_id);
        }
        Some(updated)
    }

    /// Page through documents whose source id starts with `prefix`.
    ///
    /// The page token is the last source id returned, so pages never overlap
    /// and documents added behind the cursor do not shift later pages.
    pub async fn page(&self, prefix: &str, page_token: Option<&str>, page_size: usize) -> DocumentPage {
        let documents = self.documents.read().await;
        let start = match page_token {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut matched = documents
            .range((start, Bound::Unbounded))
            .take_while(|(source_id, _)| source_id.starts_with(prefix))
            .map(|(_, doc)| doc.clone());

        let page: Vec<VaultDocument> = matched.by_ref().take(page_size).collect();
        let next_page_token = if page.len() == page_size && matched.next().is_some() {
            page.last().map(|doc| doc.source_id.clone())
        } else {
            None
        };

        DocumentPage {
            documents: page,
            next_page_token,
        }
    }

    /// Aggregate counts.
    pub async fn stats(&self) -> CatalogStats {
        let documents = self.documents.read().await;
        let mut stats = CatalogStats::default();
        for doc in documents.values() {
            stats.document_count += 1;
            stats.total_bytes += doc.size;
            for loc in &doc.locations {
                *stats.per_backend_counts.entry(loc.backend).or_default() += 1;
            }
        }
        stats
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Replace the catalog with documents recovered from single-location
    /// object records.
    ///
    /// Copies of the same version on different backends are merged; for each
    /// source id only the newest version is kept.
    pub async fn rebuild(&self, recovered: Vec<VaultDocument>) -> usize {
        let mut rebuilt: BTreeMap<String, VaultDocument> = BTreeMap::new();
        for doc in recovered {
            match rebuilt.get_mut(&doc.source_id) {
                None => {
                    rebuilt.insert(doc.source_id.clone(), doc);
                }
                Some(current) if current.same_version(&doc) => {
                    for loc in doc.locations {
                        if current.location(loc.backend).is_none() {
                            current.locations.push(loc);
                        }
                    }
                    current.locations.sort_by_key(|loc| loc.backend);
                }
                Some(current) if doc.created_at > current.created_at => *current = doc,
                Some(_) => {}
            }
        }

        let count = rebuilt.len();
        *self.documents.write().await = rebuilt;
        count
    }
}

fn owns(doc: &VaultDocument, address: &VaultAddress) -> bool {
    doc.locations
        .iter()
        .any(|loc| loc.backend == address.backend() && loc.native_path == address.native_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use scanvault_common::MetadataMap;

    fn doc(source_id: &str, data: &[u8]) -> VaultDocument {
        VaultDocument::new(source_id, "name.txt", "text/plain", data, MetadataMap::new())
    }

    #[tokio::test]
    async fn test_record_location_merges_backends() {
        let catalog = Catalog::new();
        let version = doc("a", b"data");

        catalog
            .record_location(&version, StorageLocation::new(BackendKind::Folder, "f/1"))
            .await;
        let merged = catalog
            .record_location(&version, StorageLocation::new(BackendKind::Bucket, "documents/a"))
            .await;

        assert_eq!(merged.locations.len(), 2);
        assert_eq!(merged.locations[0].backend, BackendKind::Bucket);
    }

    #[tokio::test]
    async fn test_new_version_supersedes_old() {
        let catalog = Catalog::new();
        let old = doc("a", b"v1");
        catalog
            .record_location(&old, StorageLocation::new(BackendKind::Bucket, "old"))
            .await;

        let mut new = doc("a", b"v2");
        new.created_at = old.created_at + Duration::seconds(1);
        let current = catalog
            .record_location(&new, StorageLocation::new(BackendKind::Bucket, "new"))
            .await;

        assert_eq!(current.locations.len(), 1);
        assert_eq!(current.locations[0].native_path, "new");
        assert_eq!(catalog.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_last_location_drops_document() {
        let catalog = Catalog::new();
        let version = doc("a", b"data");
        catalog
            .record_location(&version, StorageLocation::new(BackendKind::Bucket, "k"))
            .await;

        let address = VaultAddress::new(BackendKind::Bucket, "k").unwrap();
        assert!(catalog.find_by_address(&address).await.is_some());
        catalog.remove_location(&address).await.unwrap();
        assert!(catalog.is_empty().await);
        assert!(catalog.remove_location(&address).await.is_none());
    }

    #[tokio::test]
    async fn test_paging_visits_each_document_once() {
        let catalog = Catalog::new();
        for i in 0..7 {
            let version = doc(&format!("doc-{}", i), b"x");
            catalog
                .record_location(&version, StorageLocation::new(BackendKind::Bucket, format!("k{}", i)))
                .await;
        }
        let other = doc("zzz", b"x");
        catalog
            .record_location(&other, StorageLocation::new(BackendKind::Bucket, "z"))
            .await;

        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = catalog.page("doc-", token.as_deref(), 3).await;
            seen.extend(page.documents.into_iter().map(|d| d.source_id));
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
        seen.dedup();
        assert_eq!(seen.len(), 7);
    }

    #[tokio::test]
    async fn test_exact_page_has_no_token() {
        let catalog = Catalog::new();
        for id in ["a", "b"] {
            catalog
                .record_location(&doc(id, b"x"), StorageLocation::new(BackendKind::Bucket, id))
                .await;
        }
        let page = catalog.page("", None, 2).await;
        assert_eq!(page.documents.len(), 2);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_rebuild_merges_and_keeps_newest() {
        let catalog = Catalog::new();
        let v1 = doc("a", b"v1");
        let mut v2 = doc("a", b"v2");
        v2.created_at = v1.created_at + Duration::seconds(5);

        let mut bucket_copy = v2.clone();
        bucket_copy.locations = vec![StorageLocation::new(BackendKind::Bucket, "b")];
        let mut folder_copy = v2.clone();
        folder_copy.locations = vec![StorageLocation::new(BackendKind::Folder, "f/1")];
        let mut old_copy = v1.clone();
        old_copy.locations = vec![StorageLocation::new(BackendKind::Bucket, "old")];

        let count = catalog.rebuild(vec![bucket_copy, old_copy, folder_copy]).await;
        assert_eq!(count, 1);

        let current = catalog.get("a").await.unwrap();
        assert_eq!(current.plaintext_sha256, v2.plaintext_sha256);
        assert_eq!(current.locations.len(), 2);

        let stats = catalog.stats().await;
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.total_bytes, 2);
        assert_eq!(stats.per_backend_counts[&BackendKind::Folder], 1);
    }
}
