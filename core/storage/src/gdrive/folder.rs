//! Google Drive folder backend.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::{DeleteOutcome, ListPage, ObjectInfo, PutObject, StorageBackend};
use crate::credentials::{CredentialProvider, Identity};
use scanvault_common::{BackendKind, Error, Result, StorageLocation};

use super::client::{DriveClient, DriveFile, FileMetadata, DRIVE_API_BASE, DRIVE_UPLOAD_BASE};

/// Folder adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    /// Existing vault folder; when absent the folder is found or created by name.
    pub folder_id: Option<String>,
    /// Name of the vault folder.
    pub folder_name: String,
    /// Payloads larger than this use the resumable upload protocol.
    pub resumable_threshold_bytes: usize,
    /// Metadata API endpoint.
    pub api_endpoint: String,
    /// Upload API endpoint.
    pub upload_endpoint: String,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            folder_id: None,
            folder_name: "Secure Vault - FIPS Encrypted".to_string(),
            resumable_threshold_bytes: 5 * 1024 * 1024,
            api_endpoint: DRIVE_API_BASE.to_string(),
            upload_endpoint: DRIVE_UPLOAD_BASE.to_string(),
        }
    }
}

/// Name prefix of the folder provisioned for an impersonated user.
pub const USER_FOLDER_PREFIX: &str = "Secure Vault - ";

/// Stores vault objects as files inside one access-restricted Drive folder.
///
/// Acting as the service identity, the folder is the shared one named in the
/// config. Acting for a user, each user gets a folder of their own, named
/// after their email address and shared with them alone.
///
/// Native paths have the form `<folder-id>/<file-id>`.
pub struct DriveFolderBackend {
    config: FolderConfig,
    client: DriveClient,
    owner: Option<String>,
    folder_id: OnceCell<String>,
}

impl DriveFolderBackend {
    /// Create an adapter acting as `identity`. The folder is resolved on first use.
    pub fn new(
        config: FolderConfig,
        credentials: Arc<dyn CredentialProvider>,
        identity: Identity,
    ) -> Result<Self> {
        let owner = match &identity {
            Identity::Impersonated(email) => Some(email.clone()),
            Identity::Service => None,
        };
        let client = DriveClient::new(credentials, identity)?
            .with_endpoints(config.api_endpoint.clone(), config.upload_endpoint.clone());
        Ok(Self {
            config,
            client,
            owner,
            folder_id: OnceCell::new(),
        })
    }

    /// Name of the folder this adapter stores into.
    pub fn folder_name(&self) -> String {
        match &self.owner {
            Some(email) => format!("{}{}", USER_FOLDER_PREFIX, email),
            None => self.config.folder_name.clone(),
        }
    }

    /// The vault folder id, creating and locking down the folder if needed.
    pub async fn folder_id(&self) -> Result<&str> {
        self.folder_id
            .get_or_try_init(|| self.resolve_folder())
            .await
            .map(String::as_str)
    }

    async fn resolve_folder(&self) -> Result<String> {
        if let Some(id) = &self.config.folder_id {
            return Ok(id.clone());
        }

        let name = self.folder_name();
        let (folder, created) = match self.client.find_folder(&name).await? {
            Some(folder) => (folder, false),
            None => {
                let folder = self.client.create_folder(&name).await?;
                info!(folder_id = %folder.id, name = %name, "Created vault folder");
                (folder, true)
            }
        };

        let removed = self.client.remove_public_permissions(&folder.id).await?;
        if removed > 0 {
            warn!(folder_id = %folder.id, removed, "Removed public sharing from vault folder");
        }
        if let (true, Some(email)) = (created, &self.owner) {
            self.client
                .create_user_permission(&folder.id, email, "writer")
                .await?;
            info!(folder_id = %folder.id, user = %email, "Restricted vault folder to its user");
        }
        Ok(folder.id)
    }

    /// Split a native path into `(folder_id, file_id)`.
    fn split_native(native_path: &str) -> Result<(&str, &str)> {
        native_path
            .split_once('/')
            .filter(|(folder, file)| !folder.is_empty() && !file.is_empty() && !file.contains('/'))
            .ok_or_else(|| {
                Error::MalformedAddress(format!(
                    "Folder path '{}' is not <folder-id>/<file-id>",
                    native_path
                ))
            })
    }

    fn to_info(&self, folder_id: &str, file: DriveFile) -> ObjectInfo {
        ObjectInfo {
            location: StorageLocation {
                backend: BackendKind::Folder,
                native_path: format!("{}/{}", folder_id, file.id),
                stored_at: file.created_time.unwrap_or_else(Utc::now),
            },
            size: file.size_bytes().unwrap_or(0),
            key: file.name,
            content_type: file.mime_type,
            metadata: file.app_properties,
        }
    }
}

#[async_trait]
impl StorageBackend for DriveFolderBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Folder
    }

    async fn put(&self, object: PutObject) -> Result<StorageLocation> {
        let folder_id = self.folder_id().await?;
        let existing = self
            .client
            .find_files(&object.key, folder_id)
            .await?
            .into_iter()
            .next();
        let existing_id = existing.as_ref().map(|f| f.id.as_str());

        let metadata = FileMetadata {
            name: object.key.clone(),
            mime_type: object.content_type.clone(),
            parents: if existing_id.is_some() {
                Vec::new()
            } else {
                vec![folder_id.to_string()]
            },
            app_properties: object.metadata,
        };

        let file = if object.data.len() > self.config.resumable_threshold_bytes {
            self.client
                .upload_resumable(&metadata, existing_id, &object.data)
                .await?
        } else {
            self.client
                .upload_multipart(&metadata, existing_id, &object.data)
                .await?
        };

        debug!(folder_id, file_id = %file.id, replaced = existing_id.is_some(), "Stored file in vault folder");
        Ok(StorageLocation::new(
            BackendKind::Folder,
            format!("{}/{}", folder_id, file.id),
        ))
    }

    async fn get(&self, native_path: &str) -> Result<Vec<u8>> {
        let (_, file_id) = Self::split_native(native_path)?;
        self.client.download(file_id).await
    }

    async fn head(&self, native_path: &str) -> Result<ObjectInfo> {
        let (folder_id, file_id) = Self::split_native(native_path)?;
        let file = self.client.get_file(file_id).await?;
        if file.trashed {
            return Err(Error::NotFound(format!("File {} is trashed", file_id)));
        }
        Ok(self.to_info(folder_id, file))
    }

    async fn find(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let folder_id = self.folder_id().await?;
        let file = self
            .client
            .find_files(key, folder_id)
            .await?
            .into_iter()
            .find(|file| !file.is_folder());
        Ok(file.map(|file| self.to_info(folder_id, file)))
    }

    async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage> {
        let folder_id = self.folder_id().await?;
        let page = self
            .client
            .list_folder_page(folder_id, page_token, page_size)
            .await?;

        // Drive has no name-prefix query; filter the ordered page instead.
        let objects = page
            .files
            .into_iter()
            .filter(|file| !file.is_folder() && file.name.starts_with(prefix))
            .map(|file| self.to_info(folder_id, file))
            .collect();

        Ok(ListPage {
            objects,
            next_page_token: page.next_page_token,
        })
    }

    async fn delete(&self, native_path: &str) -> Result<DeleteOutcome> {
        let (_, file_id) = Self::split_native(native_path)?;
        if self.client.delete(file_id).await? {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::NotFound)
        }
    }

    async fn discard(&self, key: &str) -> Result<()> {
        let folder_id = self.folder_id().await?;
        for file in self.client.find_files(key, folder_id).await? {
            self.client.delete(&file.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::gdrive::client::CHUNK_SIZE;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer, folder_id: Option<&str>, threshold: usize) -> DriveFolderBackend {
        let config = FolderConfig {
            folder_id: folder_id.map(str::to_string),
            folder_name: "Vault".to_string(),
            resumable_threshold_bytes: threshold,
            api_endpoint: format!("{}/drive/v3", server.uri()),
            upload_endpoint: format!("{}/upload/drive/v3", server.uri()),
        };
        DriveFolderBackend::new(
            config,
            Arc::new(StaticCredentials::service("tok")),
            Identity::Service,
        )
        .unwrap()
    }

    fn file_json(id: &str, name: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": name,
            "mimeType": "application/octet-stream",
            "size": "10",
            "appProperties": { "encrypted": "true" }
        })
    }

    async fn mount_no_existing_file(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "files": [] })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_split_native() {
        assert_eq!(
            DriveFolderBackend::split_native("folder/file").unwrap(),
            ("folder", "file")
        );
        assert!(DriveFolderBackend::split_native("nofile").is_err());
        assert!(DriveFolderBackend::split_native("a/b/c").is_err());
        assert!(DriveFolderBackend::split_native("/b").is_err());
    }

    #[tokio::test]
    async fn test_folder_created_lazily_and_locked_down() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "files": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "vault-folder",
                "name": "Vault",
                "mimeType": "application/vnd.google-apps.folder"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/vault-folder/permissions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "permissions": [
                    { "id": "owner1", "type": "user" },
                    { "id": "anyoneWithLink", "type": "anyone" }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/drive/v3/files/vault-folder/permissions/anyoneWithLink"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend(&server, None, 1024);
        assert_eq!(backend.folder_id().await.unwrap(), "vault-folder");
        // Cached after the first resolution.
        assert_eq!(backend.folder_id().await.unwrap(), "vault-folder");
    }

    #[tokio::test]
    async fn test_impersonated_user_gets_own_folder() {
        let server = MockServer::start().await;
        let user = "u@example.com";
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param(
                "q",
                "name = 'Secure Vault - u@example.com' and mimeType = 'application/vnd.google-apps.folder' and trashed = false",
            ))
            .and(header_eq("authorization", "Bearer user-tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "files": [] })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drive/v3/files"))
            .and(body_partial_json(serde_json::json!({ "name": "Secure Vault - u@example.com" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "user-folder",
                "name": "Secure Vault - u@example.com",
                "mimeType": "application/vnd.google-apps.folder"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/user-folder/permissions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "permissions": [{ "id": "anyoneWithLink", "type": "anyone" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/drive/v3/files/user-folder/permissions/anyoneWithLink"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drive/v3/files/user-folder/permissions"))
            .and(body_partial_json(serde_json::json!({
                "type": "user",
                "role": "writer",
                "emailAddress": user
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "perm-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let config = FolderConfig {
            api_endpoint: format!("{}/drive/v3", server.uri()),
            upload_endpoint: format!("{}/upload/drive/v3", server.uri()),
            ..FolderConfig::default()
        };
        let credentials = StaticCredentials::service("tok")
            .with_token(Identity::Impersonated(user.to_string()), "user-tok");
        let backend = DriveFolderBackend::new(
            config,
            Arc::new(credentials),
            Identity::Impersonated(user.to_string()),
        )
        .unwrap();

        assert_eq!(backend.folder_name(), "Secure Vault - u@example.com");
        assert_eq!(backend.folder_id().await.unwrap(), "user-folder");
    }

    #[tokio::test]
    async fn test_existing_user_folder_is_not_regranted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [{
                    "id": "user-folder",
                    "name": "Secure Vault - u@example.com",
                    "mimeType": "application/vnd.google-apps.folder"
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/user-folder/permissions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "permissions": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drive/v3/files/user-folder/permissions"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let config = FolderConfig {
            api_endpoint: format!("{}/drive/v3", server.uri()),
            upload_endpoint: format!("{}/upload/drive/v3", server.uri()),
            ..FolderConfig::default()
        };
        let identity = Identity::Impersonated("u@example.com".to_string());
        let credentials = StaticCredentials::default().with_token(identity.clone(), "user-tok");
        let backend = DriveFolderBackend::new(config, Arc::new(credentials), identity).unwrap();

        assert_eq!(backend.folder_id().await.unwrap(), "user-folder");
    }

    #[tokio::test]
    async fn test_find_queries_exact_name_not_listing_order() {
        let server = MockServer::start().await;
        // A name-ordered listing would surface the older period first.
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("orderBy", "name"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [file_json("older", "audit_logs/2026-10-16.jsonl")],
                "nextPageToken": "more"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param(
                "q",
                "name = 'audit_logs/2026-10-17.jsonl' and 'fold' in parents and trashed = false",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [file_json("today", "audit_logs/2026-10-17.jsonl")]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param(
                "q",
                "name = 'audit_logs/2026-10-18.jsonl' and 'fold' in parents and trashed = false",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "files": [] })))
            .mount(&server)
            .await;

        let backend = backend(&server, Some("fold"), 1024);
        let found = backend.find("audit_logs/2026-10-17.jsonl").await.unwrap().unwrap();
        assert_eq!(found.key, "audit_logs/2026-10-17.jsonl");
        assert_eq!(found.location.native_path, "fold/today");
        assert!(backend.find("audit_logs/2026-10-18.jsonl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_small_put_uses_multipart() {
        let server = MockServer::start().await;
        mount_no_existing_file(&server).await;
        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .and(query_param("uploadType", "multipart"))
            .and(header_eq("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_json("file-1", "doc")))
            .expect(1)
            .mount(&server)
            .await;

        let location = backend(&server, Some("fold"), 1024)
            .put(PutObject::new("doc", vec![7u8; 10], "application/octet-stream"))
            .await
            .unwrap();

        assert_eq!(location.backend, BackendKind::Folder);
        assert_eq!(location.native_path, "fold/file-1");
    }

    #[tokio::test]
    async fn test_large_put_uses_resumable_chunks() {
        let server = MockServer::start().await;
        mount_no_existing_file(&server).await;
        let session = format!("{}/upload-session/1", server.uri());
        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .and(query_param("uploadType", "resumable"))
            .respond_with(ResponseTemplate::new(200).insert_header("Location", session.as_str()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload-session/1"))
            .and(header_eq("content-range", format!("bytes 0-{}/{}", CHUNK_SIZE - 1, CHUNK_SIZE + 10).as_str()))
            .respond_with(ResponseTemplate::new(308))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload-session/1"))
            .and(header_eq("content-range", format!("bytes {}-{}/{}", CHUNK_SIZE, CHUNK_SIZE + 9, CHUNK_SIZE + 10).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_json("big-1", "big")))
            .expect(1)
            .mount(&server)
            .await;

        let data = vec![1u8; CHUNK_SIZE + 10];
        let location = backend(&server, Some("fold"), 1024)
            .put(PutObject::new("big", data, "application/octet-stream"))
            .await
            .unwrap();

        assert_eq!(location.native_path, "fold/big-1");
    }

    #[tokio::test]
    async fn test_head_maps_app_properties() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/file-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_json("file-1", "doc")))
            .mount(&server)
            .await;

        let info = backend(&server, Some("fold"), 1024).head("fold/file-1").await.unwrap();
        assert_eq!(info.key, "doc");
        assert_eq!(info.size, 10);
        assert_eq!(info.metadata.get("encrypted").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_delete_missing_file() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/drive/v3/files/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = backend(&server, Some("fold"), 1024).delete("fold/ghost").await.unwrap();
        assert_eq!(outcome, DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("orderBy", "name"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [file_json("a", "audit_logs/2024/01/01.ndjson"), file_json("b", "documents/x")],
                "nextPageToken": "more"
            })))
            .mount(&server)
            .await;

        let page = backend(&server, Some("fold"), 1024)
            .list_page("documents/", None, 2)
            .await
            .unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].location.native_path, "fold/b");
        assert_eq!(page.next_page_token.as_deref(), Some("more"));
    }
}
