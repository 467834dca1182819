//! Google Drive API client.

use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::credentials::{CredentialProvider, Identity};
use crate::http;
use scanvault_common::{Error, MetadataMap, Result};

/// Google Drive API base URL.
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Chunk size for resumable uploads (must be a multiple of 256 KiB).
pub const CHUNK_SIZE: usize = 256 * 1024;

/// MIME type Drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const FILE_FIELDS: &str = "id,name,mimeType,size,createdTime,parents,appProperties,trashed";
const LIST_FIELDS: &str =
    "files(id,name,mimeType,size,createdTime,parents,appProperties,trashed),nextPageToken";

const MULTIPART_BOUNDARY: &str = "ScanVaultDriveBoundary";

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    /// File ID.
    pub id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// File size in bytes (only for files, not folders).
    #[serde(default)]
    pub size: Option<String>,
    /// Created time.
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    /// Parent folder IDs.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Application-private key/value properties.
    #[serde(default)]
    pub app_properties: MetadataMap,
    /// Trashed status.
    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

/// One page of folder children.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    /// Files on this page.
    #[serde(default)]
    pub files: Vec<DriveFile>,
    /// Token for the next page.
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Permission {
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct PermissionList {
    #[serde(default)]
    permissions: Vec<Permission>,
}

/// File metadata sent on create and update.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Parent folder, set only on create.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    /// Application-private properties.
    pub app_properties: MetadataMap,
}

/// Escape a literal for use inside a Drive query string.
fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    credentials: Arc<dyn CredentialProvider>,
    identity: Identity,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    /// Create a new Drive client acting as `identity`.
    pub fn new(credentials: Arc<dyn CredentialProvider>, identity: Identity) -> Result<Self> {
        Ok(Self {
            http: http::build_client()?,
            credentials,
            identity,
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
        })
    }

    /// Point the client at other endpoints.
    pub fn with_endpoints(mut self, api_base: impl Into<String>, upload_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.upload_base = upload_base.into();
        self
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        let token = self.credentials.access_token(&self.identity).await?;
        Ok(format!("Bearer {}", token.secret()))
    }

    /// Get file metadata by ID.
    pub async fn get_file(&self, file_id: &str) -> Result<DriveFile> {
        let response = self
            .http
            .get(format!("{}/files/{}", self.api_base, file_id))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await
            .map_err(|e| http::send_error(e, "get file"))?;

        http::json_or_error(response, "get file").await
    }

    /// Create a folder.
    pub async fn create_folder(&self, name: &str) -> Result<DriveFile> {
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
        });

        let response = self
            .http
            .post(format!("{}/files", self.api_base))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| http::send_error(e, "create folder"))?;

        http::json_or_error(response, "create folder").await
    }

    /// Find a folder by name anywhere the identity can see.
    pub async fn find_folder(&self, name: &str) -> Result<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            quote(name),
            FOLDER_MIME_TYPE
        );
        Ok(self.query(&query, None, 1, None).await?.files.into_iter().next())
    }

    /// Remove every `anyone` (link-sharing) permission from a file or folder.
    pub async fn remove_public_permissions(&self, file_id: &str) -> Result<usize> {
        let auth = self.auth_header().await?;
        let response = self
            .http
            .get(format!("{}/files/{}/permissions", self.api_base, file_id))
            .header(header::AUTHORIZATION, &auth)
            .query(&[("fields", "permissions(id,type)")])
            .send()
            .await
            .map_err(|e| http::send_error(e, "list permissions"))?;
        let list: PermissionList = http::json_or_error(response, "list permissions").await?;

        let mut removed = 0;
        for permission in list.permissions.into_iter().filter(|p| p.kind == "anyone") {
            let response = self
                .http
                .delete(format!(
                    "{}/files/{}/permissions/{}",
                    self.api_base, file_id, permission.id
                ))
                .header(header::AUTHORIZATION, &auth)
                .send()
                .await
                .map_err(|e| http::send_error(e, "delete permission"))?;
            http::ok_or_error(response, "delete permission").await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Grant `email` the given role on a file or folder.
    pub async fn create_user_permission(&self, file_id: &str, email: &str, role: &str) -> Result<()> {
        let body = serde_json::json!({
            "type": "user",
            "role": role,
            "emailAddress": email,
        });
        let response = self
            .http
            .post(format!("{}/files/{}/permissions", self.api_base, file_id))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("fields", "id"), ("sendNotificationEmail", "false")])
            .json(&body)
            .send()
            .await
            .map_err(|e| http::send_error(e, "create permission"))?;
        http::ok_or_error(response, "create permission").await?;
        debug!(file_id, role, "Granted user permission");
        Ok(())
    }

    /// List one page of a folder's children, ordered by name.
    pub async fn list_folder_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<FileList> {
        let query = format!("'{}' in parents and trashed = false", quote(folder_id));
        self.query(&query, page_token, page_size, Some("name")).await
    }

    /// Find files by name in a folder.
    pub async fn find_files(&self, name: &str, parent_id: &str) -> Result<Vec<DriveFile>> {
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            quote(name),
            quote(parent_id)
        );
        Ok(self.query(&query, None, 100, None).await?.files)
    }

    async fn query(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: usize,
        order_by: Option<&str>,
    ) -> Result<FileList> {
        let page_size = page_size.to_string();
        let mut request = self
            .http
            .get(format!("{}/files", self.api_base))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[
                ("q", query),
                ("fields", LIST_FIELDS),
                ("pageSize", page_size.as_str()),
            ]);
        if let Some(order_by) = order_by {
            request = request.query(&[("orderBy", order_by)]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| http::send_error(e, "list files"))?;
        http::json_or_error(response, "list files").await
    }

    /// Create or update a file in one multipart request.
    ///
    /// With `existing_id`, the file's content and metadata are replaced.
    pub async fn upload_multipart(
        &self,
        metadata: &FileMetadata,
        existing_id: Option<&str>,
        data: &[u8],
    ) -> Result<DriveFile> {
        let metadata_json = serde_json::to_string(metadata)?;

        let mut body = Vec::with_capacity(data.len() + metadata_json.len() + 256);
        body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata_json.as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", metadata.mime_type).as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{}--", MULTIPART_BOUNDARY).as_bytes());

        let request = match existing_id {
            Some(id) => self.http.patch(format!("{}/files/{}", self.upload_base, id)),
            None => self.http.post(format!("{}/files", self.upload_base)),
        };

        let response = request
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .body(body)
            .send()
            .await
            .map_err(|e| http::send_error(e, "upload file"))?;

        http::json_or_error(response, "upload file").await
    }

    /// Start a resumable upload session and return its URI.
    pub async fn start_resumable_upload(
        &self,
        metadata: &FileMetadata,
        existing_id: Option<&str>,
        total_size: u64,
    ) -> Result<String> {
        let request = match existing_id {
            Some(id) => self.http.patch(format!("{}/files/{}", self.upload_base, id)),
            None => self.http.post(format!("{}/files", self.upload_base)),
        };

        let response = request
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .header("X-Upload-Content-Type", metadata.mime_type.as_str())
            .header("X-Upload-Content-Length", total_size.to_string())
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .json(metadata)
            .send()
            .await
            .map_err(|e| http::send_error(e, "start resumable upload"))?;

        let response = http::ok_or_error(response, "start resumable upload").await?;

        let upload_uri = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| Error::Storage("No upload URI in response".to_string()))?
            .to_str()
            .map_err(|e| Error::Storage(format!("Invalid upload URI: {}", e)))?
            .to_string();

        Ok(upload_uri)
    }

    /// Upload a chunk to a resumable upload session.
    ///
    /// Returns the file once the final chunk is accepted.
    pub async fn upload_chunk(
        &self,
        upload_uri: &str,
        data: &[u8],
        start_byte: u64,
        total_size: u64,
    ) -> Result<Option<DriveFile>> {
        let end_byte = start_byte + data.len() as u64 - 1;
        let content_range = format!("bytes {}-{}/{}", start_byte, end_byte, total_size);

        let response = self
            .http
            .put(upload_uri)
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| http::send_error(e, "upload chunk"))?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            let file: DriveFile = http::json_or_error(response, "upload chunk").await?;
            Ok(Some(file))
        } else if status == StatusCode::PERMANENT_REDIRECT {
            // 308 Resume Incomplete
            Ok(None)
        } else {
            Err(http::status_error(response, "upload chunk").await)
        }
    }

    /// Upload a large payload through the resumable protocol in fixed chunks.
    pub async fn upload_resumable(
        &self,
        metadata: &FileMetadata,
        existing_id: Option<&str>,
        data: &[u8],
    ) -> Result<DriveFile> {
        let total_size = data.len() as u64;
        let upload_uri = self
            .start_resumable_upload(metadata, existing_id, total_size)
            .await?;

        let mut bytes_uploaded = 0u64;
        for chunk in data.chunks(CHUNK_SIZE) {
            let result = self
                .upload_chunk(&upload_uri, chunk, bytes_uploaded, total_size)
                .await?;
            bytes_uploaded += chunk.len() as u64;

            if let Some(file) = result {
                debug!(file_id = %file.id, bytes = bytes_uploaded, "Resumable upload complete");
                return Ok(file);
            }
        }

        Err(Error::Storage("Upload did not complete".to_string()))
    }

    /// Download file content.
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(format!("{}/files/{}", self.api_base, file_id))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| http::send_error(e, "download file"))?;

        http::ok_or_error(response, "download file")
            .await?
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Network(format!("Failed to read download response: {}", e)))
    }

    /// Delete a file. Returns `false` if it did not exist.
    pub async fn delete(&self, file_id: &str) -> Result<bool> {
        let response = self
            .http
            .delete(format!("{}/files/{}", self.api_base, file_id))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .send()
            .await
            .map_err(|e| http::send_error(e, "delete file"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        http::ok_or_error(response, "delete file").await?;
        Ok(true)
    }
}
