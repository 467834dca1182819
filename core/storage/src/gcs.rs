//! Cloud Storage bucket backend.
//!
//! Talks to the JSON API directly. The bucket is locked down when the
//! adapter initializes it: uniform bucket-level access, public access
//! prevention, object versioning and an age-based delete rule. Retention is
//! left to the bucket lifecycle, never enforced here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{DeleteOutcome, ListPage, ObjectInfo, PutObject, StorageBackend};
use crate::credentials::{CredentialProvider, Identity};
use crate::http;
use scanvault_common::{BackendKind, Error, MetadataMap, Result, StorageLocation};

/// Public Cloud Storage endpoint.
pub const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Object names are a single path segment in the JSON API.
const OBJECT_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const MULTIPART_BOUNDARY: &str = "ScanVaultObjectBoundary";

/// Bucket adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Bucket name.
    pub bucket: String,
    /// Project that owns the bucket, needed only to create it.
    pub project: Option<String>,
    /// Bucket location used on creation.
    pub location: String,
    /// Objects older than this are deleted by the lifecycle rule.
    pub retention_days: u32,
    /// API endpoint, overridable for emulators and tests.
    pub endpoint: String,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            bucket: "drive-scanner-vault".to_string(),
            project: None,
            location: "US".to_string(),
            retention_days: 2555,
            endpoint: GCS_ENDPOINT.to_string(),
        }
    }
}

/// Security-relevant bucket settings as reported by the API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPolicy {
    /// Object versioning.
    pub versioning_enabled: bool,
    /// Uniform bucket-level access (no per-object ACLs).
    pub uniform_access: bool,
    /// Public access prevention enforced.
    pub public_access_prevented: bool,
    /// Age of the lifecycle delete rule, if any.
    pub retention_days: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    metadata: MetadataMap,
    #[serde(default)]
    time_created: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketResource {
    #[serde(default)]
    versioning: Option<Toggle>,
    #[serde(default)]
    iam_configuration: Option<IamConfiguration>,
    #[serde(default)]
    lifecycle: Option<Lifecycle>,
}

#[derive(Debug, Default, Deserialize)]
struct Toggle {
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IamConfiguration {
    #[serde(default)]
    uniform_bucket_level_access: Option<Toggle>,
    #[serde(default)]
    public_access_prevention: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Lifecycle {
    #[serde(default)]
    rule: Vec<LifecycleRule>,
}

#[derive(Debug, Deserialize)]
struct LifecycleRule {
    action: LifecycleAction,
    #[serde(default)]
    condition: LifecycleCondition,
}

#[derive(Debug, Deserialize)]
struct LifecycleAction {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct LifecycleCondition {
    #[serde(default)]
    age: Option<u32>,
}

impl From<BucketResource> for BucketPolicy {
    fn from(resource: BucketResource) -> Self {
        let iam = resource.iam_configuration.unwrap_or_default();
        let retention_days = resource
            .lifecycle
            .unwrap_or_default()
            .rule
            .into_iter()
            .find(|rule| rule.action.kind == "Delete")
            .and_then(|rule| rule.condition.age);

        Self {
            versioning_enabled: resource.versioning.map(|v| v.enabled).unwrap_or(false),
            uniform_access: iam
                .uniform_bucket_level_access
                .map(|u| u.enabled)
                .unwrap_or(false),
            public_access_prevented: iam.public_access_prevention.as_deref() == Some("enforced"),
            retention_days,
        }
    }
}

/// Cloud Storage bucket backend.
pub struct GcsBucketBackend {
    config: BucketConfig,
    http: Client,
    credentials: Arc<dyn CredentialProvider>,
    identity: Identity,
}

impl GcsBucketBackend {
    /// Create an adapter acting as `identity`.
    pub fn new(
        config: BucketConfig,
        credentials: Arc<dyn CredentialProvider>,
        identity: Identity,
    ) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::Config("Bucket name cannot be empty".to_string()));
        }
        Ok(Self {
            config,
            http: http::build_client()?,
            credentials,
            identity,
        })
    }

    /// Bucket this adapter writes to.
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn auth_header(&self) -> Result<String> {
        let token = self.credentials.access_token(&self.identity).await?;
        Ok(format!("Bearer {}", token.secret()))
    }

    fn bucket_url(&self) -> String {
        format!("{}/storage/v1/b/{}", self.config.endpoint, self.config.bucket)
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/o/{}",
            self.bucket_url(),
            utf8_percent_encode(name, OBJECT_NAME)
        )
    }

    fn policy_body(&self) -> serde_json::Value {
        serde_json::json!({
            "versioning": { "enabled": true },
            "iamConfiguration": {
                "uniformBucketLevelAccess": { "enabled": true },
                "publicAccessPrevention": "enforced"
            },
            "lifecycle": {
                "rule": [{
                    "action": { "type": "Delete" },
                    "condition": { "age": self.config.retention_days, "isLive": true }
                }]
            }
        })
    }

    /// Create the bucket if missing and apply the vault's access and
    /// retention policy.
    ///
    /// # Errors
    /// - `Config` if the bucket must be created but no project is configured
    pub async fn ensure_bucket(&self) -> Result<BucketPolicy> {
        let auth = self.auth_header().await?;
        let response = self
            .http
            .get(self.bucket_url())
            .header(header::AUTHORIZATION, &auth)
            .send()
            .await
            .map_err(|e| http::send_error(e, "get bucket"))?;

        let resource: BucketResource = if response.status() == StatusCode::NOT_FOUND {
            let project = self.config.project.as_deref().ok_or_else(|| {
                Error::Config(format!(
                    "Bucket '{}' does not exist and no project is configured",
                    self.config.bucket
                ))
            })?;

            let mut body = self.policy_body();
            body["name"] = serde_json::json!(self.config.bucket);
            body["location"] = serde_json::json!(self.config.location);

            let response = self
                .http
                .post(format!("{}/storage/v1/b", self.config.endpoint))
                .header(header::AUTHORIZATION, &auth)
                .query(&[("project", project)])
                .json(&body)
                .send()
                .await
                .map_err(|e| http::send_error(e, "create bucket"))?;
            info!(bucket = %self.config.bucket, "Created vault bucket");
            http::json_or_error(response, "create bucket").await?
        } else {
            http::ok_or_error(response, "get bucket").await?;
            let response = self
                .http
                .patch(self.bucket_url())
                .header(header::AUTHORIZATION, &auth)
                .json(&self.policy_body())
                .send()
                .await
                .map_err(|e| http::send_error(e, "patch bucket"))?;
            http::json_or_error(response, "patch bucket").await?
        };

        Ok(resource.into())
    }

    /// Read the bucket's current security settings.
    pub async fn policy(&self) -> Result<BucketPolicy> {
        let response = self
            .http
            .get(self.bucket_url())
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .send()
            .await
            .map_err(|e| http::send_error(e, "get bucket"))?;
        let resource: BucketResource = http::json_or_error(response, "get bucket").await?;
        Ok(resource.into())
    }

    fn to_info(&self, object: GcsObject) -> ObjectInfo {
        ObjectInfo {
            location: StorageLocation {
                backend: BackendKind::Bucket,
                native_path: object.name.clone(),
                stored_at: object.time_created.unwrap_or_else(Utc::now),
            },
            key: object.name,
            size: object.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            content_type: object
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            metadata: object.metadata,
        }
    }
}

fn multipart_body(resource: &serde_json::Value, content_type: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(resource.to_string().as_bytes());
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{}--", MULTIPART_BOUNDARY).as_bytes());
    body
}

#[async_trait]
impl StorageBackend for GcsBucketBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Bucket
    }

    async fn put(&self, object: PutObject) -> Result<StorageLocation> {
        let resource = serde_json::json!({
            "name": object.key,
            "contentType": object.content_type,
            "metadata": object.metadata,
        });
        let body = multipart_body(&resource, &object.content_type, &object.data);

        let response = self
            .http
            .post(format!(
                "{}/upload/storage/v1/b/{}/o",
                self.config.endpoint, self.config.bucket
            ))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .query(&[("uploadType", "multipart")])
            .body(body)
            .send()
            .await
            .map_err(|e| http::send_error(e, "upload object"))?;

        let stored: GcsObject = http::json_or_error(response, "upload object").await?;
        debug!(bucket = %self.config.bucket, object = %stored.name, "Uploaded object");
        Ok(self.to_info(stored).location)
    }

    async fn get(&self, native_path: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.object_url(native_path))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| http::send_error(e, "download object"))?;

        http::ok_or_error(response, "download object")
            .await?
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Network(format!("Failed to read object body: {}", e)))
    }

    async fn head(&self, native_path: &str) -> Result<ObjectInfo> {
        let response = self
            .http
            .get(self.object_url(native_path))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .send()
            .await
            .map_err(|e| http::send_error(e, "get object"))?;
        let object: GcsObject = http::json_or_error(response, "get object").await?;
        Ok(self.to_info(object))
    }

    async fn find(&self, key: &str) -> Result<Option<ObjectInfo>> {
        match self.head(key).await {
            Ok(info) => Ok(Some(info)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage> {
        let max_results = page_size.to_string();
        let mut request = self
            .http
            .get(format!("{}/o", self.bucket_url()))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .query(&[("prefix", prefix), ("maxResults", max_results.as_str())]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| http::send_error(e, "list objects"))?;
        let listing: ObjectListResponse = http::json_or_error(response, "list objects").await?;

        Ok(ListPage {
            objects: listing
                .items
                .into_iter()
                .map(|object| self.to_info(object))
                .collect(),
            next_page_token: listing.next_page_token,
        })
    }

    async fn delete(&self, native_path: &str) -> Result<DeleteOutcome> {
        let response = self
            .http
            .delete(self.object_url(native_path))
            .header(header::AUTHORIZATION, self.auth_header().await?)
            .send()
            .await
            .map_err(|e| http::send_error(e, "delete object"))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }
        http::ok_or_error(response, "delete object").await?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn discard(&self, key: &str) -> Result<()> {
        self.delete(key).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> GcsBucketBackend {
        let config = BucketConfig {
            bucket: "vault".to_string(),
            project: Some("proj".to_string()),
            endpoint: server.uri(),
            ..BucketConfig::default()
        };
        GcsBucketBackend::new(
            config,
            Arc::new(StaticCredentials::service("tok")),
            Identity::Service,
        )
        .unwrap()
    }

    #[test]
    fn test_object_name_encoding() {
        let encoded = utf8_percent_encode("documents/f 1/a.txt", OBJECT_NAME).to_string();
        assert_eq!(encoded, "documents%2Ff%201%2Fa.txt");
    }

    #[tokio::test]
    async fn test_put_sends_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/vault/o"))
            .and(query_param("uploadType", "multipart"))
            .and(header_eq("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "documents/f1/a.txt",
                "size": "9",
                "contentType": "application/octet-stream",
                "metadata": { "encrypted": "true" },
                "timeCreated": "2024-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut metadata = MetadataMap::new();
        metadata.insert("encrypted".to_string(), "true".to_string());
        let location = backend(&server)
            .put(
                PutObject::new("documents/f1/a.txt", b"ciphertext".to_vec(), "application/octet-stream")
                    .with_metadata(metadata),
            )
            .await
            .unwrap();

        assert_eq!(location.backend, BackendKind::Bucket);
        assert_eq!(location.native_path, "documents/f1/a.txt");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/vault/o/documents%2Fnope"))
            .respond_with(ResponseTemplate::new(404).set_body_string("No such object: vault/documents/nope"))
            .mount(&server)
            .await;

        let err = backend(&server).get("documents/nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!err.to_string().contains("No such object"));
    }

    #[tokio::test]
    async fn test_find_by_exact_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/vault/o/audit_logs%2F2026-10-17.jsonl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "audit_logs/2026-10-17.jsonl",
                "size": "120",
                "contentType": "application/x-ndjson"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/vault/o/audit_logs%2F2026-10-18.jsonl"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = backend(&server);
        let found = backend.find("audit_logs/2026-10-17.jsonl").await.unwrap().unwrap();
        assert_eq!(found.location.native_path, "audit_logs/2026-10-17.jsonl");
        assert_eq!(found.size, 120);
        assert!(backend.find("audit_logs/2026-10-18.jsonl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/b/vault/o/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/b/vault/o/here"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let backend = backend(&server);
        assert_eq!(backend.delete("gone").await.unwrap(), DeleteOutcome::NotFound);
        assert_eq!(backend.delete("here").await.unwrap(), DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_list_page_passes_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/vault/o"))
            .and(query_param("prefix", "documents/"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "name": "documents/b", "size": "3" }]
            })))
            .mount(&server)
            .await;

        let page = backend(&server)
            .list_page("documents/", Some("p2"), 10)
            .await
            .unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].size, 3);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_ensure_bucket_creates_locked_down_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/vault"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/b"))
            .and(query_param("project", "proj"))
            .and(body_partial_json(serde_json::json!({
                "name": "vault",
                "versioning": { "enabled": true },
                "iamConfiguration": { "publicAccessPrevention": "enforced" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "vault",
                "versioning": { "enabled": true },
                "iamConfiguration": {
                    "uniformBucketLevelAccess": { "enabled": true },
                    "publicAccessPrevention": "enforced"
                },
                "lifecycle": { "rule": [{ "action": { "type": "Delete" }, "condition": { "age": 2555 } }] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let policy = backend(&server).ensure_bucket().await.unwrap();
        assert_eq!(
            policy,
            BucketPolicy {
                versioning_enabled: true,
                uniform_access: true,
                public_access_prevented: true,
                retention_days: Some(2555),
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/vault/o/x"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = backend(&server).head("x").await.unwrap_err();
        assert!(err.is_transient());
    }
}
