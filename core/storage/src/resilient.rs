//! Retry, deadline and cancellation handling around any backend.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{DeleteOutcome, ListPage, ObjectInfo, PutObject, StorageBackend};
use crate::retry::{RetryConfig, RetryExecutor};
use scanvault_common::{BackendKind, Error, Result, StorageLocation};

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the best-effort cleanup after an abandoned upload.
const DISCARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Decorates a backend with bounded retries and a per-call timeout.
///
/// An upload that times out or is cancelled is followed by a best-effort
/// `discard` so no half-written object is left behind.
pub struct ResilientBackend {
    inner: Arc<dyn StorageBackend>,
    retry: RetryExecutor,
    call_timeout: Duration,
}

impl ResilientBackend {
    /// Wrap a backend.
    pub fn new(inner: Arc<dyn StorageBackend>, retry: RetryConfig, call_timeout: Duration) -> Self {
        Self {
            inner,
            retry: RetryExecutor::new(retry),
            call_timeout,
        }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<dyn StorageBackend> {
        &self.inner
    }

    /// Upload, giving up as soon as `cancel` fires.
    ///
    /// # Errors
    /// - `Cancelled` if the token fired before the upload completed
    /// - `BackendUnavailable` if transient failures outlast the retries
    pub async fn put_cancellable(
        &self,
        object: PutObject,
        cancel: &CancellationToken,
    ) -> Result<StorageLocation> {
        let key = object.key.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("Upload of '{}' cancelled", key))),
            result = self.put_with_deadline(object) => result,
        };

        if matches!(result, Err(Error::Cancelled(_))) {
            self.discard_quietly(&key).await;
        }
        result
    }

    async fn put_with_deadline(&self, object: PutObject) -> Result<StorageLocation> {
        let key = object.key.as_str();
        self.retry
            .execute("put", || {
                let attempt = object.clone();
                async move {
                    match timeout(self.call_timeout, self.inner.put(attempt)).await {
                        Ok(result) => result,
                        Err(_) => {
                            self.discard_quietly(key).await;
                            Err(Error::Timeout(format!(
                                "Upload of '{}' exceeded {:?}",
                                key, self.call_timeout
                            )))
                        }
                    }
                }
            })
            .await
    }

    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry
            .execute(operation, || {
                let fut = f();
                async move {
                    match timeout(self.call_timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(format!(
                            "{} exceeded {:?}",
                            operation, self.call_timeout
                        ))),
                    }
                }
            })
            .await
    }

    async fn discard_quietly(&self, key: &str) {
        match timeout(DISCARD_TIMEOUT, self.inner.discard(key)).await {
            Ok(Ok(())) => debug!(backend = %self.inner.kind(), key, "Discarded partial upload"),
            Ok(Err(err)) => warn!(
                backend = %self.inner.kind(),
                key,
                error = %err,
                "Failed to discard partial upload"
            ),
            Err(_) => warn!(backend = %self.inner.kind(), key, "Discard of partial upload timed out"),
        }
    }
}

#[async_trait]
impl StorageBackend for ResilientBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn put(&self, object: PutObject) -> Result<StorageLocation> {
        self.put_with_deadline(object).await
    }

    async fn get(&self, native_path: &str) -> Result<Vec<u8>> {
        self.call("get", || self.inner.get(native_path)).await
    }

    async fn head(&self, native_path: &str) -> Result<ObjectInfo> {
        self.call("head", || self.inner.head(native_path)).await
    }

    async fn find(&self, key: &str) -> Result<Option<ObjectInfo>> {
        self.call("find", || self.inner.find(key)).await
    }

    async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage> {
        self.call("list", || self.inner.list_page(prefix, page_token, page_size))
            .await
    }

    async fn delete(&self, native_path: &str) -> Result<DeleteOutcome> {
        self.call("delete", || self.inner.delete(native_path)).await
    }

    async fn discard(&self, key: &str) -> Result<()> {
        self.inner.discard(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, MemoryBackend};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries, Duration::from_millis(1), Duration::from_millis(2))
    }

    fn object(key: &str) -> PutObject {
        PutObject::new(key, b"sealed".to_vec(), "application/octet-stream")
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let memory = Arc::new(MemoryBackend::bucket());
        memory.set_fault(Fault::Transient(2)).await;
        let backend = ResilientBackend::new(memory.clone(), fast_retry(3), DEFAULT_CALL_TIMEOUT);

        backend.put(object("a")).await.unwrap();
        assert_eq!(memory.put_attempts(), 3);
    }

    #[tokio::test]
    async fn test_down_backend_becomes_unavailable() {
        let memory = Arc::new(MemoryBackend::folder());
        memory.set_fault(Fault::Down).await;
        let backend = ResilientBackend::new(memory.clone(), fast_retry(3), DEFAULT_CALL_TIMEOUT);

        let err = backend.put(object("a")).await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert_eq!(memory.put_attempts(), 4);
    }

    #[tokio::test]
    async fn test_not_found_passes_through() {
        let backend = ResilientBackend::new(
            Arc::new(MemoryBackend::bucket()),
            fast_retry(3),
            DEFAULT_CALL_TIMEOUT,
        );
        assert!(matches!(backend.get("missing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_timeout_discards_partial_object() {
        let memory = Arc::new(MemoryBackend::bucket());
        memory.set_put_delay(Some(Duration::from_millis(500))).await;
        let backend = ResilientBackend::new(memory.clone(), fast_retry(1), Duration::from_millis(20));

        let err = backend.put(object("stuck")).await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert!(!memory.contains_key("stuck").await);
        assert_eq!(memory.discards(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_discards_partial_object() {
        let memory = Arc::new(MemoryBackend::bucket());
        memory.set_put_delay(Some(Duration::from_secs(5))).await;
        let backend = ResilientBackend::new(memory.clone(), fast_retry(3), DEFAULT_CALL_TIMEOUT);

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = backend.put_cancellable(object("big"), &token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(!memory.contains_key("big").await);
        assert_eq!(memory.discards(), 1);
    }
}
