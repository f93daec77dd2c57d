use super::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_VISIBILITY_TIMEOUT, MemoryQueue, MemoryStore, MemoryTrackerStore,
    Queue, QueueMessage, RedisQueue, RedisStore, SqliteTrackerStore, Store, TrackerStore,
};
use crate::{BundlioError, Result, StoreRecord};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builds store and queue backends from configuration values. The backend is
/// chosen explicitly by name; callers receive trait objects.
#[derive(Debug, Clone, Default)]
pub struct BackendBuilder {
    backend: Option<String>,
    namespace: Option<String>,
    redis_url: Option<String>,
    tracker_db_path: Option<PathBuf>,
    max_attempts: Option<u32>,
    visibility_timeout: Option<Duration>,
}

impl BackendBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn tracker_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tracker_db_path = Some(path.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    fn resolve_namespace(&self) -> Result<String> {
        let namespace = self
            .namespace
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if namespace.is_empty() {
            return Err(BundlioError::Config(
                "backend namespace cannot be empty".to_string(),
            ));
        }

        Ok(namespace)
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(BundlioError::Config(
                "storage backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    fn resolve_redis_url(&self) -> Result<String> {
        let url = self.redis_url.as_deref().unwrap_or_default().trim();
        if url.is_empty() {
            return Err(BundlioError::Config(
                "redis url is required for redis backend".to_string(),
            ));
        }

        Ok(url.to_string())
    }

    pub async fn build_store<T: StoreRecord + 'static>(&self) -> Result<Arc<dyn Store<T>>> {
        let namespace = self.resolve_namespace()?;
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "memory" => Ok(Arc::new(MemoryStore::<T>::new())),
            "redis" => {
                let url = self.resolve_redis_url()?;
                let store = RedisStore::<T>::new(&url, &namespace).await?;
                Ok(Arc::new(store))
            }
            other => Err(BundlioError::Config(format!(
                "unsupported storage backend: {}",
                other
            ))),
        }
    }

    pub async fn build_queue<T: QueueMessage + Clone>(
        &self,
        name: &str,
    ) -> Result<Arc<dyn Queue<T>>> {
        let namespace = self.resolve_namespace()?;
        let backend = self.resolve_backend()?;
        let max_attempts = self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let visibility_timeout = self
            .visibility_timeout
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT);

        match backend.as_str() {
            "memory" => Ok(Arc::new(
                MemoryQueue::<T>::with_max_attempts(max_attempts)
                    .with_visibility_timeout(visibility_timeout),
            )),
            "redis" => {
                let url = self.resolve_redis_url()?;
                let queue = RedisQueue::<T>::new(&url, &namespace, name, max_attempts)
                    .await?
                    .with_visibility_timeout(visibility_timeout);
                Ok(Arc::new(queue))
            }
            other => Err(BundlioError::Config(format!(
                "unsupported queue backend: {}",
                other
            ))),
        }
    }

    /// SQLite when a database path is configured, memory otherwise.
    pub fn build_tracker_store(&self) -> Result<Arc<dyn TrackerStore>> {
        match self.tracker_db_path.as_ref() {
            Some(path) => Ok(Arc::new(SqliteTrackerStore::new(path.clone())?)),
            None => {
                tracing::warn!("no tracker database configured, deal state is kept in memory");
                Ok(Arc::new(MemoryTrackerStore::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Buffer, BufferMessage};

    #[tokio::test]
    async fn test_builder_requires_namespace_and_backend() {
        let missing_namespace = BackendBuilder::new().backend("memory");
        assert!(matches!(
            missing_namespace.build_store::<Buffer>().await,
            Err(BundlioError::Config(_))
        ));

        let missing_backend = BackendBuilder::new().namespace("bundlio");
        assert!(missing_backend.build_store::<Buffer>().await.is_err());
    }

    #[tokio::test]
    async fn test_builder_rejects_unknown_backend() {
        let builder = BackendBuilder::new().backend("dynamo").namespace("bundlio");
        let err = builder
            .build_queue::<BufferMessage>("buffers")
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Configuration error: unsupported queue backend: dynamo"
        );
    }

    #[tokio::test]
    async fn test_redis_backend_requires_url() {
        let builder = BackendBuilder::new().backend("Redis").namespace("bundlio");
        assert!(builder.build_store::<Buffer>().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_backends_build() {
        let builder = BackendBuilder::new().backend("memory").namespace("bundlio");
        assert!(builder.build_store::<Buffer>().await.is_ok());
        assert!(builder.build_queue::<BufferMessage>("buffers").await.is_ok());
        assert!(builder.build_tracker_store().is_ok());
    }
}
