use crate::{BundlioError, Result, StoreRecord};
use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::marker::PhantomData;
use tokio::sync::RwLock;

/// Key-value persistence for content-addressed records.
#[async_trait]
pub trait Store<T: StoreRecord>: Send + Sync {
    /// Fails with [`BundlioError::NotFound`] when no record exists for `id`.
    async fn get(&self, id: &str) -> Result<T>;

    async fn has(&self, id: &str) -> Result<bool>;

    async fn put(&self, record: &T) -> Result<()>;

    async fn batch_write(&self, records: &[T]) -> Result<()>;
}

pub struct MemoryStore<T> {
    records: RwLock<HashMap<String, Bytes>>,
    _record: PhantomData<fn() -> T>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            _record: PhantomData,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: StoreRecord> Store<T> for MemoryStore<T> {
    async fn get(&self, id: &str) -> Result<T> {
        let key = T::key_for(id);
        let bytes = self
            .records
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| BundlioError::NotFound(key))?;
        T::from_record(id, &bytes)
    }

    async fn has(&self, id: &str) -> Result<bool> {
        Ok(self.records.read().await.contains_key(&T::key_for(id)))
    }

    async fn put(&self, record: &T) -> Result<()> {
        let record = record.to_record()?;
        tracing::debug!("memory store put key={}", record.key);
        self.records.write().await.insert(record.key, record.value);
        Ok(())
    }

    async fn batch_write(&self, records: &[T]) -> Result<()> {
        let encoded = records
            .iter()
            .map(StoreRecord::to_record)
            .collect::<Result<Vec<_>>>()?;

        let mut guard = self.records.write().await;
        for record in encoded {
            guard.insert(record.key, record.value);
        }
        Ok(())
    }
}

pub struct RedisStore<T> {
    conn: MultiplexedConnection,
    namespace: String,
    _record: PhantomData<fn() -> T>,
}

impl<T> RedisStore<T> {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|error| {
            BundlioError::Config(format!("redis store connection config error: {}", error))
        })?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error)?;

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            _record: PhantomData,
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl<T: StoreRecord> Store<T> for RedisStore<T> {
    async fn get(&self, id: &str) -> Result<T> {
        let key = self.namespaced(&T::key_for(id));
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(&key).await.map_err(store_error)?;
        match value {
            Some(bytes) => T::from_record(id, &bytes),
            None => Err(BundlioError::NotFound(key)),
        }
    }

    async fn has(&self, id: &str) -> Result<bool> {
        let key = self.namespaced(&T::key_for(id));
        let mut conn = self.conn.clone();
        conn.exists::<_, bool>(&key).await.map_err(store_error)
    }

    async fn put(&self, record: &T) -> Result<()> {
        let record = record.to_record()?;
        let key = self.namespaced(&record.key);
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&key, record.value.as_ref())
            .await
            .map_err(store_error)?;
        tracing::debug!("redis store put key={}", key);
        Ok(())
    }

    async fn batch_write(&self, records: &[T]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in records {
            let record = record.to_record()?;
            pipe.set(self.namespaced(&record.key), record.value.as_ref())
                .ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

fn store_error(error: redis::RedisError) -> BundlioError {
    BundlioError::StoreOperation(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Buffer, BufferedPiece, PieceLink, Policy, encode_buffer};
    use chrono::Utc;

    fn buffer(group: &str) -> Buffer {
        Buffer {
            pieces: vec![BufferedPiece {
                piece: PieceLink::new("cd".repeat(32), 512),
                inserted_at: Utc::now(),
                policy: Policy::Normal,
            }],
            storefront: "storefront".to_string(),
            group: group.to_string(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store: MemoryStore<Buffer> = MemoryStore::new();
        let record = buffer("g1");
        let cid = encode_buffer(&record).unwrap().cid;

        assert!(!store.has(cid.as_str()).await.unwrap());
        store.put(&record).await.unwrap();
        assert!(store.has(cid.as_str()).await.unwrap());
        assert_eq!(store.get(cid.as_str()).await.unwrap(), record);

        // Content-addressed writes are idempotent.
        store.put(&record).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_not_found() {
        let store: MemoryStore<Buffer> = MemoryStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, BundlioError::NotFound(key) if key == "missing/missing"));
    }

    #[tokio::test]
    async fn test_memory_store_batch_write() {
        let store: MemoryStore<Buffer> = MemoryStore::new();
        store
            .batch_write(&[buffer("g1"), buffer("g2")])
            .await
            .unwrap();
        assert_eq!(store.len().await, 2);
    }
}
