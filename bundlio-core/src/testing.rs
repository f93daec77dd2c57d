//! Test doubles shared by the unit tests.

use crate::{
    Aggregate, BufferedPiece, BundlioError, ContentSource, Contract, Delivery, MemoryStore,
    Marketplace, OfferDecision, OracleSource, PieceLink, Policy, Queue, QueueMessage,
    QueueOptions, Result, Snapshot, SourceFetcher, Store, StoreRecord,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn piece_link(tag: u32, size: u64) -> PieceLink {
    PieceLink::new(format!("{:064x}", tag), size)
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
}

pub fn buffered(tag: u32, size: u64, policy: Policy) -> BufferedPiece {
    BufferedPiece {
        piece: piece_link(tag, size),
        inserted_at: at(tag as i64),
        policy,
    }
}

/// Records every fetch and fails the configured URLs.
#[derive(Default)]
pub struct RecordingFetcher {
    calls: Mutex<Vec<String>>,
    failing: HashSet<String>,
}

impl RecordingFetcher {
    pub fn failing(urls: &[&str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: urls.iter().map(|url| url.to_string()).collect(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceFetcher for RecordingFetcher {
    async fn fetch(&self, source: &ContentSource) -> Result<Bytes> {
        self.calls.lock().unwrap().push(source.url.clone());
        if self.failing.contains(&source.url) {
            return Err(BundlioError::ContentResolver("unreachable".to_string()));
        }
        Ok(Bytes::from(source.url.clone()))
    }
}

pub struct FailingQueue;

#[async_trait]
impl<T: QueueMessage> Queue<T> for FailingQueue {
    async fn add(&self, _message: &T, _options: QueueOptions) -> Result<()> {
        Err(BundlioError::QueueSend("queue unavailable".to_string()))
    }

    async fn take(&self, _max: usize) -> Result<Vec<Delivery<T>>> {
        Err(BundlioError::QueueSend("queue unavailable".to_string()))
    }

    async fn ack(&self, _deliveries: &[Delivery<T>]) -> Result<()> {
        Err(BundlioError::QueueSend("queue unavailable".to_string()))
    }

    async fn nack(&self, _deliveries: Vec<Delivery<T>>) -> Result<usize> {
        Err(BundlioError::QueueSend("queue unavailable".to_string()))
    }
}

/// Serves reads from the wrapped store and fails every write.
pub struct ReadOnlyStore<T>(pub Arc<MemoryStore<T>>);

#[async_trait]
impl<T: StoreRecord> Store<T> for ReadOnlyStore<T> {
    async fn get(&self, id: &str) -> Result<T> {
        self.0.get(id).await
    }

    async fn has(&self, id: &str) -> Result<bool> {
        self.0.has(id).await
    }

    async fn put(&self, _record: &T) -> Result<()> {
        Err(BundlioError::StoreOperation("store is read only".to_string()))
    }

    async fn batch_write(&self, _records: &[T]) -> Result<()> {
        Err(BundlioError::StoreOperation("store is read only".to_string()))
    }
}

/// Fails the first `failures` writes, then writes through to the wrapped store.
pub struct FlakyStore<T> {
    inner: Arc<MemoryStore<T>>,
    failures: AtomicUsize,
}

impl<T> FlakyStore<T> {
    pub fn new(inner: Arc<MemoryStore<T>>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }

    fn fail_once(&self) -> Result<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BundlioError::StoreOperation("write timed out".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: StoreRecord> Store<T> for FlakyStore<T> {
    async fn get(&self, id: &str) -> Result<T> {
        self.inner.get(id).await
    }

    async fn has(&self, id: &str) -> Result<bool> {
        self.inner.has(id).await
    }

    async fn put(&self, record: &T) -> Result<()> {
        self.fail_once()?;
        self.inner.put(record).await
    }

    async fn batch_write(&self, records: &[T]) -> Result<()> {
        self.fail_once()?;
        self.inner.batch_write(records).await
    }
}

/// Answers offers from a script, accepting once the script runs out.
#[derive(Default)]
pub struct ScriptedMarketplace {
    decisions: Mutex<VecDeque<OfferDecision>>,
    offers: Mutex<Vec<(String, usize)>>,
}

impl ScriptedMarketplace {
    pub fn new(decisions: Vec<OfferDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            offers: Mutex::new(Vec::new()),
        }
    }

    /// Aggregate commitment and piece count of every offer made.
    pub fn offers(&self) -> Vec<(String, usize)> {
        self.offers.lock().unwrap().clone()
    }
}

#[async_trait]
impl Marketplace for ScriptedMarketplace {
    async fn offer(&self, aggregate: &Aggregate, pieces: &[PieceLink]) -> Result<OfferDecision> {
        self.offers
            .lock()
            .unwrap()
            .push((aggregate.piece.commitment.clone(), pieces.len()));
        Ok(self
            .decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OfferDecision::Accept))
    }

    async fn query(&self, _piece: &str) -> Result<Vec<Contract>> {
        Ok(Vec::new())
    }
}

/// Returns a fixed snapshot, or fails when none is set.
#[derive(Default)]
pub struct StaticOracle {
    snapshot: Mutex<Option<Snapshot>>,
}

impl StaticOracle {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn set(&self, snapshot: Option<Snapshot>) {
        *self.snapshot.lock().unwrap() = snapshot;
    }
}

#[async_trait]
impl OracleSource for StaticOracle {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        self.snapshot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BundlioError::Reconciliation("snapshot unavailable".to_string()))
    }
}
