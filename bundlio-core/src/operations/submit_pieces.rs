use crate::{
    AggregateLimits, Buffer, BufferMessage, BufferedPiece, BundlioError, ContentId,
    ContentResolver, PartialBatchFailure, Piece, PieceLink, PieceReceipt, Policy, Queue,
    QueueOptions, ResolveItem, Result, Store, encode_buffer,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Clone)]
pub struct SubmitPiecesOperation {
    piece_store: Arc<dyn Store<Piece>>,
    receipt_store: Arc<dyn Store<PieceReceipt>>,
    buffer_store: Arc<dyn Store<Buffer>>,
    buffer_queue: Arc<dyn Queue<BufferMessage>>,
    resolver: Option<ContentResolver>,
    limits: AggregateLimits,
    entry_overhead: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceSubmission {
    pub piece: PieceLink,
    pub storefront: String,
    pub group: String,
    #[serde(default)]
    pub inserted_at: Option<DateTime<Utc>>,
    /// Locations the piece content can be read from. When present the
    /// content must be reachable before the piece is accepted.
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SubmitPiecesOperationRequest {
    pub items: Vec<PieceSubmission>,
}

#[derive(Debug, Clone, Default)]
pub struct SubmitPiecesOperationResult {
    pub buffers: Vec<ContentId>,
    pub accepted: usize,
    pub skipped: usize,
    pub failures: PartialBatchFailure,
}

impl SubmitPiecesOperation {
    pub fn new(
        piece_store: Arc<dyn Store<Piece>>,
        receipt_store: Arc<dyn Store<PieceReceipt>>,
        buffer_store: Arc<dyn Store<Buffer>>,
        buffer_queue: Arc<dyn Queue<BufferMessage>>,
        limits: AggregateLimits,
        entry_overhead: u64,
    ) -> Self {
        Self {
            piece_store,
            receipt_store,
            buffer_store,
            buffer_queue,
            resolver: None,
            limits,
            entry_overhead,
        }
    }

    /// Check piece availability through `resolver` before accepting pieces
    /// that carry sources.
    pub fn with_resolver(mut self, resolver: ContentResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub async fn run(
        &self,
        request: SubmitPiecesOperationRequest,
    ) -> Result<SubmitPiecesOperationResult> {
        let SubmitPiecesOperationRequest { items } = request;

        let mut result = SubmitPiecesOperationResult::default();
        let mut seen = HashSet::new();
        let mut groups: BTreeMap<(String, String), Vec<Piece>> = BTreeMap::new();
        let now = Utc::now();

        for item in items {
            let id = item.piece.commitment.clone();
            if !seen.insert(id.clone()) {
                result.skipped += 1;
                continue;
            }

            if !self.limits.admits(item.piece.size, self.entry_overhead) {
                tracing::warn!(
                    "rejecting piece larger than an aggregate. piece={} size={} max_aggregate_size={}",
                    id,
                    item.piece.size,
                    self.limits.max_aggregate_size
                );
                result.failures.push(id, "piece too large");
                continue;
            }

            match self.receipt_store.has(&id).await {
                Ok(true) => {
                    result.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(error) => {
                    result.failures.push(id, error.to_string());
                    continue;
                }
            }

            // A claimed piece without a receipt is buffered again exactly as
            // first recorded, so its buffer keeps the same cid.
            let claimed = match self.piece_store.get(&id).await {
                Ok(piece) => Some(piece),
                Err(BundlioError::NotFound(_)) => None,
                Err(error) => {
                    result.failures.push(id, error.to_string());
                    continue;
                }
            };

            if let Err(reason) = self.check_available(&item).await {
                tracing::warn!("piece content unavailable. piece={} reason={}", id, reason);
                result.failures.push(id, reason);
                continue;
            }

            let piece = claimed.unwrap_or_else(|| Piece {
                piece: item.piece,
                inserted_at: item.inserted_at.unwrap_or(now),
                storefront: item.storefront,
                group: item.group,
            });
            groups
                .entry((piece.storefront.clone(), piece.group.clone()))
                .or_default()
                .push(piece);
        }

        for ((storefront, group), pieces) in groups {
            match self.buffer_group(storefront, group, &pieces).await {
                Ok(cid) => {
                    result.accepted += pieces.len();
                    result.buffers.push(cid);
                }
                Err(error) => {
                    tracing::warn!(
                        "failed to buffer {} pieces, reporting them as failed: {}",
                        pieces.len(),
                        error
                    );
                    for piece in &pieces {
                        result
                            .failures
                            .push(piece.piece.commitment.clone(), error.to_string());
                    }
                }
            }
        }

        tracing::info!(
            "submitted pieces accepted={} skipped={} failed={} buffers={}",
            result.accepted,
            result.skipped,
            result.failures.len(),
            result.buffers.len()
        );

        Ok(result)
    }

    async fn check_available(&self, item: &PieceSubmission) -> std::result::Result<(), String> {
        let Some(resolver) = self.resolver.as_ref() else {
            return Ok(());
        };
        if item.sources.is_empty() {
            return Ok(());
        }

        let bytes = resolver
            .resolve(&ResolveItem {
                sources: item.sources.clone(),
                size: item.piece.size,
            })
            .await
            .map_err(|error| error.to_string())?;

        if bytes.len() as u64 > item.piece.size {
            return Err(format!(
                "content is {} bytes, larger than piece size {}",
                bytes.len(),
                item.piece.size
            ));
        }
        Ok(())
    }

    async fn buffer_group(
        &self,
        storefront: String,
        group: String,
        pieces: &[Piece],
    ) -> Result<ContentId> {
        let buffer = Buffer {
            pieces: pieces
                .iter()
                .map(|piece| BufferedPiece {
                    piece: piece.piece.clone(),
                    inserted_at: piece.inserted_at,
                    policy: Policy::Normal,
                })
                .collect(),
            storefront,
            group,
        };
        let block = encode_buffer(&buffer)?;

        self.piece_store.batch_write(pieces).await?;
        self.buffer_store.put(&buffer).await?;
        self.buffer_queue
            .add(&block.message(), QueueOptions::grouped(buffer.group_key()))
            .await?;
        // Pieces count as submitted only once their buffer is queued.
        let receipts: Vec<PieceReceipt> = pieces
            .iter()
            .map(|piece| PieceReceipt {
                piece: piece.piece.commitment.clone(),
                buffer: block.cid.clone(),
            })
            .collect();
        self.receipt_store.batch_write(&receipts).await?;

        tracing::debug!(
            "queued buffer cid={} group={} pieces={}",
            block.cid,
            buffer.group_key(),
            pieces.len()
        );
        Ok(block.cid)
    }
}
