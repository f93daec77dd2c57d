use crate::{
    Aggregate, AggregateBuild, AggregateInfo, AggregateLimits, AggregateStatus, Buffer,
    BufferMessage, BufferedPiece, BundlioError, CommitmentScheme, ContentId, Queue, QueueOptions,
    Result, Store, build_aggregate, encode_buffer,
};
use futures_util::future::try_join_all;
use std::sync::Arc;

#[derive(Clone)]
pub struct ReduceBuffersOperation {
    buffer_store: Arc<dyn Store<Buffer>>,
    aggregate_store: Arc<dyn Store<Aggregate>>,
    buffer_queue: Arc<dyn Queue<BufferMessage>>,
    aggregate_queue: Arc<dyn Queue<Aggregate>>,
    scheme: Arc<dyn CommitmentScheme>,
    limits: AggregateLimits,
}

#[derive(Debug, Clone)]
pub struct ReduceBuffersOperationRequest {
    pub buffers: Vec<ContentId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceBuffersOperationResult {
    pub aggregate: Aggregate,
    pub added_buffer: ContentId,
    pub remaining_buffer: Option<ContentId>,
    pub used_space: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReduceBuffersOperationOutcome {
    /// Not enough mass. The merged buffer was stored and queued again.
    Insufficient { buffer: ContentId, used_space: u64 },
    Aggregated(ReduceBuffersOperationResult),
    /// The same reduction already produced this aggregate.
    AlreadyAggregated { aggregate: String },
}

impl ReduceBuffersOperation {
    pub fn new(
        buffer_store: Arc<dyn Store<Buffer>>,
        aggregate_store: Arc<dyn Store<Aggregate>>,
        buffer_queue: Arc<dyn Queue<BufferMessage>>,
        aggregate_queue: Arc<dyn Queue<Aggregate>>,
        scheme: Arc<dyn CommitmentScheme>,
        limits: AggregateLimits,
    ) -> Self {
        Self {
            buffer_store,
            aggregate_store,
            buffer_queue,
            aggregate_queue,
            scheme,
            limits,
        }
    }

    pub async fn run(
        &self,
        request: ReduceBuffersOperationRequest,
    ) -> Result<ReduceBuffersOperationOutcome> {
        let ReduceBuffersOperationRequest { buffers } = request;

        if buffers.is_empty() {
            return Err(BundlioError::InvalidRequest(
                "no buffers to reduce".to_string(),
            ));
        }

        let fetched = try_join_all(
            buffers
                .iter()
                .map(|cid| self.buffer_store.get(cid.as_str())),
        )
        .await?;

        let storefront = fetched[0].storefront.clone();
        let group = fetched[0].group.clone();
        let pieces: Vec<BufferedPiece> = fetched
            .into_iter()
            .flat_map(|buffer| buffer.pieces)
            .collect();

        match build_aggregate(&pieces, &self.limits, self.scheme.as_ref())? {
            AggregateBuild::Insufficient { used_space } => {
                let merged = Buffer {
                    pieces,
                    storefront,
                    group,
                };
                let buffer = self.store_and_requeue(&merged).await?;
                tracing::info!(
                    "buffer below aggregate floor, requeued. buffer={} pieces={} used_space={}",
                    buffer,
                    merged.pieces.len(),
                    used_space
                );
                Ok(ReduceBuffersOperationOutcome::Insufficient { buffer, used_space })
            }
            AggregateBuild::Built(info) => self.emit_aggregate(info, storefront, group).await,
        }
    }

    async fn emit_aggregate(
        &self,
        info: AggregateInfo,
        storefront: String,
        group: String,
    ) -> Result<ReduceBuffersOperationOutcome> {
        let AggregateInfo {
            added,
            remaining,
            link,
            used_space,
        } = info;

        // A rejected aggregate may be rebuilt from its retry buffer.
        if let Some(existing) = self.load_aggregate(&link.commitment).await? {
            if existing.stat != AggregateStatus::Rejected {
                tracing::info!(
                    "aggregate already produced by an earlier pass. aggregate={} stat={}",
                    link,
                    existing.stat
                );
                return Ok(ReduceBuffersOperationOutcome::AlreadyAggregated {
                    aggregate: link.commitment,
                });
            }
        }

        let inserted_at = added
            .iter()
            .map(|piece| piece.inserted_at)
            .max()
            .ok_or_else(|| BundlioError::Internal("aggregate without pieces".to_string()))?;

        let added_buffer = Buffer {
            pieces: added,
            storefront: storefront.clone(),
            group: group.clone(),
        };
        let remaining_buffer = (!remaining.is_empty()).then(|| Buffer {
            pieces: remaining,
            storefront: storefront.clone(),
            group: group.clone(),
        });

        let added_cid = encode_buffer(&added_buffer)?.cid;
        let mut writes = vec![added_buffer];
        writes.extend(remaining_buffer.iter().cloned());
        self.buffer_store.batch_write(&writes).await?;

        let remaining_cid = match remaining_buffer.as_ref() {
            Some(buffer) => {
                let block = encode_buffer(buffer)?;
                self.buffer_queue
                    .add(&block.message(), QueueOptions::grouped(buffer.group_key()))
                    .await?;
                Some(block.cid)
            }
            None => None,
        };

        let aggregate = Aggregate {
            piece: link,
            buffer: added_cid.clone(),
            invocation: None,
            task: None,
            inserted_at,
            storefront,
            group,
            stat: AggregateStatus::Offered,
        };

        self.aggregate_queue
            .add(&aggregate, QueueOptions::grouped(aggregate.group_key()))
            .await?;
        // The stored record marks this reduction complete for replays.
        self.aggregate_store.put(&aggregate).await?;

        tracing::info!(
            "emitted aggregate={} buffer={} used_space={} remaining={}",
            aggregate.piece,
            added_cid,
            used_space,
            remaining_cid
                .as_ref()
                .map(ContentId::as_str)
                .unwrap_or("none")
        );

        Ok(ReduceBuffersOperationOutcome::Aggregated(
            ReduceBuffersOperationResult {
                aggregate,
                added_buffer: added_cid,
                remaining_buffer: remaining_cid,
                used_space,
            },
        ))
    }

    async fn load_aggregate(&self, id: &str) -> Result<Option<Aggregate>> {
        match self.aggregate_store.get(id).await {
            Ok(aggregate) => Ok(Some(aggregate)),
            Err(BundlioError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn store_and_requeue(&self, buffer: &Buffer) -> Result<ContentId> {
        let block = encode_buffer(buffer)?;
        self.buffer_store.put(buffer).await?;
        self.buffer_queue
            .add(&block.message(), QueueOptions::grouped(buffer.group_key()))
            .await?;
        Ok(block.cid)
    }
}
