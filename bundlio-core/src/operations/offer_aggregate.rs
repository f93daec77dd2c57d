use crate::{
    Aggregate, AggregateStatus, Buffer, BufferMessage, BufferedPiece, BundlioError, ContentId,
    Deal, DealStatus, DealStore, Inclusion, InclusionStatus, Marketplace, OfferDecision,
    PieceLink, Policy, Queue, QueueOptions, Result, Store, TrackerStore, encode_buffer,
    inclusion_key,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct OfferAggregateOperation {
    aggregate_store: Arc<dyn Store<Aggregate>>,
    buffer_store: Arc<dyn Store<Buffer>>,
    inclusion_store: Arc<dyn Store<Inclusion>>,
    buffer_queue: Arc<dyn Queue<BufferMessage>>,
    tracker: Arc<dyn TrackerStore>,
    marketplace: Arc<dyn Marketplace>,
}

#[derive(Debug, Clone)]
pub struct OfferAggregateOperationRequest {
    pub aggregate: Aggregate,
    pub submitted_at: DateTime<Utc>,
}

/// A decision reported for an already offered aggregate.
#[derive(Debug, Clone)]
pub struct ApplyDecisionOperationRequest {
    pub aggregate: String,
    pub decision: OfferDecision,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferAggregateOperationResult {
    pub aggregate: String,
    pub stat: AggregateStatus,
    pub deal: DealStatus,
    pub inclusions: usize,
    /// Buffer the pieces of a rejected aggregate were queued in again.
    pub retry_buffer: Option<ContentId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferAggregateOperationOutcome {
    Decided(OfferAggregateOperationResult),
    AlreadyDecided {
        aggregate: String,
        stat: AggregateStatus,
    },
}

impl OfferAggregateOperation {
    pub fn new(
        aggregate_store: Arc<dyn Store<Aggregate>>,
        buffer_store: Arc<dyn Store<Buffer>>,
        inclusion_store: Arc<dyn Store<Inclusion>>,
        buffer_queue: Arc<dyn Queue<BufferMessage>>,
        tracker: Arc<dyn TrackerStore>,
        marketplace: Arc<dyn Marketplace>,
    ) -> Self {
        Self {
            aggregate_store,
            buffer_store,
            inclusion_store,
            buffer_queue,
            tracker,
            marketplace,
        }
    }

    pub async fn run(
        &self,
        request: OfferAggregateOperationRequest,
    ) -> Result<OfferAggregateOperationOutcome> {
        let OfferAggregateOperationRequest {
            mut aggregate,
            submitted_at,
        } = request;
        let id = aggregate.piece.commitment.clone();

        aggregate.stat = match self.load_aggregate(&id).await? {
            // Only a rejected aggregate rebuilt from a retry buffer is offered again.
            Some(existing)
                if existing.stat == AggregateStatus::Accepted
                    || (existing.stat.is_decided() && existing.buffer == aggregate.buffer) =>
            {
                tracing::info!(
                    "aggregate already decided, skipping offer. aggregate={} stat={}",
                    id,
                    existing.stat
                );
                return Ok(OfferAggregateOperationOutcome::AlreadyDecided {
                    aggregate: id,
                    stat: existing.stat,
                });
            }
            Some(existing) => existing.stat.transition_to(AggregateStatus::Offered)?,
            None => AggregateStatus::Offered,
        };
        let buffer = self.buffer_store.get(aggregate.buffer.as_str()).await?;
        self.aggregate_store.put(&aggregate).await?;

        let inclusions: Vec<Inclusion> = buffer
            .pieces
            .iter()
            .map(|piece| Inclusion {
                aggregate: id.clone(),
                piece: piece.piece.commitment.clone(),
                inserted_at: piece.inserted_at,
                submitted_at,
                resolved_at: None,
                stat: InclusionStatus::Pending,
                failed_reason: None,
            })
            .collect();
        self.inclusion_store.batch_write(&inclusions).await?;

        let open_deal = self
            .tracker
            .get_deal(&id)
            .await?
            .is_some_and(|deal| deal.status != DealStatus::Rejected);
        if !open_deal {
            self.tracker
                .put_deal(&Deal::pending(id.clone(), submitted_at))
                .await?;
        }

        let links: Vec<PieceLink> = buffer.pieces.iter().map(|p| p.piece.clone()).collect();
        let decision = self.marketplace.offer(&aggregate, &links).await?;
        tracing::info!(
            "offered aggregate={} pieces={} decision={:?}",
            id,
            links.len(),
            decision
        );

        self.apply_decision(ApplyDecisionOperationRequest {
            aggregate: id,
            decision,
            resolved_at: Utc::now(),
        })
        .await
    }

    /// Moves the aggregate, its deal and, on rejection, its inclusions to the
    /// decided state. A rejected aggregate's pieces are buffered again with the
    /// retry policy.
    pub async fn apply_decision(
        &self,
        request: ApplyDecisionOperationRequest,
    ) -> Result<OfferAggregateOperationOutcome> {
        let ApplyDecisionOperationRequest {
            aggregate: id,
            decision,
            resolved_at,
        } = request;

        let mut aggregate = self.aggregate_store.get(&id).await?;
        let target = match decision {
            OfferDecision::Accept => AggregateStatus::Accepted,
            OfferDecision::Reject { .. } => AggregateStatus::Rejected,
        };
        if aggregate.stat == target {
            return Ok(OfferAggregateOperationOutcome::AlreadyDecided {
                aggregate: id,
                stat: aggregate.stat,
            });
        }
        let next = aggregate.stat.transition_to(target)?;

        let buffer = self.buffer_store.get(aggregate.buffer.as_str()).await?;
        let mut deal = self
            .tracker
            .get_deal(&id)
            .await?
            .unwrap_or_else(|| Deal::pending(id.clone(), resolved_at));

        let mut retry_buffer = None;
        match decision {
            OfferDecision::Accept => {
                if deal.status == DealStatus::Pending {
                    deal.status = DealStatus::Signed;
                }
            }
            OfferDecision::Reject { reason } => {
                deal.status = deal.status.transition_to(DealStatus::Rejected)?;
                deal.reason = Some(reason.clone());

                retry_buffer = Some(self.requeue_for_retry(&buffer).await?);
                self.fail_inclusions(&id, &buffer, &reason, resolved_at)
                    .await?;
                tracing::warn!(
                    "aggregate rejected, pieces queued for retry. aggregate={} pieces={} reason={}",
                    id,
                    buffer.pieces.len(),
                    reason
                );
            }
        }

        deal.updated_at = resolved_at;
        self.tracker.put_deal(&deal).await?;

        aggregate.stat = next;
        self.aggregate_store.put(&aggregate).await?;

        Ok(OfferAggregateOperationOutcome::Decided(
            OfferAggregateOperationResult {
                aggregate: id,
                stat: next,
                deal: deal.status,
                inclusions: buffer.pieces.len(),
                retry_buffer,
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

    async fn requeue_for_retry(&self, buffer: &Buffer) -> Result<ContentId> {
        let retry = Buffer {
            pieces: buffer
                .pieces
                .iter()
                .map(|piece| BufferedPiece {
                    piece: piece.piece.clone(),
                    inserted_at: piece.inserted_at,
                    policy: Policy::Retry,
                })
                .collect(),
            storefront: buffer.storefront.clone(),
            group: buffer.group.clone(),
        };
        let block = encode_buffer(&retry)?;
        self.buffer_store.put(&retry).await?;
        self.buffer_queue
            .add(&block.message(), QueueOptions::grouped(retry.group_key()))
            .await?;
        Ok(block.cid)
    }

    async fn fail_inclusions(
        &self,
        aggregate: &str,
        buffer: &Buffer,
        reason: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inclusions = Vec::with_capacity(buffer.pieces.len());
        for piece in &buffer.pieces {
            let key = inclusion_key(aggregate, &piece.piece.commitment);
            let mut inclusion = match self.inclusion_store.get(&key).await {
                Ok(inclusion) => inclusion,
                Err(BundlioError::NotFound(_)) => Inclusion {
                    aggregate: aggregate.to_string(),
                    piece: piece.piece.commitment.clone(),
                    inserted_at: piece.inserted_at,
                    submitted_at: resolved_at,
                    resolved_at: None,
                    stat: InclusionStatus::Pending,
                    failed_reason: None,
                },
                Err(error) => return Err(error),
            };
            inclusion.stat = inclusion.stat.transition_to(InclusionStatus::Fail)?;
            inclusion.resolved_at = Some(resolved_at);
            inclusion.failed_reason = Some(reason.to_string());
            inclusions.push(inclusion);
        }
        self.inclusion_store.batch_write(&inclusions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedMarketplace, at, buffered};
    use crate::{MemoryQueue, MemoryStore, MemoryTrackerStore};

    struct Fixture {
        aggregates: Arc<MemoryStore<Aggregate>>,
        buffers: Arc<MemoryStore<Buffer>>,
        inclusions: Arc<MemoryStore<Inclusion>>,
        queue: Arc<MemoryQueue<BufferMessage>>,
        tracker: Arc<MemoryTrackerStore>,
        marketplace: Arc<ScriptedMarketplace>,
    }

    impl Fixture {
        fn new(decisions: Vec<OfferDecision>) -> Self {
            Self {
                aggregates: Arc::new(MemoryStore::new()),
                buffers: Arc::new(MemoryStore::new()),
                inclusions: Arc::new(MemoryStore::new()),
                queue: Arc::new(MemoryQueue::new()),
                tracker: Arc::new(MemoryTrackerStore::new()),
                marketplace: Arc::new(ScriptedMarketplace::new(decisions)),
            }
        }

        fn operation(&self) -> OfferAggregateOperation {
            OfferAggregateOperation::new(
                self.aggregates.clone(),
                self.buffers.clone(),
                self.inclusions.clone(),
                self.queue.clone(),
                self.tracker.clone(),
                self.marketplace.clone(),
            )
        }

        async fn aggregate(&self, pieces: u32) -> Aggregate {
            let buffer = Buffer {
                pieces: (0..pieces).map(|t| buffered(t, 1, Policy::Normal)).collect(),
                storefront: "web3.storage".to_string(),
                group: "did:web:web3.storage".to_string(),
            };
            self.buffers.put(&buffer).await.unwrap();
            Aggregate {
                piece: PieceLink::new("ab".repeat(32), 100),
                buffer: encode_buffer(&buffer).unwrap().cid,
                invocation: None,
                task: None,
                inserted_at: at(pieces as i64),
                storefront: buffer.storefront,
                group: buffer.group,
                stat: AggregateStatus::Offered,
            }
        }
    }

    fn offer(aggregate: Aggregate) -> OfferAggregateOperationRequest {
        OfferAggregateOperationRequest {
            aggregate,
            submitted_at: at(100),
        }
    }

    #[tokio::test]
    async fn test_accepted_offer_signs_deal() {
        let fixture = Fixture::new(vec![]);
        let aggregate = fixture.aggregate(3).await;
        let id = aggregate.piece.commitment.clone();

        let outcome = fixture.operation().run(offer(aggregate)).await.unwrap();

        let OfferAggregateOperationOutcome::Decided(result) = outcome else {
            panic!("expected a decision");
        };
        assert_eq!(result.stat, AggregateStatus::Accepted);
        assert_eq!(result.deal, DealStatus::Signed);
        assert_eq!(result.inclusions, 3);
        assert!(result.retry_buffer.is_none());

        assert_eq!(
            fixture.aggregates.get(&id).await.unwrap().stat,
            AggregateStatus::Accepted
        );
        let piece = buffered(1, 1, Policy::Normal).piece.commitment;
        let inclusion = fixture
            .inclusions
            .get(&inclusion_key(&id, &piece))
            .await
            .unwrap();
        assert_eq!(inclusion.stat, InclusionStatus::Pending);
        assert_eq!(inclusion.submitted_at, at(100));
        assert_eq!(fixture.marketplace.offers(), vec![(id, 3)]);
    }

    #[tokio::test]
    async fn test_rejected_offer_requeues_pieces_for_retry() {
        let fixture = Fixture::new(vec![OfferDecision::Reject {
            reason: "piece not found".to_string(),
        }]);
        let aggregate = fixture.aggregate(4).await;
        let id = aggregate.piece.commitment.clone();

        let outcome = fixture.operation().run(offer(aggregate)).await.unwrap();
        let OfferAggregateOperationOutcome::Decided(result) = outcome else {
            panic!("expected a decision");
        };
        assert_eq!(result.stat, AggregateStatus::Rejected);
        assert_eq!(result.deal, DealStatus::Rejected);

        let deal = fixture.tracker.get_deal(&id).await.unwrap().unwrap();
        assert_eq!(deal.reason.as_deref(), Some("piece not found"));

        let piece = buffered(2, 1, Policy::Normal).piece.commitment;
        let inclusion = fixture
            .inclusions
            .get(&inclusion_key(&id, &piece))
            .await
            .unwrap();
        assert_eq!(inclusion.stat, InclusionStatus::Fail);
        assert_eq!(inclusion.failed_reason.as_deref(), Some("piece not found"));
        assert!(inclusion.resolved_at.is_some());

        let queued = fixture.queue.peek_all().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(Some(&queued[0].payload.buffer), result.retry_buffer.as_ref());
        let retry = fixture
            .buffers
            .get(queued[0].payload.buffer.as_str())
            .await
            .unwrap();
        assert_eq!(retry.pieces.len(), 4);
        assert!(retry.pieces.iter().all(|p| p.policy == Policy::Retry));
    }

    #[tokio::test]
    async fn test_replayed_offer_is_noop_once_decided() {
        let fixture = Fixture::new(vec![]);
        let aggregate = fixture.aggregate(2).await;
        let operation = fixture.operation();

        operation.run(offer(aggregate.clone())).await.unwrap();
        let replay = operation.run(offer(aggregate.clone())).await.unwrap();

        assert_eq!(
            replay,
            OfferAggregateOperationOutcome::AlreadyDecided {
                aggregate: aggregate.piece.commitment.clone(),
                stat: AggregateStatus::Accepted,
            }
        );
        assert_eq!(fixture.marketplace.offers().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_offer_after_retry_keeps_acceptance() {
        let fixture = Fixture::new(vec![OfferDecision::Reject {
            reason: "piece not found".to_string(),
        }]);
        let original = fixture.aggregate(3).await;
        let id = original.piece.commitment.clone();
        let operation = fixture.operation();

        let OfferAggregateOperationOutcome::Decided(rejected) =
            operation.run(offer(original.clone())).await.unwrap()
        else {
            panic!("expected a decision");
        };
        let retry_buffer = rejected.retry_buffer.unwrap();

        // Same pieces, so the rebuilt aggregate keeps the commitment.
        let retried = Aggregate {
            buffer: retry_buffer.clone(),
            ..original.clone()
        };
        let OfferAggregateOperationOutcome::Decided(accepted) =
            operation.run(offer(retried)).await.unwrap()
        else {
            panic!("expected a decision");
        };
        assert_eq!(accepted.stat, AggregateStatus::Accepted);

        let replay = operation.run(offer(original)).await.unwrap();
        assert_eq!(
            replay,
            OfferAggregateOperationOutcome::AlreadyDecided {
                aggregate: id.clone(),
                stat: AggregateStatus::Accepted,
            }
        );

        let stored = fixture.aggregates.get(&id).await.unwrap();
        assert_eq!(stored.stat, AggregateStatus::Accepted);
        assert_eq!(stored.buffer, retry_buffer);
        assert_eq!(fixture.marketplace.offers().len(), 2);
        assert_eq!(
            fixture.tracker.get_deal(&id).await.unwrap().unwrap().status,
            DealStatus::Signed
        );
    }

    #[tokio::test]
    async fn test_conflicting_decision_is_rejected() {
        let fixture = Fixture::new(vec![]);
        let aggregate = fixture.aggregate(2).await;
        let id = aggregate.piece.commitment.clone();
        let operation = fixture.operation();
        operation.run(offer(aggregate)).await.unwrap();

        let err = operation
            .apply_decision(ApplyDecisionOperationRequest {
                aggregate: id,
                decision: OfferDecision::Reject {
                    reason: "late".to_string(),
                },
                resolved_at: at(200),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BundlioError::InvalidTransition { .. }));
        assert!(!err.is_retryable());
        assert!(fixture.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_decision_for_unknown_aggregate() {
        let fixture = Fixture::new(vec![]);
        let err = fixture
            .operation()
            .apply_decision(ApplyDecisionOperationRequest {
                aggregate: "unknown".to_string(),
                decision: OfferDecision::Accept,
                resolved_at: at(0),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BundlioError::NotFound(_)));
    }
}
