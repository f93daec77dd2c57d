use crate::{
    Aggregate, AggregateStatus, Buffer, BundlioError, Contract, Deal, DealStatus, DealStore,
    Inclusion, InclusionStatus, OracleSource, Result, Store, TrackerStore, inclusion_key,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct ReconcileDealsOperation {
    oracle: Arc<dyn OracleSource>,
    tracker: Arc<dyn TrackerStore>,
    aggregate_store: Arc<dyn Store<Aggregate>>,
    buffer_store: Arc<dyn Store<Buffer>>,
    inclusion_store: Arc<dyn Store<Inclusion>>,
}

#[derive(Debug, Clone)]
pub struct ReconcileDealsOperationRequest {
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileDealsOperationResult {
    pub replicas: usize,
    pub contracts_added: usize,
    pub approved: Vec<String>,
}

impl ReconcileDealsOperation {
    pub fn new(
        oracle: Arc<dyn OracleSource>,
        tracker: Arc<dyn TrackerStore>,
        aggregate_store: Arc<dyn Store<Aggregate>>,
        buffer_store: Arc<dyn Store<Buffer>>,
        inclusion_store: Arc<dyn Store<Inclusion>>,
    ) -> Self {
        Self {
            oracle,
            tracker,
            aggregate_store,
            buffer_store,
            inclusion_store,
        }
    }

    /// One reconciliation tick. Nothing is written unless the whole snapshot
    /// was fetched and decoded.
    pub async fn run(
        &self,
        request: ReconcileDealsOperationRequest,
    ) -> Result<ReconcileDealsOperationResult> {
        let ReconcileDealsOperationRequest { now } = request;

        let snapshot = self.oracle.fetch_snapshot().await?;
        let source = self.oracle.name().to_string();
        let entries: Vec<(String, Vec<Contract>)> = snapshot
            .replicas
            .iter()
            .map(|replica| (replica.piece_commitment.clone(), replica.to_contracts(&source)))
            .collect();

        let contracts_added = self
            .tracker
            .append_contracts(&entries)
            .await
            .map_err(|e| BundlioError::Reconciliation(format!("applying snapshot: {}", e)))?;

        let open = self
            .tracker
            .deals_with_status(&[DealStatus::Pending, DealStatus::Signed])
            .await?;

        let mut approved = Vec::new();
        for deal in open {
            let contracts = self.tracker.contracts(&deal.aggregate).await?;
            if contracts.is_empty() {
                continue;
            }
            let aggregate = deal.aggregate.clone();
            self.approve(deal, contracts, now).await?;
            approved.push(aggregate);
        }

        tracing::info!(
            "reconciled deals replicas={} contracts_added={} approved={}",
            snapshot.replicas.len(),
            contracts_added,
            approved.len()
        );

        Ok(ReconcileDealsOperationResult {
            replicas: snapshot.replicas.len(),
            contracts_added,
            approved,
        })
    }

    /// All known contracts for a piece; empty when none are known.
    pub async fn contracts(&self, piece: &str) -> Result<Vec<Contract>> {
        self.tracker.contracts(piece).await
    }

    async fn approve(
        &self,
        mut deal: Deal,
        contracts: Vec<Contract>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let next = deal.status.transition_to(DealStatus::Approved)?;

        match self.aggregate_store.get(&deal.aggregate).await {
            Ok(mut aggregate) => {
                self.resolve_inclusions(&aggregate, now).await?;
                if aggregate.stat == AggregateStatus::Offered {
                    aggregate.stat = aggregate.stat.transition_to(AggregateStatus::Accepted)?;
                    self.aggregate_store.put(&aggregate).await?;
                }
            }
            Err(BundlioError::NotFound(_)) => {
                tracing::warn!(
                    "approving deal without a stored aggregate. aggregate={}",
                    deal.aggregate
                );
            }
            Err(error) => return Err(error),
        }

        tracing::info!(
            "deal approved aggregate={} contracts={}",
            deal.aggregate,
            contracts.len()
        );
        deal.status = next;
        deal.contracts = contracts;
        deal.updated_at = now;
        self.tracker.put_deal(&deal).await
    }

    async fn resolve_inclusions(&self, aggregate: &Aggregate, now: DateTime<Utc>) -> Result<()> {
        let id = aggregate.piece.commitment.as_str();
        let buffer = self.buffer_store.get(aggregate.buffer.as_str()).await?;

        let mut resolved = Vec::new();
        for piece in &buffer.pieces {
            let key = inclusion_key(id, &piece.piece.commitment);
            let mut inclusion = match self.inclusion_store.get(&key).await {
                Ok(inclusion) => inclusion,
                Err(BundlioError::NotFound(_)) => continue,
                Err(error) => return Err(error),
            };
            if inclusion.stat != InclusionStatus::Pending {
                continue;
            }
            inclusion.stat = InclusionStatus::Success;
            inclusion.resolved_at = Some(now);
            resolved.push(inclusion);
        }

        if resolved.is_empty() {
            return Ok(());
        }
        self.inclusion_store.batch_write(&resolved).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticOracle, at, buffered};
    use crate::{
        MemoryStore, MemoryTrackerStore, PieceLink, Policy, Replica, ReplicaContract, Snapshot,
        encode_buffer,
    };

    const AGGREGATE: &str = "aggregate-commitment";

    struct Fixture {
        oracle: Arc<StaticOracle>,
        tracker: Arc<MemoryTrackerStore>,
        aggregates: Arc<MemoryStore<Aggregate>>,
        buffers: Arc<MemoryStore<Buffer>>,
        inclusions: Arc<MemoryStore<Inclusion>>,
    }

    impl Fixture {
        fn new(oracle: StaticOracle) -> Self {
            Self {
                oracle: Arc::new(oracle),
                tracker: Arc::new(MemoryTrackerStore::new()),
                aggregates: Arc::new(MemoryStore::new()),
                buffers: Arc::new(MemoryStore::new()),
                inclusions: Arc::new(MemoryStore::new()),
            }
        }

        fn operation(&self) -> ReconcileDealsOperation {
            ReconcileDealsOperation::new(
                self.oracle.clone(),
                self.tracker.clone(),
                self.aggregates.clone(),
                self.buffers.clone(),
                self.inclusions.clone(),
            )
        }

        /// An offered aggregate of two pieces with a signed deal.
        async fn seed_offered(&self) {
            let buffer = Buffer {
                pieces: vec![buffered(1, 8, Policy::Normal), buffered(2, 8, Policy::Normal)],
                storefront: "web3.storage".to_string(),
                group: "did:web:web3.storage".to_string(),
            };
            self.buffers.put(&buffer).await.unwrap();
            self.aggregates
                .put(&Aggregate {
                    piece: PieceLink::new(AGGREGATE, 64),
                    buffer: encode_buffer(&buffer).unwrap().cid,
                    invocation: None,
                    task: None,
                    inserted_at: at(2),
                    storefront: buffer.storefront.clone(),
                    group: buffer.group.clone(),
                    stat: AggregateStatus::Offered,
                })
                .await
                .unwrap();
            for piece in &buffer.pieces {
                self.inclusions
                    .put(&Inclusion {
                        aggregate: AGGREGATE.to_string(),
                        piece: piece.piece.commitment.clone(),
                        inserted_at: piece.inserted_at,
                        submitted_at: at(3),
                        resolved_at: None,
                        stat: InclusionStatus::Pending,
                        failed_reason: None,
                    })
                    .await
                    .unwrap();
            }
            let mut deal = Deal::pending(AGGREGATE, at(3));
            deal.status = DealStatus::Signed;
            self.tracker.put_deal(&deal).await.unwrap();
        }
    }

    fn replica(piece: &str, deals: &[(&str, u64)]) -> Replica {
        Replica {
            piece_commitment: piece.to_string(),
            log2_size: 35,
            contracts: deals
                .iter()
                .map(|(provider, deal_id)| ReplicaContract {
                    provider: provider.to_string(),
                    deal_id: *deal_id,
                    expiration_epoch: 4_500_000,
                })
                .collect(),
        }
    }

    fn tick() -> ReconcileDealsOperationRequest {
        ReconcileDealsOperationRequest { now: at(1000) }
    }

    #[tokio::test]
    async fn test_contracts_accumulate_without_duplicates() {
        let fixture = Fixture::new(StaticOracle::new(Snapshot {
            replicas: vec![replica("piece-a", &[("f01", 10)])],
        }));
        let operation = fixture.operation();

        assert_eq!(operation.run(tick()).await.unwrap().contracts_added, 1);
        // The same snapshot again adds nothing.
        assert_eq!(operation.run(tick()).await.unwrap().contracts_added, 0);

        fixture.oracle.set(Some(Snapshot {
            replicas: vec![replica("piece-a", &[("f01", 10), ("f02", 11)])],
        }));
        assert_eq!(operation.run(tick()).await.unwrap().contracts_added, 1);

        let contracts = operation.contracts("piece-a").await.unwrap();
        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts[1].provider, "f02");
        assert_eq!(contracts[1].source, "static");
        assert!(operation.contracts("piece-unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_writes_nothing() {
        let fixture = Fixture::new(StaticOracle::failing());
        fixture.seed_offered().await;

        let err = fixture.operation().run(tick()).await.unwrap_err();
        assert!(matches!(err, BundlioError::Reconciliation(_)));
        assert_eq!(
            fixture.tracker.get_deal(AGGREGATE).await.unwrap().unwrap().status,
            DealStatus::Signed
        );
    }

    #[tokio::test]
    async fn test_contracts_for_aggregate_approve_deal() {
        let fixture = Fixture::new(StaticOracle::new(Snapshot {
            replicas: vec![
                replica(AGGREGATE, &[("f01", 42)]),
                replica("unrelated", &[("f03", 7)]),
            ],
        }));
        fixture.seed_offered().await;

        let result = fixture.operation().run(tick()).await.unwrap();
        assert_eq!(result.replicas, 2);
        assert_eq!(result.approved, vec![AGGREGATE.to_string()]);

        let deal = fixture.tracker.get_deal(AGGREGATE).await.unwrap().unwrap();
        assert_eq!(deal.status, DealStatus::Approved);
        assert_eq!(deal.contracts.len(), 1);
        assert_eq!(deal.updated_at, at(1000));

        let piece = buffered(2, 8, Policy::Normal).piece.commitment;
        let inclusion = fixture
            .inclusions
            .get(&inclusion_key(AGGREGATE, &piece))
            .await
            .unwrap();
        assert_eq!(inclusion.stat, InclusionStatus::Success);
        assert_eq!(inclusion.resolved_at, Some(at(1000)));

        assert_eq!(
            fixture.aggregates.get(AGGREGATE).await.unwrap().stat,
            AggregateStatus::Accepted
        );

        // Approved deals are left alone on the next tick.
        let again = fixture.operation().run(tick()).await.unwrap();
        assert!(again.approved.is_empty());
    }

    #[tokio::test]
    async fn test_deal_without_contracts_stays_open() {
        let fixture = Fixture::new(StaticOracle::new(Snapshot {
            replicas: vec![replica("unrelated", &[("f03", 7)])],
        }));
        fixture.seed_offered().await;

        let result = fixture.operation().run(tick()).await.unwrap();
        assert!(result.approved.is_empty());
        assert_eq!(
            fixture.tracker.get_deal(AGGREGATE).await.unwrap().unwrap().status,
            DealStatus::Signed
        );
    }
}
