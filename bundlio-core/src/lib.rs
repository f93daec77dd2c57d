//! Bundlio Core - piece aggregation and deal tracking
//!
//! Small content pieces are buffered per storefront/group, packed into
//! size-bounded aggregates, offered to a storage marketplace and tracked until
//! an oracle reports real-world contracts for them:
//! - content-addressed DAG-CBOR records keyed by SHA-256
//! - greedy bin-packing with a utilization floor
//! - grouped at-least-once queues with dead-lettering
//! - SQLite for deal tracking

pub mod batch;
pub mod builder;
pub mod codec;
pub mod commitment;
pub mod error;
pub mod marketplace;
pub mod model;
pub mod operations;
pub mod oracle;
pub mod resolver;
pub mod state;
pub mod storage;

#[cfg(test)]
mod testing;

pub use batch::{BatchItemFailure, PartialBatchFailure};
pub use builder::{AggregateBuild, AggregateInfo, AggregateLimits, build_aggregate, sort_pieces};
pub use codec::{
    Block, Record, StoreRecord, buffer_key, compute_hash, decode_buffer, encode, encode_buffer,
    inclusion_key, receipt_key, verify_hash,
};
pub use commitment::{CommitmentScheme, INDEX_ENTRY_SIZE, MerkleCommitment, compute_merkle_root};
pub use error::{BundlioError, Result};
pub use marketplace::{HttpMarketplace, Marketplace, OfferDecision};
pub use model::{
    Aggregate, Buffer, BufferMessage, BufferedPiece, ContentId, Contract, Deal, Inclusion, Piece,
    PieceLink, PieceReceipt, Policy, group_key,
};
pub use operations::{
    ApplyDecisionOperationRequest, OfferAggregateOperation, OfferAggregateOperationOutcome,
    OfferAggregateOperationRequest, OfferAggregateOperationResult, PieceSubmission,
    ReconcileDealsOperation, ReconcileDealsOperationRequest, ReconcileDealsOperationResult,
    ReduceBuffersOperation, ReduceBuffersOperationOutcome, ReduceBuffersOperationRequest,
    ReduceBuffersOperationResult, SubmitPiecesOperation, SubmitPiecesOperationRequest,
    SubmitPiecesOperationResult,
};
pub use oracle::{
    HttpOracle, OracleSource, Replica, ReplicaContract, Snapshot, decode_snapshot,
};
pub use resolver::{
    ContentResolver, ContentSource, RemoteSourceFetcher, ResolveItem, SourceFetcher,
    SourceProvider, parse_source_url,
};
pub use state::{AggregateStatus, DealStatus, InclusionStatus};
pub use storage::{
    BackendBuilder, ContractStore, DEFAULT_MAX_ATTEMPTS, DEFAULT_VISIBILITY_TIMEOUT, DealStore,
    Delivery, MemoryQueue,
    MemoryStore, MemoryTrackerStore, Queue, QueueMessage, QueueOptions, RedisQueue, RedisStore,
    SqliteTrackerStore, Store, TrackerStore,
};
