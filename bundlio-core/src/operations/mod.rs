pub mod offer_aggregate;
pub mod reconcile_deals;
pub mod reduce_buffers;
pub mod submit_pieces;

pub use offer_aggregate::{
    ApplyDecisionOperationRequest, OfferAggregateOperation, OfferAggregateOperationOutcome,
    OfferAggregateOperationRequest, OfferAggregateOperationResult,
};
pub use reconcile_deals::{
    ReconcileDealsOperation, ReconcileDealsOperationRequest, ReconcileDealsOperationResult,
};
pub use reduce_buffers::{
    ReduceBuffersOperation, ReduceBuffersOperationOutcome, ReduceBuffersOperationRequest,
    ReduceBuffersOperationResult,
};
pub use submit_pieces::{
    PieceSubmission, SubmitPiecesOperation, SubmitPiecesOperationRequest,
    SubmitPiecesOperationResult,
};
