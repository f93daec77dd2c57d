use crate::config::Config;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use bundlio_core::{
    Aggregate, AggregateStatus, ApplyDecisionOperationRequest, Buffer, BufferMessage,
    BundlioError, CommitmentScheme, ContentId, ContentResolver, Deal, DealStore, Delivery,
    HttpMarketplace, HttpOracle, Inclusion, Marketplace, MerkleCommitment,
    OfferAggregateOperation, OfferAggregateOperationOutcome, OfferAggregateOperationRequest,
    OfferDecision, OracleSource, PartialBatchFailure, Piece, PieceReceipt, PieceSubmission,
    Queue, QueueMessage, ReconcileDealsOperation, ReconcileDealsOperationRequest,
    ReduceBuffersOperation, ReduceBuffersOperationOutcome, ReduceBuffersOperationRequest,
    RemoteSourceFetcher, Result, Store, SubmitPiecesOperation, SubmitPiecesOperationRequest,
    TrackerStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Shared server state
pub struct ServerState {
    pub config: Config,
    pub aggregate_store: Arc<dyn Store<Aggregate>>,
    pub buffer_queue: Arc<dyn Queue<BufferMessage>>,
    pub aggregate_queue: Arc<dyn Queue<Aggregate>>,
    pub tracker: Arc<dyn TrackerStore>,
    pub marketplace: Arc<dyn Marketplace>,
    pub submit: SubmitPiecesOperation,
    pub reduce: ReduceBuffersOperation,
    pub offer: OfferAggregateOperation,
    pub reconcile: ReconcileDealsOperation,
}

impl ServerState {
    /// Wires the configured backends to the HTTP marketplace and oracle.
    pub async fn from_config(config: Config) -> Result<Self> {
        let marketplace = Arc::new(HttpMarketplace::new(
            config.marketplace.endpoint.clone(),
            config.marketplace.issuer.clone(),
            config.marketplace.audience.clone(),
        ));
        let oracle = Arc::new(HttpOracle::new(config.oracle.url.clone()));
        Self::with_services(config, marketplace, oracle).await
    }

    pub async fn with_services(
        config: Config,
        marketplace: Arc<dyn Marketplace>,
        oracle: Arc<dyn OracleSource>,
    ) -> Result<Self> {
        let builder = config.storage.backend_builder();
        let limits = config.aggregation.limits()?;

        let piece_store = builder.build_store::<Piece>().await?;
        let receipt_store = builder.build_store::<PieceReceipt>().await?;
        let buffer_store = builder.build_store::<Buffer>().await?;
        let aggregate_store = builder.build_store::<Aggregate>().await?;
        let inclusion_store = builder.build_store::<Inclusion>().await?;
        let buffer_queue = builder.build_queue::<BufferMessage>("buffers").await?;
        let aggregate_queue = builder.build_queue::<Aggregate>("aggregates").await?;
        let tracker = builder.build_tracker_store()?;

        let scheme = MerkleCommitment::new();
        let entry_overhead = scheme.entry_overhead();
        let resolver = ContentResolver::new(Arc::new(RemoteSourceFetcher::default()));

        let submit = SubmitPiecesOperation::new(
            piece_store,
            receipt_store,
            buffer_store.clone(),
            buffer_queue.clone(),
            limits,
            entry_overhead,
        )
        .with_resolver(resolver);
        let reduce = ReduceBuffersOperation::new(
            buffer_store.clone(),
            aggregate_store.clone(),
            buffer_queue.clone(),
            aggregate_queue.clone(),
            Arc::new(scheme),
            limits,
        );
        let offer = OfferAggregateOperation::new(
            aggregate_store.clone(),
            buffer_store.clone(),
            inclusion_store.clone(),
            buffer_queue.clone(),
            tracker.clone(),
            marketplace.clone(),
        );
        let reconcile = ReconcileDealsOperation::new(
            oracle,
            tracker.clone(),
            aggregate_store.clone(),
            buffer_store,
            inclusion_store,
        );

        Ok(Self {
            config,
            aggregate_store,
            buffer_queue,
            aggregate_queue,
            tracker,
            marketplace,
            submit,
            reduce,
            offer,
            reconcile,
        })
    }
}

/// API response types
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> axum::response::Response {
        let resp = ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        };
        (StatusCode::OK, axum::Json(resp)).into_response()
    }
}

fn error_response(error: &BundlioError) -> axum::response::Response {
    let status = match error {
        BundlioError::NotFound(_) => StatusCode::NOT_FOUND,
        BundlioError::InvalidTransition { .. } => StatusCode::CONFLICT,
        BundlioError::InvalidRequest(_) | BundlioError::Parse(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.to_string()),
    };
    (status, axum::Json(resp)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SubmitPiecesBody {
    pub items: Vec<PieceSubmission>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPiecesResponse {
    pub buffers: Vec<ContentId>,
    pub accepted: usize,
    pub skipped: usize,
    #[serde(flatten)]
    pub failures: PartialBatchFailure,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub aggregate: Aggregate,
    pub deal: Option<Deal>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub aggregate: String,
    pub stat: AggregateStatus,
    pub changed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContractsQuery {
    /// `marketplace` asks the marketplace instead of the local tracker.
    pub source: Option<String>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/pieces", post(submit_pieces))
        .route("/aggregates/:id", get(get_aggregate))
        .route("/aggregates/:id/decision", post(decide_aggregate))
        .route("/contracts/:piece", get(get_contracts))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(ServerState::from_config(config).await?);

    let buffer_state = state.clone();
    tokio::spawn(async move {
        buffer_worker_loop(buffer_state).await;
    });

    let aggregate_state = state.clone();
    tokio::spawn(async move {
        aggregate_worker_loop(aggregate_state).await;
    });

    let reconcile_state = state.clone();
    tokio::spawn(async move {
        reconcile_loop(reconcile_state).await;
    });

    let app = router(state);

    tracing::info!("Server listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Runs one reconciliation tick and returns.
pub async fn run_reconcile_once(config: Config) -> Result<()> {
    let state = ServerState::from_config(config).await?;
    let result = state
        .reconcile
        .run(ReconcileDealsOperationRequest {
            now: chrono::Utc::now(),
        })
        .await?;

    tracing::info!(
        "Reconciliation finished: replicas={} contracts_added={} approved={:?}",
        result.replicas,
        result.contracts_added,
        result.approved
    );
    Ok(())
}

async fn buffer_worker_loop(state: Arc<ServerState>) {
    let mut interval = tokio::time::interval(state.config.workers.poll_interval());

    loop {
        interval.tick().await;

        // Keep draining while reductions make progress. An insufficient
        // buffer goes back on the queue and waits for the next tick.
        loop {
            match process_buffer_batch(&state).await {
                Ok(Some(ReduceBuffersOperationOutcome::Insufficient { .. })) | Ok(None) => break,
                Ok(Some(_)) => continue,
                Err(e) => {
                    tracing::warn!("Buffer worker failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Reduces one batch of queued buffers. Returns `None` when the queue is empty.
pub async fn process_buffer_batch(
    state: &ServerState,
) -> Result<Option<ReduceBuffersOperationOutcome>> {
    let deliveries = state
        .buffer_queue
        .take(state.config.workers.batch_size)
        .await?;
    if deliveries.is_empty() {
        return Ok(None);
    }

    let buffers = deliveries
        .iter()
        .map(|delivery| delivery.payload.buffer.clone())
        .collect();

    match state
        .reduce
        .run(ReduceBuffersOperationRequest { buffers })
        .await
    {
        Ok(outcome) => {
            if let Err(e) = state.buffer_queue.ack(&deliveries).await {
                tracing::warn!(
                    "Failed to ack {} reduced buffers, they will be redelivered: {}",
                    deliveries.len(),
                    e
                );
            }
            Ok(Some(outcome))
        }
        Err(e) => {
            tracing::warn!(
                "Reducing {} buffers failed, handing them back: {}",
                deliveries.len(),
                e
            );
            give_back(
                state.buffer_queue.as_ref(),
                deliveries,
                &e,
                state.config.storage.max_attempts,
            )
            .await?;
            Err(e)
        }
    }
}

async fn aggregate_worker_loop(state: Arc<ServerState>) {
    let mut interval = tokio::time::interval(state.config.workers.poll_interval());

    loop {
        interval.tick().await;

        loop {
            match process_aggregate_batch(&state).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Aggregate worker failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Offers one batch of queued aggregates. Each aggregate is handed back on its
/// own when its offer fails. Returns the number of deliveries taken, or the
/// last hand-back error once the whole batch has been worked through.
pub async fn process_aggregate_batch(state: &ServerState) -> Result<usize> {
    let deliveries = state
        .aggregate_queue
        .take(state.config.workers.batch_size)
        .await?;
    let taken = deliveries.len();
    let mut done = Vec::with_capacity(taken);
    let mut give_back_error = None;

    for delivery in deliveries {
        let id = delivery.payload.piece.commitment.clone();
        let request = OfferAggregateOperationRequest {
            aggregate: delivery.payload.clone(),
            submitted_at: chrono::Utc::now(),
        };

        match state.offer.run(request).await {
            Ok(OfferAggregateOperationOutcome::Decided(result)) => {
                tracing::info!(
                    "Aggregate {} offered: stat={:?} deal={:?}",
                    result.aggregate,
                    result.stat,
                    result.deal
                );
                done.push(delivery);
            }
            Ok(OfferAggregateOperationOutcome::AlreadyDecided { aggregate, stat }) => {
                tracing::debug!("Aggregate {} already decided: {:?}", aggregate, stat);
                done.push(delivery);
            }
            Err(e) => {
                tracing::warn!("Offering aggregate {} failed: {}", id, e);
                if let Err(nack_error) = give_back(
                    state.aggregate_queue.as_ref(),
                    vec![delivery],
                    &e,
                    state.config.storage.max_attempts,
                )
                .await
                {
                    tracing::error!(
                        "Failed to hand back aggregate {}, it waits for the visibility timeout: {}",
                        id,
                        nack_error
                    );
                    give_back_error = Some(nack_error);
                }
            }
        }
    }

    if !done.is_empty() {
        if let Err(e) = state.aggregate_queue.ack(&done).await {
            tracing::warn!(
                "Failed to ack {} offered aggregates, they will be redelivered: {}",
                done.len(),
                e
            );
        }
    }

    match give_back_error {
        Some(e) => Err(e),
        None => Ok(taken),
    }
}

/// Nacks failed deliveries. Fatal errors skip straight to the dead letters.
async fn give_back<T: QueueMessage>(
    queue: &dyn Queue<T>,
    mut deliveries: Vec<Delivery<T>>,
    error: &BundlioError,
    max_attempts: u32,
) -> Result<()> {
    if !error.is_retryable() {
        for delivery in deliveries.iter_mut() {
            delivery.attempts = delivery.attempts.max(max_attempts);
        }
    }

    let dead = queue.nack(deliveries).await?;
    if dead > 0 {
        tracing::error!("{} messages moved to dead letters: {}", dead, error);
    }
    Ok(())
}

async fn reconcile_loop(state: Arc<ServerState>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(state.config.oracle.interval_secs.max(1)));

    loop {
        interval.tick().await;

        let request = ReconcileDealsOperationRequest {
            now: chrono::Utc::now(),
        };
        if let Err(e) = state.reconcile.run(request).await {
            tracing::warn!("Reconciliation failed: {}", e);
        }
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "namespace": state.config.storage.namespace_or_default(),
        "backend": state.config.storage.backend.as_str(),
    });

    (StatusCode::OK, axum::Json(response))
}

async fn submit_pieces(
    State(state): State<Arc<ServerState>>,
    axum::Json(body): axum::Json<SubmitPiecesBody>,
) -> axum::response::Response {
    let request = SubmitPiecesOperationRequest { items: body.items };
    match state.submit.run(request).await {
        Ok(result) => ApiResponse::ok(SubmitPiecesResponse {
            buffers: result.buffers,
            accepted: result.accepted,
            skipped: result.skipped,
            failures: result.failures,
        }),
        Err(e) => error_response(&e),
    }
}

async fn get_aggregate(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let aggregate = match state.aggregate_store.get(&id).await {
        Ok(aggregate) => aggregate,
        Err(e) => return error_response(&e),
    };
    match state.tracker.get_deal(&id).await {
        Ok(deal) => ApiResponse::ok(AggregateResponse { aggregate, deal }),
        Err(e) => error_response(&e),
    }
}

async fn decide_aggregate(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    axum::Json(decision): axum::Json<OfferDecision>,
) -> axum::response::Response {
    let request = ApplyDecisionOperationRequest {
        aggregate: id,
        decision,
        resolved_at: chrono::Utc::now(),
    };

    match state.offer.apply_decision(request).await {
        Ok(OfferAggregateOperationOutcome::Decided(result)) => ApiResponse::ok(DecisionResponse {
            aggregate: result.aggregate,
            stat: result.stat,
            changed: true,
        }),
        Ok(OfferAggregateOperationOutcome::AlreadyDecided { aggregate, stat }) => {
            ApiResponse::ok(DecisionResponse {
                aggregate,
                stat,
                changed: false,
            })
        }
        Err(e) => error_response(&e),
    }
}

async fn get_contracts(
    State(state): State<Arc<ServerState>>,
    Path(piece): Path<String>,
    Query(query): Query<ContractsQuery>,
) -> axum::response::Response {
    let contracts = match query.source.as_deref() {
        Some("marketplace") => state.marketplace.query(&piece).await,
        None | Some("tracker") => state.reconcile.contracts(&piece).await,
        Some(other) => Err(BundlioError::InvalidRequest(format!(
            "unknown contract source: {}",
            other
        ))),
    };

    match contracts {
        Ok(contracts) => ApiResponse::ok(contracts),
        Err(e) => error_response(&e),
    }
}
