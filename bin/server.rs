// Ledger ETL - Web Server
// REST API over the batch orchestrator, KPI projection and ledger listing

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use ledger_etl::{
    init_tracing, BatchOrchestrator, Classifier, KpiFilter, KpiRow, KpiView, LedgerDb,
    LedgerQuery, PipelineConfig, PipelineError, Reclassifier, SourceKind, SourceRow,
    TaxonomyHandle, TransactionFilter,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: BatchOrchestrator,
    kpi: KpiView,
    ledger: LedgerQuery,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Library errors mapped onto HTTP status codes
struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::BatchNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::NotRetryable { .. }
            | PipelineError::AlreadyRetried { .. }
            | PipelineError::NothingToRetry(_)
            | PipelineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

/// Run blocking store work off the async executor. The blocking pool runs
/// inside the runtime, so batch workers can still be spawned from here.
async fn blocking<T, F>(f: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce() -> ledger_etl::PipelineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(PipelineError::WorkerPanicked(e.to_string())))?
        .map_err(ApiError)
}

// ============================================================================
// API Handlers
// ============================================================================

#[derive(Deserialize)]
struct SubmitBatchRequest {
    source_kind: SourceKind,
    rows: Vec<SourceRow>,
}

#[derive(Serialize)]
struct SubmitBatchResponse {
    batch_id: String,
}

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/batches - Accept rows; processing continues in the background
async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<SubmitBatchRequest>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let orchestrator = state.orchestrator.clone();
    let handle =
        blocking(move || orchestrator.start(request.source_kind, request.rows)).await?;
    let response = SubmitBatchResponse {
        batch_id: handle.batch_id.clone(),
    };

    // Poll GET /api/batches/:id for the outcome
    tokio::spawn(async move {
        if let Err(e) = handle.wait().await {
            tracing::error!(error = %e, "batch worker returned an error");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(ApiResponse::ok(response))))
}

/// GET /api/batches - All batches, newest first
async fn list_batches(State(state): State<AppState>) -> ApiResult<Vec<ledger_etl::BatchSnapshot>> {
    let orchestrator = state.orchestrator.clone();
    let batches = blocking(move || orchestrator.list_batches()).await?;
    Ok(Json(ApiResponse::ok(batches)))
}

/// GET /api/batches/:id - Status, counts and error summary
async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<ledger_etl::BatchSnapshot> {
    let orchestrator = state.orchestrator.clone();
    let snapshot = blocking(move || orchestrator.status(&batch_id)).await?;
    Ok(Json(ApiResponse::ok(snapshot)))
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

/// POST /api/batches/:id/cancel
async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<CancelResponse> {
    let orchestrator = state.orchestrator.clone();
    let cancelled = blocking(move || orchestrator.cancel(&batch_id)).await?;
    Ok(Json(ApiResponse::ok(CancelResponse { cancelled })))
}

/// POST /api/batches/:id/retry - Re-run a failed batch's unprocessed rows
async fn retry_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let orchestrator = state.orchestrator.clone();
    let handle = blocking(move || orchestrator.retry(&batch_id)).await?;
    let response = SubmitBatchResponse {
        batch_id: handle.batch_id.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = handle.wait().await {
            tracing::error!(error = %e, "retry worker returned an error");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::ok(response))))
}

#[derive(Deserialize)]
struct KpiQuery {
    from: Option<chrono::NaiveDate>,
    to: Option<chrono::NaiveDate>,
    category: Option<String>,
    limit: Option<usize>,
}

/// GET /api/kpi - KPI-eligible rows for a period
async fn get_kpi(State(state): State<AppState>, Query(query): Query<KpiQuery>) -> ApiResult<Vec<KpiRow>> {
    let view = state.kpi.clone();
    let limit = query.limit.unwrap_or(1000);
    let filter = KpiFilter {
        from: query.from,
        to: query.to,
        category: query.category,
    };
    let rows = blocking(move || {
        view.for_kpi(filter)
            .take(limit)
            .collect::<ledger_etl::PipelineResult<Vec<_>>>()
    })
    .await?;
    Ok(Json(ApiResponse::ok(rows)))
}

/// GET /api/kpi/summary - Spend/income per currency
async fn get_kpi_summary(
    State(state): State<AppState>,
    Query(filter): Query<KpiFilter>,
) -> ApiResult<Vec<ledger_etl::KpiSummary>> {
    let view = state.kpi.clone();
    let summary = blocking(move || view.summary(filter)).await?;
    Ok(Json(ApiResponse::ok(summary)))
}

/// GET /api/transactions - Search/filter/sort the full ledger
async fn get_transactions(
    State(state): State<AppState>,
    Query(filter): Query<TransactionFilter>,
) -> ApiResult<ledger_etl::TransactionPage> {
    let ledger = state.ledger.clone();
    let page = blocking(move || ledger.list(&filter)).await?;
    Ok(Json(ApiResponse::ok(page)))
}

/// POST /api/reclassify - Re-derive enrichment with the current taxonomy
async fn reclassify(State(state): State<AppState>) -> ApiResult<ledger_etl::ReclassifyReport> {
    let db = state.orchestrator.db().clone();
    let classifier = state.orchestrator.taxonomy().snapshot()?;
    let report = blocking(move || Reclassifier::new(db, classifier).run()).await?;
    Ok(Json(ApiResponse::ok(report)))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ledger.yaml".to_string());
    let config = PipelineConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path))?;
    init_tracing(&config.logging.level);

    let db = LedgerDb::open(&config.database)
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))?;
    tracing::info!(path = %config.database.path.display(), "database opened");

    let classifier =
        Classifier::from_config(&config.taxonomy).context("Failed to load taxonomy/rules")?;
    let taxonomy = Arc::new(TaxonomyHandle::new(classifier));

    // Create shared state
    let state = AppState {
        orchestrator: BatchOrchestrator::new(db.clone(), taxonomy, &config),
        kpi: KpiView::new(db.clone(), config.kpi.page_size),
        ledger: LedgerQuery::new(db),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/batches", post(submit_batch).get(list_batches))
        .route("/batches/:id", get(get_batch))
        .route("/batches/:id/cancel", post(cancel_batch))
        .route("/batches/:id/retry", post(retry_batch))
        .route("/kpi", get(get_kpi))
        .route("/kpi/summary", get(get_kpi_summary))
        .route("/transactions", get(get_transactions))
        .route("/reclassify", post(reclassify))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!(%addr, "server listening");
    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
