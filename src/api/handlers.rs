use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::codec::{self, FiscalNumber};
use crate::contracts::{AllocationError, DriftReport, EntityId, SequenceAllocator, SequenceInfo};
use crate::sequencer::Sequencer;

/// Application state shared across handlers.
pub struct AppState<A: SequenceAllocator> {
    pub sequencer: Sequencer<A>,
    pub started_at: Instant,
}

impl<A: SequenceAllocator> AppState<A> {
    pub fn new(sequencer: Sequencer<A>) -> Self {
        Self {
            sequencer,
            started_at: Instant::now(),
        }
    }
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API error type.
pub enum ApiError {
    Allocation(AllocationError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Allocation(e) => match e {
                AllocationError::InvalidCategory { .. } | AllocationError::MalformedNumber(_) => {
                    StatusCode::BAD_REQUEST
                }
                AllocationError::LockTimeout { .. } | AllocationError::ConflictExhausted { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                AllocationError::CollisionDetected { .. } => StatusCode::CONFLICT,
                AllocationError::SequenceExhausted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                AllocationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let ApiError::Allocation(e) = self;
        let error_response = ErrorResponse {
            error: e.to_string(),
            code: e.kind().to_ascii_uppercase(),
        };
        let mut response = (status, Json(error_response)).into_response();
        if e.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<AllocationError> for ApiError {
    fn from(e: AllocationError) -> Self {
        ApiError::Allocation(e)
    }
}

/// Request body for reservations.
#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    /// Free-text document category, or a literal prefix.
    #[serde(default)]
    pub category: String,
    /// Explicit prefix; wins over `category` when at least 3 characters.
    pub prefix: Option<String>,
}

/// A fiscal number with its parts.
#[derive(Debug, Serialize, Deserialize)]
pub struct NumberResponse {
    pub entity_id: EntityId,
    pub fiscal_number: String,
    pub prefix: String,
    pub sequence: u64,
}

impl NumberResponse {
    fn new(entity_id: EntityId, number: FiscalNumber) -> Self {
        Self {
            entity_id,
            fiscal_number: number.to_string(),
            prefix: number.prefix().to_string(),
            sequence: number.sequence(),
        }
    }
}

/// POST /entities/{entity}/reservations
/// Reserves the next fiscal number.
pub async fn reserve<A: SequenceAllocator>(
    State(state): State<Arc<AppState<A>>>,
    Path(entity_id): Path<EntityId>,
    Json(request): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<NumberResponse>), ApiError> {
    let number = match request.prefix.as_deref() {
        Some(prefix) => {
            state
                .sequencer
                .reserve_with(entity_id, &request.category, Some(prefix))
                .await?
        }
        None => state.sequencer.reserve(entity_id, &request.category).await?,
    };
    Ok((StatusCode::CREATED, Json(NumberResponse::new(entity_id, number))))
}

/// GET /entities/{entity}/sequences/{prefix}
pub async fn sequence_info<A: SequenceAllocator>(
    State(state): State<Arc<AppState<A>>>,
    Path((entity_id, prefix)): Path<(EntityId, String)>,
) -> Result<Json<SequenceInfo>, ApiError> {
    Ok(Json(state.sequencer.sequence_info(entity_id, &prefix).await?))
}

/// GET /entities/{entity}/sequences/{prefix}/preview
/// What the next reservation would return. Writes nothing.
pub async fn preview_next<A: SequenceAllocator>(
    State(state): State<Arc<AppState<A>>>,
    Path((entity_id, prefix)): Path<(EntityId, String)>,
) -> Result<Json<NumberResponse>, ApiError> {
    let number = state.sequencer.preview_next(entity_id, &prefix).await?;
    Ok(Json(NumberResponse::new(entity_id, number)))
}

/// Request body for sequence overrides.
#[derive(Debug, Deserialize)]
pub struct SetSequenceRequest {
    pub last_sequence: u64,
    pub reason: Option<String>,
}

/// PUT /entities/{entity}/sequences/{prefix}
/// Administrative override; responds with the resulting counter.
pub async fn set_sequence<A: SequenceAllocator>(
    State(state): State<Arc<AppState<A>>>,
    Path((entity_id, prefix)): Path<(EntityId, String)>,
    Json(request): Json<SetSequenceRequest>,
) -> Result<Json<SequenceInfo>, ApiError> {
    state
        .sequencer
        .set_sequence(entity_id, &prefix, request.last_sequence, request.reason)
        .await?;
    Ok(Json(state.sequencer.sequence_info(entity_id, &prefix).await?))
}

/// Response for reconcile endpoint.
#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    #[serde(flatten)]
    pub report: DriftReport,
    pub drifted: bool,
}

/// POST /entities/{entity}/sequences/{prefix}/reconcile
/// Audits the counter against document history, raising it if behind.
pub async fn reconcile<A: SequenceAllocator>(
    State(state): State<Arc<AppState<A>>>,
    Path((entity_id, prefix)): Path<(EntityId, String)>,
) -> Result<Json<ReconcileResponse>, ApiError> {
    let report = state.sequencer.reconcile(entity_id, &prefix).await?;
    Ok(Json(ReconcileResponse {
        drifted: report.drifted(),
        report,
    }))
}

/// Response for fiscal number validation.
#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub number: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub electronic: Option<bool>,
}

/// GET /fiscal-numbers/{number}
/// Validates and parses a fiscal number.
pub async fn validate_number(Path(number): Path<String>) -> impl IntoResponse {
    let parsed = codec::parse(&number).ok();
    Json(ValidateResponse {
        valid: parsed.is_some(),
        prefix: parsed.map(|(p, _)| p.to_string()),
        sequence: parsed.map(|(_, s)| s),
        electronic: parsed.map(|(p, _)| p.is_electronic()),
        number,
    })
}

/// GET /health
/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy"
    }))
}

/// GET /metrics
/// Returns metrics in Prometheus text exposition format.
pub async fn metrics<A: SequenceAllocator>(State(state): State<Arc<AppState<A>>>) -> impl IntoResponse {
    let mut body = state.sequencer.metrics().format_prometheus();
    body.push_str("# HELP fiscseq_uptime_seconds Server uptime in seconds\n");
    body.push_str("# TYPE fiscseq_uptime_seconds gauge\n");
    body.push_str(&format!(
        "fiscseq_uptime_seconds {:.3}\n",
        state.started_at.elapsed().as_secs_f64()
    ));
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
