//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, IntakeError>` so that
//! errors are automatically converted to the uniform error envelope via the
//! `IntoResponse` implementation on `IntakeError`.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::{AppState, SubmissionEnvelope};
use crate::engine::{FieldComment, ReviewDecision, SubmitOutcome, SubmitRecord};
use crate::error::{IntakeError, Result};
use crate::events::{export_ndjson, EventFilter, EventQuery};
use crate::model::{Actor, ActorKind, DeliveryId, EventType, FieldMap, SubmissionId};
use crate::validation::UploadMeta;

// ═══════════════════════════════════════════════════════════════════════════════
// Health and Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Submission Lifecycle Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubmissionRequest {
    pub actor: Actor,
    pub idempotency_key: Option<String>,
    pub fields: Option<FieldMap>,
}

pub async fn create_submission(
    State(state): State<AppState>,
    Path(intake_id): Path<String>,
    Json(req): Json<CreateSubmissionRequest>,
) -> Result<impl IntoResponse> {
    let result = state
        .engine
        .create(&intake_id, req.actor, req.idempotency_key, req.fields)
        .await?;

    let status = if result.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(SubmissionEnvelope::from_submission(&result.submission)?),
    ))
}

pub async fn get_submission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let submission = state.engine.get(SubmissionId(id)).await?;
    Ok(Json(SubmissionEnvelope::from_submission(&submission)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetFieldsRequest {
    pub resume_token: String,
    pub actor: Actor,
    pub fields: FieldMap,
}

pub async fn set_fields(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SetFieldsRequest>,
) -> Result<impl IntoResponse> {
    let submission = state
        .engine
        .set_fields(SubmissionId(id), &req.resume_token, req.actor, req.fields)
        .await?;
    Ok(Json(SubmissionEnvelope::from_submission(&submission)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorTokenRequest {
    pub resume_token: String,
    pub actor: Actor,
}

pub async fn validate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ActorTokenRequest>,
) -> Result<impl IntoResponse> {
    let (submission, report) = state
        .engine
        .validate(SubmissionId(id), &req.resume_token, req.actor)
        .await?;
    let data = json!({
        "submission": submission,
        "report": report,
    });
    Ok(Json(SubmissionEnvelope::with_data(&submission, data)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestUploadRequest {
    pub resume_token: String,
    pub actor: Actor,
    pub field: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

pub async fn request_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RequestUploadRequest>,
) -> Result<impl IntoResponse> {
    let meta = UploadMeta {
        file_name: req.file_name,
        content_type: req.content_type,
        size_bytes: req.size_bytes,
    };
    let (submission, signed_url) = state
        .engine
        .request_upload(SubmissionId(id), &req.resume_token, req.actor, &req.field, meta)
        .await?;
    let data = json!({
        "field": req.field,
        "uploadUrl": signed_url,
    });
    Ok(Json(SubmissionEnvelope::with_data(&submission, data)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmUploadRequest {
    pub resume_token: String,
    pub actor: Actor,
    pub field: String,
}

pub async fn confirm_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ConfirmUploadRequest>,
) -> Result<impl IntoResponse> {
    let submission = state
        .engine
        .confirm_upload(SubmissionId(id), &req.resume_token, req.actor, &req.field)
        .await?;
    Ok(Json(SubmissionEnvelope::from_submission(&submission)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub resume_token: String,
    pub actor: Actor,
    pub idempotency_key: String,
}

/// Submit for review or delivery.
///
/// The raw request body (not the parsed DTO) feeds the idempotency ledger's
/// payload hash, so replays compare exactly what the caller sent. Replays
/// must answer byte-identically, so replay status never appears in the
/// body; a cached rejection keeps its original status code.
pub async fn submit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(raw): Json<serde_json::Value>,
) -> Result<Response> {
    let req: SubmitRequest = serde_json::from_value(raw.clone())
        .map_err(|e| IntakeError::invalid_request(format!("malformed submit request: {}", e)))?;

    let outcome = state
        .engine
        .submit(
            SubmissionId(id),
            &req.resume_token,
            req.actor,
            &req.idempotency_key,
            &raw,
        )
        .await?;

    let record = match outcome {
        SubmitOutcome::Applied(record) => record,
        SubmitOutcome::Replayed(record) => {
            debug!(submission_id = %id, "submit answered from the idempotency ledger");
            record
        }
    };

    match record {
        SubmitRecord::Accepted {
            submission,
            review_required,
        } => {
            // Accepted submissions without gates head straight to asynchronous
            // delivery, so they answer 202; gated ones answer 200.
            let status = if review_required {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            let data = json!({
                "submission": submission,
                "reviewRequired": review_required,
            });
            Ok((status, Json(SubmissionEnvelope::with_data(&submission, data))).into_response())
        }
        SubmitRecord::Rejected { status, envelope } => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::UNPROCESSABLE_ENTITY);
            Ok((status, Json(envelope)).into_response())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Review Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub resume_token: String,
    pub actor: Actor,
    #[serde(default)]
    pub reasons: Vec<String>,
}

pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReviewRequest>,
) -> Result<impl IntoResponse> {
    let submission = state
        .engine
        .review(
            SubmissionId(id),
            &req.resume_token,
            req.actor,
            ReviewDecision::Approved,
            req.reasons,
        )
        .await?;
    Ok(Json(SubmissionEnvelope::from_submission(&submission)?))
}

pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReviewRequest>,
) -> Result<impl IntoResponse> {
    let submission = state
        .engine
        .review(
            SubmissionId(id),
            &req.resume_token,
            req.actor,
            ReviewDecision::Rejected,
            req.reasons,
        )
        .await?;
    Ok(Json(SubmissionEnvelope::from_submission(&submission)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestChangesRequest {
    pub resume_token: String,
    pub actor: Actor,
    #[serde(default)]
    pub comments: Vec<FieldComment>,
}

pub async fn request_changes(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RequestChangesRequest>,
) -> Result<impl IntoResponse> {
    let submission = state
        .engine
        .request_changes(SubmissionId(id), &req.resume_token, req.actor, req.comments)
        .await?;
    Ok(Json(SubmissionEnvelope::from_submission(&submission)?))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cancel and Handoff
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub resume_token: String,
    pub actor: Actor,
    pub reason: Option<String>,
}

pub async fn cancel_submission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> Result<impl IntoResponse> {
    let submission = state
        .engine
        .cancel(SubmissionId(id), &req.resume_token, req.actor, req.reason)
        .await?;
    Ok(Json(SubmissionEnvelope::from_submission(&submission)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRequest {
    pub resume_token: String,
    pub actor: Actor,
    pub to: Actor,
}

pub async fn handoff(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<HandoffRequest>,
) -> Result<impl IntoResponse> {
    let submission = state
        .engine
        .handoff(SubmissionId(id), &req.resume_token, req.actor, req.to)
        .await?;
    Ok(Json(SubmissionEnvelope::from_submission(&submission)?))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Log Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    /// Comma-separated event kinds, e.g. `field.updated,review.approved`.
    pub types: Option<String>,
    pub actor_kind: Option<ActorKind>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

fn parse_event_types(raw: &str) -> Result<Vec<EventType>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            EventType::parse(s)
                .ok_or_else(|| IntakeError::invalid_request(format!("unknown event type: {}", s)))
        })
        .collect()
}

pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse> {
    let filter = EventFilter {
        event_types: query.types.as_deref().map(parse_event_types).transpose()?,
        actor_kind: query.actor_kind,
        from: query.from,
        to: query.to,
    };
    let window = EventQuery::new(
        query.offset.unwrap_or(0),
        query.limit.unwrap_or(crate::events::DEFAULT_PAGE_SIZE),
    );

    let id = SubmissionId(id);
    let submission = state.engine.get(id).await?;
    let page = state.engine.events(id, &filter, window).await?;
    Ok(Json(SubmissionEnvelope::with_data(
        &submission,
        serde_json::to_value(page)?,
    )))
}

#[derive(Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

pub async fn export_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<Response> {
    let events = state.engine.export_events(SubmissionId(id)).await?;

    match query.format.as_deref().unwrap_or("json") {
        "json" => Ok(Json(events).into_response()),
        "ndjson" => {
            let body = export_ndjson(&events)?;
            Ok((
                [(header::CONTENT_TYPE, "application/x-ndjson")],
                body,
            )
                .into_response())
        }
        other => Err(IntakeError::invalid_request(format!(
            "unsupported export format: {}",
            other
        ))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Delivery Handlers
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let id = SubmissionId(id);
    let submission = state.engine.get(id).await?;
    let deliveries = state.store.deliveries_for(id).await?;
    Ok(Json(SubmissionEnvelope::with_data(
        &submission,
        serde_json::to_value(deliveries)?,
    )))
}

pub async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let record = state
        .store
        .get_delivery(DeliveryId(id))
        .await?
        .ok_or_else(|| IntakeError::not_found("delivery", id))?;
    Ok(Json(record))
}

pub async fn retry_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let record = state.delivery.manual_retry(DeliveryId(id)).await?;
    Ok(Json(record))
}
