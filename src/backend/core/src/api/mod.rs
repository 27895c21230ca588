//! HTTP API for Intake Core.
//!
//! Every handler returns `Result<impl IntoResponse, IntakeError>`; failures
//! are converted to the uniform error envelope by the `IntoResponse`
//! implementation on [`IntakeError`]. Successful responses wrap their data
//! in [`SubmissionEnvelope`] so callers always receive the current state
//! and resume token alongside the operation result.

mod handlers;

use axum::{
    extract::{MatchedPath, Request},
    middleware::{self as axum_middleware, Next},
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::delivery::DeliveryManager;
use crate::engine::SubmissionEngine;
use crate::error::IntakeError;
use crate::model::{Submission, SubmissionState};
use crate::observability;
use crate::store::SubmissionStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SubmissionEngine>,
    pub delivery: Arc<DeliveryManager>,
    pub store: Arc<dyn SubmissionStore>,
    pub metrics: PrometheusHandle,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route(
            "/intakes/:intake_id/submissions",
            post(handlers::create_submission),
        )
        .route("/submissions/:id", get(handlers::get_submission))
        .route("/submissions/:id", delete(handlers::cancel_submission))
        .route("/submissions/:id/fields", patch(handlers::set_fields))
        .route("/submissions/:id/validate", post(handlers::validate))
        .route("/submissions/:id/uploads", post(handlers::request_upload))
        .route(
            "/submissions/:id/uploads/confirm",
            post(handlers::confirm_upload),
        )
        .route("/submissions/:id/submit", post(handlers::submit))
        .route("/submissions/:id/approve", post(handlers::approve))
        .route("/submissions/:id/reject", post(handlers::reject))
        .route(
            "/submissions/:id/request-changes",
            post(handlers::request_changes),
        )
        .route("/submissions/:id/handoff", post(handlers::handoff))
        .route("/submissions/:id/events", get(handlers::list_events))
        .route(
            "/submissions/:id/events/export",
            get(handlers::export_events),
        )
        .route(
            "/submissions/:id/deliveries",
            get(handlers::list_deliveries),
        )
        .route("/deliveries/:id", get(handlers::get_delivery))
        .route("/deliveries/:id/retry", post(handlers::retry_delivery))
        .layer(axum_middleware::from_fn(request_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Record request durations per method and matched route.
async fn request_metrics(request: Request, next: Next) -> impl IntoResponse {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let start = Instant::now();
    let response = next.run(request).await;
    observability::metrics::record_http_request(&method, &path, start.elapsed().as_secs_f64());
    response
}

/// The uniform success envelope: operation data plus the submission's
/// current state and resume token, so every response lets the caller
/// resynchronize.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionEnvelope {
    /// Always true for successes.
    pub ok: bool,
    pub submission_id: uuid::Uuid,
    pub state: SubmissionState,
    pub resume_token: String,
    pub data: serde_json::Value,
}

impl SubmissionEnvelope {
    /// Envelope a submission snapshot, with the snapshot itself as data.
    pub fn from_submission(submission: &Submission) -> Result<Self, IntakeError> {
        let data = serde_json::to_value(submission)?;
        Ok(Self::with_data(submission, data))
    }

    /// Envelope a submission with custom data.
    pub fn with_data(submission: &Submission, data: serde_json::Value) -> Self {
        Self {
            ok: true,
            submission_id: submission.id.0,
            state: submission.state,
            resume_token: submission.resume_token.clone(),
            data,
        }
    }
}
