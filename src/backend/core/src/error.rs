//! Error handling for Intake Core.
//!
//! This module provides:
//! - A closed set of error types shared by every operation
//! - The uniform error envelope returned over HTTP
//! - Retryability classification per error type
//! - HTTP status code mapping
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! Expected failures (validation, stale token, idempotency conflict, wrong
//! state) are values of [`IntakeError`], never panics. Only genuinely
//! unexpected faults surface as `internal_error`/`storage_error`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::model::SubmissionState;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for intake operations.
pub type Result<T> = std::result::Result<T, IntakeError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error types for API responses.
///
/// This enumeration is closed: new kinds must not be introduced informally.
/// The first group drives the submission lifecycle; the second group covers
/// transport-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Lifecycle errors
    Missing,
    Invalid,
    Conflict,
    NeedsApproval,
    UploadPending,
    DeliveryFailed,
    Expired,
    Cancelled,
    InvalidState,

    // Transport errors
    NotFound,
    Forbidden,
    InvalidRequest,
    InvalidResumeToken,
    InternalError,
    StorageError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::Missing | Self::Invalid | Self::UploadPending | Self::InvalidRequest => {
                StatusCode::BAD_REQUEST
            }

            // Conflict-class: stale token, idempotency conflict, wrong state
            Self::Conflict
            | Self::InvalidResumeToken
            | Self::InvalidState
            | Self::NeedsApproval
            | Self::Cancelled => StatusCode::CONFLICT,

            Self::Expired => StatusCode::GONE,

            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,

            Self::DeliveryFailed => StatusCode::BAD_GATEWAY,

            Self::StorageError => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    ///
    /// `missing`/`invalid`/`upload_pending` are retryable once the caller
    /// fixes its input; a stale resume token is retryable after re-fetching
    /// the submission. `conflict`/`expired`/`cancelled` are never retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Missing
                | Self::Invalid
                | Self::UploadPending
                | Self::InvalidResumeToken
                | Self::DeliveryFailed
                | Self::InternalError
                | Self::StorageError
        )
    }

    /// Default retry hint in milliseconds, where one applies.
    pub const fn default_retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::StorageError => Some(1_000),
            Self::InternalError => Some(5_000),
            _ => None,
        }
    }

    /// Get the error category for grouping in metrics.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Missing | Self::Invalid | Self::UploadPending | Self::InvalidRequest => {
                "validation"
            }
            Self::Conflict | Self::InvalidResumeToken | Self::InvalidState => "concurrency",
            Self::NeedsApproval => "review",
            Self::Expired | Self::Cancelled => "terminal",
            Self::DeliveryFailed => "delivery",
            Self::NotFound => "not_found",
            Self::Forbidden => "auth",
            Self::InternalError | Self::StorageError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
            Self::Conflict => "conflict",
            Self::NeedsApproval => "needs_approval",
            Self::UploadPending => "upload_pending",
            Self::DeliveryFailed => "delivery_failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::InvalidState => "invalid_state",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidResumeToken => "invalid_resume_token",
            Self::InternalError => "internal_error",
            Self::StorageError => "storage_error",
        };
        f.write_str(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Structured Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// A single field-level problem reported by validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldIssue {
    /// Field path, e.g. `companyName` or `contacts[0].email`.
    pub path: String,
    /// Machine-readable issue code, e.g. `required`, `type_mismatch`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// What the schema expected, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// What was received, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
}

impl FieldIssue {
    pub fn new(
        path: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            code: code.into(),
            message: message.into(),
            expected: None,
            received: None,
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_received(mut self, received: impl Into<String>) -> Self {
        self.received = Some(received.into());
        self
    }
}

/// A suggested next action the caller can take to make progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextAction {
    /// Action verb, e.g. `set_fields`, `refetch`, `upload`.
    pub action: String,
    /// Field the action applies to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Hint for the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl NextAction {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            field: None,
            hint: None,
        }
    }

    pub fn for_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Submission context attached to errors so every response carries the
/// current resume token and state, letting callers resynchronize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSubmissionContext {
    pub submission_id: uuid::Uuid,
    pub state: SubmissionState,
    pub resume_token: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Intake Core.
///
/// Carries the closed error type, a client-safe message, optional field
/// issues and next actions, and the submission context (id, state, current
/// resume token) when the failing operation had resolved a submission.
#[derive(Error, Debug)]
pub struct IntakeError {
    code: ErrorCode,
    message: Cow<'static, str>,
    internal_message: Option<String>,
    fields: Vec<FieldIssue>,
    next_actions: Vec<NextAction>,
    retry_after_ms: Option<u64>,
    context: Option<ErrorSubmissionContext>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for IntakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl IntakeError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and client-safe message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let err = Self {
            code,
            message: message.into(),
            internal_message: None,
            fields: Vec::new(),
            next_actions: Vec::new(),
            retry_after_ms: code.default_retry_after_ms(),
            context: None,
            source: None,
        };
        err.record_metrics();
        err
    }

    /// Create an internal error (500) with a logged-only detail message.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, "An internal error occurred")
            .with_internal_message(detail)
    }

    /// Create a storage error (503) with a logged-only detail message.
    pub fn storage(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageError, "Storage backend unavailable")
            .with_internal_message(detail)
    }

    /// Create a not found error.
    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("{} not found: {}", entity, id))
    }

    /// Create an invalid request error (malformed input at the transport edge).
    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Create a forbidden error (reviewer authorization denied).
    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// Create a stale resume token error.
    pub fn invalid_resume_token() -> Self {
        Self::new(
            ErrorCode::InvalidResumeToken,
            "Presented resume token does not match the current token",
        )
        .with_next_action(
            NextAction::new("refetch").with_hint("GET the submission to obtain the current token"),
        )
    }

    /// Create an idempotency conflict error (same key, different payload).
    pub fn idempotency_conflict() -> Self {
        Self::new(
            ErrorCode::Conflict,
            "Idempotency key was already used with a different payload",
        )
        .with_next_action(NextAction::new("mint_new_key"))
    }

    /// Create a wrong-state error.
    pub fn invalid_state(current: SubmissionState, operation: &str) -> Self {
        Self::new(
            ErrorCode::InvalidState,
            format!("Operation {} is not legal in state {}", operation, current),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add a logged-only internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Attach field-level issues.
    pub fn with_fields(mut self, fields: Vec<FieldIssue>) -> Self {
        self.fields = fields;
        self
    }

    /// Attach a suggested next action.
    pub fn with_next_action(mut self, action: NextAction) -> Self {
        self.next_actions.push(action);
        self
    }

    /// Override the retry hint.
    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    /// Attach the submission context so the response carries the current
    /// state and resume token.
    pub fn with_submission(
        mut self,
        submission_id: uuid::Uuid,
        state: SubmissionState,
        resume_token: Option<String>,
    ) -> Self {
        self.context = Some(ErrorSubmissionContext {
            submission_id,
            state,
            resume_token,
        });
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn field_issues(&self) -> &[FieldIssue] {
        &self.fields
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        self.retry_after_ms
    }

    pub fn submission_context(&self) -> Option<&ErrorSubmissionContext> {
        self.context.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with severity matching its category.
    pub fn log(&self) {
        let code = self.code.to_string();
        let status = self.http_status().as_u16();

        match self.code {
            ErrorCode::InternalError | ErrorCode::StorageError => {
                error!(
                    error_code = %code,
                    http_status = status,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "Unexpected fault"
                );
            }
            ErrorCode::DeliveryFailed => {
                warn!(
                    error_code = %code,
                    http_status = status,
                    message = %self.message,
                    "Delivery failure"
                );
            }
            _ => {
                tracing::debug!(
                    error_code = %code,
                    http_status = status,
                    message = %self.message,
                    "Expected failure"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "intake_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.code.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Envelope (API Response)
// ═══════════════════════════════════════════════════════════════════════════════

/// Error body within the envelope.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Machine-readable error type.
    #[serde(rename = "type")]
    pub error_type: ErrorCode,
    /// Human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Field-level issues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldIssue>>,
    /// Suggested caller actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_actions: Option<Vec<NextAction>>,
    /// Whether retrying (after fixing input where applicable) can succeed.
    pub retryable: bool,
    /// Suggested delay before retrying, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// The uniform error envelope returned by every failing operation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// Always false for errors.
    pub ok: bool,
    /// Submission the failure relates to, when resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<uuid::Uuid>,
    /// Current state of that submission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SubmissionState>,
    /// Current resume token so the caller can resynchronize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Error details.
    pub error: ErrorBody,
}

impl From<&IntakeError> for ErrorEnvelope {
    fn from(err: &IntakeError) -> Self {
        let (submission_id, state, resume_token) = match &err.context {
            Some(ctx) => (
                Some(ctx.submission_id),
                Some(ctx.state),
                ctx.resume_token.clone(),
            ),
            None => (None, None, None),
        };

        Self {
            ok: false,
            submission_id,
            state,
            resume_token,
            error: ErrorBody {
                error_type: err.code,
                message: Some(err.message.to_string()),
                fields: if err.fields.is_empty() {
                    None
                } else {
                    Some(err.fields.clone())
                },
                next_actions: if err.next_actions.is_empty() {
                    None
                } else {
                    Some(err.next_actions.clone())
                },
                retryable: err.is_retryable(),
                retry_after_ms: err.retry_after_ms,
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let envelope = ErrorEnvelope::from(&self);

        (status, Json(envelope)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for IntakeError {
    fn from(error: sqlx::Error) -> Self {
        let err = match &error {
            sqlx::Error::RowNotFound => {
                Self::new(ErrorCode::NotFound, "The requested record was not found")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::storage("database pool unavailable")
            }
            sqlx::Error::Database(db_err) => {
                if let Some(constraint) = db_err.constraint() {
                    if constraint.contains("unique") || constraint.contains("pkey") {
                        return Self::new(
                            ErrorCode::Conflict,
                            "A record with this identifier already exists",
                        )
                        .with_internal_message(format!("constraint violation: {}", constraint))
                        .with_source(error);
                    }
                }
                Self::storage("database query failed")
            }
            _ => Self::storage("database error"),
        };
        err.with_internal_message(error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for IntakeError {
    fn from(error: serde_json::Error) -> Self {
        Self::internal(format!("JSON processing failed: {}", error)).with_source(error)
    }
}

impl From<reqwest::Error> for IntakeError {
    fn from(error: reqwest::Error) -> Self {
        let message = if error.is_timeout() {
            "Destination request timed out"
        } else if error.is_connect() {
            "Failed to connect to destination"
        } else {
            "Destination request failed"
        };
        Self::new(ErrorCode::DeliveryFailed, message)
            .with_internal_message(error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for IntakeError {
    fn from(error: std::io::Error) -> Self {
        Self::internal(format!("I/O error: {}", error)).with_source(error)
    }
}

impl From<config::ConfigError> for IntakeError {
    fn from(error: config::ConfigError) -> Self {
        Self::internal(format!("configuration error: {}", error))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for converting foreign errors with a context message.
pub trait ErrorContext<T> {
    /// Convert the error into an internal [`IntakeError`] with context.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| IntakeError::internal(message.into()).with_source(e))
    }
}
