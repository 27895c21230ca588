#![allow(clippy::result_large_err)]
//! # Intake Core
//!
//! A submission lifecycle engine for structured data intake.
//!
//! ## Architecture
//!
//! - **Engine**: The submission state machine with single-slot resume
//!   tokens, dual idempotency ledgers, and lazy expiry
//! - **Store**: Atomic snapshot-plus-event commits behind a compare-and-set
//!   on the resume token (in-memory and PostgreSQL backends)
//! - **Events**: Append-only, redacted audit log with filtered reads and
//!   NDJSON export
//! - **Delivery**: Signed webhook dispatch with bounded concurrency and
//!   exponential-backoff retries
//! - **API**: Axum HTTP surface returning uniform success and error
//!   envelopes that always carry the current resume token

pub mod api;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod observability;
pub mod store;
pub mod token;
pub mod validation;

pub use error::{ErrorCode, ErrorContext, ErrorEnvelope, IntakeError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::engine::{
        CreateResult, IntakeRegistry, ReviewDecision, SubmissionEngine, SubmitOutcome,
        SubmitRecord,
    };
    pub use crate::error::{ErrorCode, ErrorContext, ErrorEnvelope, IntakeError, Result};
    pub use crate::events::{EventFilter, EventPage, EventQuery};
    pub use crate::model::{
        Actor, ActorKind, DeliveryId, DeliveryRecord, DeliveryStatus, EventType,
        IntakeDefinition, RetryPolicy, Submission, SubmissionEvent, SubmissionId,
        SubmissionState,
    };
    pub use crate::store::{MemoryStore, PgStore, SubmissionStore};
    pub use crate::validation::{
        AcceptAllUploads, AllowAllReviewers, ReviewerAuthorization, SchemaValidator,
        UploadStorage, Validator,
    };
}
