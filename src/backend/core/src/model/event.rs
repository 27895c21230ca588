//! Audit events.
//!
//! One event is appended per applied mutation, atomically with the mutation
//! itself. Events are immutable once written and ordered by version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{Actor, SubmissionId, SubmissionState};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of event kinds.
///
/// New kinds must not be introduced informally; every addition is a schema
/// change for every audit consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "submission.created")]
    SubmissionCreated,
    #[serde(rename = "field.updated")]
    FieldUpdated,
    #[serde(rename = "validation.passed")]
    ValidationPassed,
    #[serde(rename = "validation.failed")]
    ValidationFailed,
    #[serde(rename = "upload.requested")]
    UploadRequested,
    #[serde(rename = "upload.completed")]
    UploadCompleted,
    #[serde(rename = "submission.submitted")]
    SubmissionSubmitted,
    #[serde(rename = "review.requested")]
    ReviewRequested,
    #[serde(rename = "review.approved")]
    ReviewApproved,
    #[serde(rename = "review.rejected")]
    ReviewRejected,
    #[serde(rename = "review.changes_requested")]
    ReviewChangesRequested,
    #[serde(rename = "delivery.scheduled")]
    DeliveryScheduled,
    #[serde(rename = "delivery.attempted")]
    DeliveryAttempted,
    #[serde(rename = "delivery.succeeded")]
    DeliverySucceeded,
    #[serde(rename = "delivery.failed")]
    DeliveryFailed,
    #[serde(rename = "submission.finalized")]
    SubmissionFinalized,
    #[serde(rename = "submission.cancelled")]
    SubmissionCancelled,
    #[serde(rename = "submission.expired")]
    SubmissionExpired,
    #[serde(rename = "submission.handed_off")]
    SubmissionHandedOff,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmissionCreated => "submission.created",
            Self::FieldUpdated => "field.updated",
            Self::ValidationPassed => "validation.passed",
            Self::ValidationFailed => "validation.failed",
            Self::UploadRequested => "upload.requested",
            Self::UploadCompleted => "upload.completed",
            Self::SubmissionSubmitted => "submission.submitted",
            Self::ReviewRequested => "review.requested",
            Self::ReviewApproved => "review.approved",
            Self::ReviewRejected => "review.rejected",
            Self::ReviewChangesRequested => "review.changes_requested",
            Self::DeliveryScheduled => "delivery.scheduled",
            Self::DeliveryAttempted => "delivery.attempted",
            Self::DeliverySucceeded => "delivery.succeeded",
            Self::DeliveryFailed => "delivery.failed",
            Self::SubmissionFinalized => "submission.finalized",
            Self::SubmissionCancelled => "submission.cancelled",
            Self::SubmissionExpired => "submission.expired",
            Self::SubmissionHandedOff => "submission.handed_off",
        }
    }

    /// Parse from the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, versioned record of one state-changing action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionEvent {
    pub id: EventId,
    pub event_type: EventType,
    pub submission_id: SubmissionId,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    /// State the submission was in after this event applied.
    pub resulting_state: SubmissionState,
    /// Version assigned atomically with the mutation.
    pub version: u64,
    pub payload: serde_json::Value,
}

impl SubmissionEvent {
    pub fn new(
        event_type: EventType,
        submission_id: SubmissionId,
        actor: Actor,
        resulting_state: SubmissionState,
        version: u64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            submission_id,
            timestamp: Utc::now(),
            actor,
            resulting_state,
            version,
            payload,
        }
    }
}
