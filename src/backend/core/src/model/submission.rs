//! The submission record and its lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::Actor;

/// Unique identifier for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a submission.
///
/// `finalized`, `rejected`, `cancelled` and `expired` are terminal: a
/// terminal submission never mutates fields and never accepts a new token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    Draft,
    InProgress,
    AwaitingInput,
    AwaitingUpload,
    Submitted,
    NeedsReview,
    Approved,
    Rejected,
    Finalized,
    Cancelled,
    Expired,
}

impl SubmissionState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finalized | Self::Rejected | Self::Cancelled | Self::Expired
        )
    }

    /// States in which field edits are accepted.
    pub fn accepts_field_writes(&self) -> bool {
        matches!(
            self,
            Self::Draft | Self::InProgress | Self::AwaitingInput | Self::AwaitingUpload
        )
    }

    /// States eligible for outbound delivery.
    pub fn is_delivery_eligible(&self) -> bool {
        matches!(self, Self::Submitted | Self::Approved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::InProgress => "in_progress",
            Self::AwaitingInput => "awaiting_input",
            Self::AwaitingUpload => "awaiting_upload",
            Self::Submitted => "submitted",
            Self::NeedsReview => "needs_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Finalized => "finalized",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field values keyed by path.
///
/// Ordered map so serialized payloads (and therefore idempotency hashes)
/// are stable across runs.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// One instance of an intake being filled out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: SubmissionId,
    pub intake_id: String,
    pub state: SubmissionState,
    /// The single currently-valid resume token.
    pub resume_token: String,
    /// Monotonic counter; strictly +1 per applied mutation.
    pub version: u64,
    /// Creation idempotency key, if one was supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub fields: FieldMap,
    /// Actor that last wrote each field.
    pub attribution: BTreeMap<String, Actor>,
    pub created_by: Actor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Submission {
    /// Allocate a fresh draft submission.
    pub fn new(
        intake_id: impl Into<String>,
        created_by: Actor,
        resume_token: String,
        idempotency_key: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SubmissionId::new(),
            intake_id: intake_id.into(),
            state: SubmissionState::Draft,
            resume_token,
            version: 0,
            idempotency_key,
            fields: BTreeMap::new(),
            attribution: BTreeMap::new(),
            created_by,
            created_at: now,
            updated_at: now,
            expires_at,
        }
    }

    /// Check whether the submission has passed its expiry timestamp.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal()
            && self.expires_at.map(|at| now > at).unwrap_or(false)
    }

    /// Merge fields last-writer-wins, recording attribution per field.
    ///
    /// Returns the per-field diff (previous value, new value) for the
    /// `field.updated` event payload.
    pub fn merge_fields(
        &mut self,
        updates: FieldMap,
        actor: &Actor,
    ) -> Vec<(String, Option<serde_json::Value>, serde_json::Value)> {
        let mut diff = Vec::with_capacity(updates.len());
        for (path, value) in updates {
            let previous = self.fields.insert(path.clone(), value.clone());
            self.attribution.insert(path.clone(), actor.clone());
            diff.push((path, previous, value));
        }
        diff
    }
}
