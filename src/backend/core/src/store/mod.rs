//! Storage layer for Intake Core.
//!
//! The engine talks to storage only through [`SubmissionStore`]. The trait's
//! central primitive is [`SubmissionStore::commit`]: a compare-and-set on the
//! resume token that replaces the submission snapshot and appends exactly one
//! event atomically, or writes nothing at all. Everything the lifecycle
//! promises about tokens, versions, and the event log reduces to that
//! primitive holding.
//!
//! Two implementations ship: [`MemoryStore`] for tests and single-node
//! deployments, and [`PgStore`] on PostgreSQL for everything else.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{DeliveryId, DeliveryRecord, Submission, SubmissionEvent, SubmissionId};

/// Outcome of the token compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    /// The expectation held; snapshot replaced and event appended.
    Applied,
    /// The stored token or version no longer matched. Nothing was written.
    Stale,
}

/// Outcome of inserting a new submission under a creation idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Fresh submission inserted.
    Created,
    /// The key was already registered with the same payload hash; the
    /// caller replays the existing submission instead.
    Existing(SubmissionId),
}

/// Creation-ledger key presented at insert time. Scoped per intake.
#[derive(Debug, Clone)]
pub struct CreationKey {
    pub intake_id: String,
    pub key: String,
}

/// One entry in the submission idempotency ledger.
///
/// `response` is the exact serialized result (success or structured error)
/// returned to the first caller; replays return it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitIdempotencyEntry {
    pub submission_id: SubmissionId,
    pub key: String,
    /// SHA-256 hex of the canonical submit payload.
    pub payload_hash: String,
    pub response: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Storage contract for submissions, events, idempotency ledgers, and
/// delivery records.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Insert a fresh submission together with its `submission.created`
    /// event, registering the creation idempotency key in the same atomic
    /// step when one is supplied.
    ///
    /// Returns [`CreateOutcome::Existing`] when the key was already
    /// registered; a creation replay is a pure read of the existing
    /// submission.
    async fn insert_submission(
        &self,
        submission: &Submission,
        event: &SubmissionEvent,
        creation_key: Option<&CreationKey>,
    ) -> Result<CreateOutcome>;

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>>;

    /// Replace the submission snapshot and append one event, atomically,
    /// iff the stored resume token and version still match the
    /// expectation. `submit_entry` is recorded in the same atomic step
    /// when present.
    async fn commit(
        &self,
        expected_token: &str,
        expected_version: u64,
        submission: &Submission,
        event: &SubmissionEvent,
        submit_entry: Option<&SubmitIdempotencyEntry>,
    ) -> Result<CommitResult>;

    /// All events for a submission, ascending version order.
    async fn events_for(&self, id: SubmissionId) -> Result<Vec<SubmissionEvent>>;

    async fn get_submit_entry(
        &self,
        submission_id: SubmissionId,
        key: &str,
    ) -> Result<Option<SubmitIdempotencyEntry>>;

    async fn insert_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>>;

    /// Persist the full current state of a delivery record.
    async fn update_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    async fn deliveries_for(&self, submission_id: SubmissionId) -> Result<Vec<DeliveryRecord>>;

    /// Delivery records whose next attempt is due at `now`, oldest first.
    async fn due_deliveries(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<DeliveryRecord>>;

    /// Drop idempotency ledger entries for a submission. Called once the
    /// submission is terminal; replay guarantees no longer apply.
    async fn prune_idempotency(&self, submission_id: SubmissionId) -> Result<()>;
}
