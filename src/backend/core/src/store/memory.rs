//! In-memory store.
//!
//! A single `RwLock` over all tables keeps the atomicity story trivial: one
//! write guard spans every multi-table step, so the commit primitive cannot
//! interleave with another writer. Suited to tests and single-node use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{IntakeError, Result};
use crate::model::{DeliveryId, DeliveryRecord, Submission, SubmissionEvent, SubmissionId};

use super::{CommitResult, CreateOutcome, CreationKey, SubmissionStore, SubmitIdempotencyEntry};

#[derive(Default)]
struct Inner {
    submissions: HashMap<SubmissionId, Submission>,
    events: HashMap<SubmissionId, Vec<SubmissionEvent>>,
    /// Keyed by `(intake_id, key)`, mapping to the owning submission.
    creation_keys: HashMap<(String, String), SubmissionId>,
    /// Keyed by `(submission_id, key)`.
    submit_keys: HashMap<(SubmissionId, String), SubmitIdempotencyEntry>,
    deliveries: HashMap<DeliveryId, DeliveryRecord>,
}

/// In-memory [`SubmissionStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn insert_submission(
        &self,
        submission: &Submission,
        event: &SubmissionEvent,
        creation_key: Option<&CreationKey>,
    ) -> Result<CreateOutcome> {
        let mut inner = self.inner.write();

        if let Some(key) = creation_key {
            let ledger_key = (key.intake_id.clone(), key.key.clone());
            if let Some(existing) = inner.creation_keys.get(&ledger_key) {
                return Ok(CreateOutcome::Existing(*existing));
            }
            inner.creation_keys.insert(ledger_key, submission.id);
        }

        inner.submissions.insert(submission.id, submission.clone());
        inner.events.insert(submission.id, vec![event.clone()]);
        Ok(CreateOutcome::Created)
    }

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>> {
        Ok(self.inner.read().submissions.get(&id).cloned())
    }

    async fn commit(
        &self,
        expected_token: &str,
        expected_version: u64,
        submission: &Submission,
        event: &SubmissionEvent,
        submit_entry: Option<&SubmitIdempotencyEntry>,
    ) -> Result<CommitResult> {
        let mut inner = self.inner.write();

        let stored = inner
            .submissions
            .get(&submission.id)
            .ok_or_else(|| IntakeError::not_found("submission", submission.id))?;

        if stored.resume_token != expected_token || stored.version != expected_version {
            return Ok(CommitResult::Stale);
        }

        inner.submissions.insert(submission.id, submission.clone());
        inner
            .events
            .entry(submission.id)
            .or_default()
            .push(event.clone());
        if let Some(entry) = submit_entry {
            inner
                .submit_keys
                .insert((entry.submission_id, entry.key.clone()), entry.clone());
        }
        Ok(CommitResult::Applied)
    }

    async fn events_for(&self, id: SubmissionId) -> Result<Vec<SubmissionEvent>> {
        Ok(self.inner.read().events.get(&id).cloned().unwrap_or_default())
    }

    async fn get_submit_entry(
        &self,
        submission_id: SubmissionId,
        key: &str,
    ) -> Result<Option<SubmitIdempotencyEntry>> {
        Ok(self
            .inner
            .read()
            .submit_keys
            .get(&(submission_id, key.to_string()))
            .cloned())
    }

    async fn insert_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        self.inner.write().deliveries.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        Ok(self.inner.read().deliveries.get(&id).cloned())
    }

    async fn update_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.deliveries.contains_key(&record.id) {
            return Err(IntakeError::not_found("delivery", record.id));
        }
        inner.deliveries.insert(record.id, record.clone());
        Ok(())
    }

    async fn deliveries_for(&self, submission_id: SubmissionId) -> Result<Vec<DeliveryRecord>> {
        let inner = self.inner.read();
        let mut records: Vec<DeliveryRecord> = inner
            .deliveries
            .values()
            .filter(|r| r.submission_id == submission_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let inner = self.inner.read();
        let mut due: Vec<DeliveryRecord> = inner
            .deliveries
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_retry_at.unwrap_or(r.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn prune_idempotency(&self, submission_id: SubmissionId) -> Result<()> {
        let mut inner = self.inner.write();
        inner.submit_keys.retain(|(id, _), _| *id != submission_id);
        inner.creation_keys.retain(|_, owner| *owner != submission_id);
        Ok(())
    }
}
