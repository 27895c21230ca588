//! The submission state machine.
//!
//! [`SubmissionEngine`] owns every lifecycle operation: create, field
//! merges, validation-driven parking states, submit with mandatory
//! idempotency, review decisions, cancellation, handoff, lazy expiry, and
//! the system-driven transitions reported back by the delivery manager.
//!
//! Every mutating operation follows the same shape: load the submission
//! (applying lazy expiry first), check the presented resume token, build
//! the updated record with version+1 and a freshly rotated token, and push
//! `[snapshot, event]` through the store's compare-and-set in one atomic
//! step. A failed token check leaves the record byte-for-byte unchanged,
//! advances nothing, and appends nothing.

mod gates;
mod registry;

pub use gates::GateEvaluator;
pub use registry::IntakeRegistry;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, ErrorEnvelope, IntakeError, NextAction, Result};
use crate::events::{redact_event, EventFilter, EventPage, EventQuery};
use crate::model::{
    Actor, DeliveryRecord, EventType, FieldKind, FieldMap, IntakeDefinition, Submission,
    SubmissionEvent, SubmissionId, SubmissionState,
};
use crate::store::{
    CommitResult, CreateOutcome, CreationKey, SubmissionStore, SubmitIdempotencyEntry,
};
use crate::token::generate_resume_token;
use crate::validation::{ReviewerAuthorization, UploadMeta, UploadStorage, Validator};

/// SHA-256 hex over the canonical JSON serialization of a payload.
///
/// `serde_json` serializes object keys in sorted order, so semantically
/// equal payloads hash equally regardless of how the caller ordered them.
pub fn payload_hash(payload: &serde_json::Value) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(payload)?);
    Ok(hex::encode(hasher.finalize()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Operation Results
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of a `create` call.
#[derive(Debug, Clone)]
pub struct CreateResult {
    pub submission: Submission,
    /// True when the creation idempotency key matched an existing entry
    /// and this is a pure read of that submission.
    pub replayed: bool,
}

/// The durable record a `submit` call caches in the idempotency ledger.
///
/// Replays return this verbatim, so it captures the submission snapshot
/// (or the serialized error envelope) exactly as first produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubmitRecord {
    Accepted {
        submission: Submission,
        review_required: bool,
    },
    Rejected {
        status: u16,
        envelope: serde_json::Value,
    },
}

/// Result of a `submit` call.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Applied now; one version bump happened.
    Applied(SubmitRecord),
    /// Cached result from the idempotency ledger; nothing changed.
    Replayed(SubmitRecord),
}

/// Review decision on a `needs_review` submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

/// One reviewer comment attached to a `request_changes` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldComment {
    pub path: String,
    pub comment: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Bound on internal compare-and-set retries for system transitions.
const SYSTEM_COMMIT_RETRIES: usize = 4;

/// The submission lifecycle engine.
pub struct SubmissionEngine {
    store: Arc<dyn SubmissionStore>,
    registry: IntakeRegistry,
    validator: Arc<dyn Validator>,
    uploads: Arc<dyn UploadStorage>,
    reviewers: Arc<dyn ReviewerAuthorization>,
}

impl SubmissionEngine {
    /// Wire the engine. The store doubles as the event sink and is a
    /// required dependency; there is deliberately no no-op fallback.
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        registry: IntakeRegistry,
        validator: Arc<dyn Validator>,
        uploads: Arc<dyn UploadStorage>,
        reviewers: Arc<dyn ReviewerAuthorization>,
    ) -> Self {
        Self {
            store,
            registry,
            validator,
            uploads,
            reviewers,
        }
    }

    pub fn registry(&self) -> &IntakeRegistry {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a submission in `draft`, merging any initial fields (which
    /// promotes it to `in_progress`).
    ///
    /// With an idempotency key, a second call with the same key is a pure
    /// read of the existing submission: current token, no rotation, no
    /// second `submission.created` event.
    pub async fn create(
        &self,
        intake_id: &str,
        actor: Actor,
        idempotency_key: Option<String>,
        initial_fields: Option<FieldMap>,
    ) -> Result<CreateResult> {
        let intake = self.registry.get(intake_id)?;

        let expires_at = match intake.submission_ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| IntakeError::internal(format!("invalid ttl: {}", e)))?,
            ),
            None => None,
        };

        let mut submission = Submission::new(
            intake_id,
            actor.clone(),
            generate_resume_token(),
            idempotency_key.clone(),
            expires_at,
        );
        if let Some(fields) = initial_fields {
            if !fields.is_empty() {
                submission.merge_fields(fields, &actor);
                submission.state = SubmissionState::InProgress;
            }
        }

        let event = SubmissionEvent::new(
            EventType::SubmissionCreated,
            submission.id,
            actor,
            submission.state,
            submission.version,
            json!({
                "intakeId": intake_id,
                "fields": submission.fields.keys().collect::<Vec<_>>(),
                "expiresAt": submission.expires_at,
            }),
        );

        let creation_key = idempotency_key.map(|key| CreationKey {
            intake_id: intake_id.to_string(),
            key,
        });

        match self
            .store
            .insert_submission(&submission, &event, creation_key.as_ref())
            .await?
        {
            CreateOutcome::Created => {
                counter!("intake_submissions_total", "intake" => intake_id.to_string())
                    .increment(1);
                info!(submission_id = %submission.id, intake = intake_id, "submission created");
                Ok(CreateResult {
                    submission,
                    replayed: false,
                })
            }
            CreateOutcome::Existing(existing_id) => {
                debug!(submission_id = %existing_id, intake = intake_id, "creation key replay");
                let existing = self
                    .store
                    .get_submission(existing_id)
                    .await?
                    .ok_or_else(|| {
                        IntakeError::storage("creation ledger points at a missing submission")
                    })?;
                Ok(CreateResult {
                    submission: existing,
                    replayed: true,
                })
            }
        }
    }

    /// Fetch a submission, applying lazy expiry first.
    pub async fn get(&self, id: SubmissionId) -> Result<Submission> {
        self.load(id).await
    }

    /// Merge fields last-writer-wins and let the validator pick the
    /// resulting state. Emits one `field.updated` event with a per-field
    /// diff payload.
    pub async fn set_fields(
        &self,
        id: SubmissionId,
        token: &str,
        actor: Actor,
        fields: FieldMap,
    ) -> Result<Submission> {
        let current = self.load(id).await?;
        self.ensure_accepts_writes(&current, "set_fields")?;
        self.check_token(&current, token)?;
        let intake = self.registry.get(&current.intake_id)?;

        let mut updated = current.clone();
        let diff = updated.merge_fields(fields, &actor);
        let report = self.validator.validate(&updated.fields, &intake.schema);
        updated.state = Self::parking_state(&report);
        Self::advance(&mut updated);

        let payload = json!({
            "action": "set_fields",
            "diff": diff
                .into_iter()
                .map(|(path, previous, new)| json!({
                    "path": path,
                    "previous": previous,
                    "new": new,
                }))
                .collect::<Vec<_>>(),
        });
        let event = SubmissionEvent::new(
            EventType::FieldUpdated,
            id,
            actor,
            updated.state,
            updated.version,
            payload,
        );

        self.commit(token, current.version, &updated, &event, None)
            .await?;
        Ok(updated)
    }

    /// Re-run validation and, when the outcome moves the submission
    /// between `in_progress` and a parking state, commit that transition
    /// with a `validation.passed`/`validation.failed` event. A no-op
    /// outcome is a pure read.
    pub async fn validate(
        &self,
        id: SubmissionId,
        token: &str,
        actor: Actor,
    ) -> Result<(Submission, crate::validation::ValidationReport)> {
        let current = self.load(id).await?;
        self.ensure_accepts_writes(&current, "validate")?;
        let intake = self.registry.get(&current.intake_id)?;

        let report = self.validator.validate(&current.fields, &intake.schema);
        let target = Self::parking_state(&report);
        if target == current.state {
            return Ok((current, report));
        }

        self.check_token(&current, token)?;
        let mut updated = current.clone();
        updated.state = target;
        Self::advance(&mut updated);

        let event_type = if report.ready {
            EventType::ValidationPassed
        } else {
            EventType::ValidationFailed
        };
        let event = SubmissionEvent::new(
            event_type,
            id,
            actor,
            target,
            updated.version,
            json!({
                "missing": report.missing,
                "invalid": report.invalid,
                "pendingUploads": report.pending_uploads,
            }),
        );

        self.commit(token, current.version, &updated, &event, None)
            .await?;
        Ok((updated, report))
    }

    /// Negotiate an upload slot for a file field through the storage
    /// collaborator. Parks the submission in `awaiting_upload` and returns
    /// the signed URL (which is never written to the event log).
    pub async fn request_upload(
        &self,
        id: SubmissionId,
        token: &str,
        actor: Actor,
        field: &str,
        meta: UploadMeta,
    ) -> Result<(Submission, String)> {
        let current = self.load(id).await?;
        self.ensure_accepts_writes(&current, "request_upload")?;
        self.check_token(&current, token)?;
        let intake = self.registry.get(&current.intake_id)?;

        let spec = intake
            .schema
            .field(field)
            .ok_or_else(|| IntakeError::invalid_request(format!("unknown field: {}", field)))?;
        if spec.kind != FieldKind::File {
            return Err(
                IntakeError::invalid_request(format!("field {} is not a file field", field))
                    .with_submission(id.0, current.state, Some(current.resume_token.clone())),
            );
        }

        let signed_url = self.uploads.negotiate_upload(&meta).await?;
        let upload_id = Uuid::new_v4().to_string();

        let mut updated = current.clone();
        updated.fields.insert(
            field.to_string(),
            json!({
                "uploadId": upload_id,
                "fileName": meta.file_name,
                "verified": false,
            }),
        );
        updated.attribution.insert(field.to_string(), actor.clone());
        updated.state = SubmissionState::AwaitingUpload;
        Self::advance(&mut updated);

        let event = SubmissionEvent::new(
            EventType::UploadRequested,
            id,
            actor,
            updated.state,
            updated.version,
            json!({ "field": field, "uploadId": upload_id }),
        );

        self.commit(token, current.version, &updated, &event, None)
            .await?;
        Ok((updated, signed_url))
    }

    /// Confirm a negotiated upload with the storage collaborator, mark the
    /// field verified, and re-park the submission per validation.
    pub async fn confirm_upload(
        &self,
        id: SubmissionId,
        token: &str,
        actor: Actor,
        field: &str,
    ) -> Result<Submission> {
        let current = self.load(id).await?;
        self.ensure_accepts_writes(&current, "confirm_upload")?;
        self.check_token(&current, token)?;
        let intake = self.registry.get(&current.intake_id)?;

        let upload_id = current
            .fields
            .get(field)
            .and_then(|v| v.get("uploadId"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                IntakeError::invalid_request(format!("no upload negotiated for field {}", field))
            })?;

        if !self.uploads.confirm_upload(&upload_id).await? {
            return Err(IntakeError::new(
                ErrorCode::UploadPending,
                "Upload has not completed",
            )
            .with_next_action(NextAction::new("upload").for_field(field))
            .with_submission(id.0, current.state, Some(current.resume_token.clone())));
        }

        let mut updated = current.clone();
        if let Some(serde_json::Value::Object(map)) = updated.fields.get_mut(field) {
            map.insert("verified".to_string(), serde_json::Value::Bool(true));
        }
        let report = self.validator.validate(&updated.fields, &intake.schema);
        updated.state = Self::parking_state(&report);
        Self::advance(&mut updated);

        let event = SubmissionEvent::new(
            EventType::UploadCompleted,
            id,
            actor,
            updated.state,
            updated.version,
            json!({ "field": field, "uploadId": upload_id }),
        );

        self.commit(token, current.version, &updated, &event, None)
            .await?;
        Ok(updated)
    }

    /// Submit for delivery or review. The idempotency key is mandatory;
    /// `raw_payload` is the caller's full request body and feeds the
    /// ledger's payload hash.
    ///
    /// Replaying the same key with an identical payload returns the cached
    /// record verbatim. Same key, different payload is a non-retryable
    /// `conflict`.
    pub async fn submit(
        &self,
        id: SubmissionId,
        token: &str,
        actor: Actor,
        idempotency_key: &str,
        raw_payload: &serde_json::Value,
    ) -> Result<SubmitOutcome> {
        let current = self.load(id).await?;
        let hash = payload_hash(raw_payload)?;

        if let Some(entry) = self.store.get_submit_entry(id, idempotency_key).await? {
            if entry.payload_hash == hash {
                debug!(submission_id = %id, key = idempotency_key, "submit key replay");
                let record: SubmitRecord = serde_json::from_value(entry.response)?;
                return Ok(SubmitOutcome::Replayed(record));
            }
            return Err(IntakeError::idempotency_conflict().with_submission(
                id.0,
                current.state,
                Some(current.resume_token.clone()),
            ));
        }

        self.ensure_accepts_writes(&current, "submit")?;
        self.check_token(&current, token)?;
        let intake = self.registry.get(&current.intake_id)?;

        let report = self.validator.validate(&current.fields, &intake.schema);
        let mut updated = current.clone();
        Self::advance(&mut updated);
        let now = Utc::now();

        if !report.ready {
            updated.state = Self::parking_state(&report);

            let (code, message) = if !report.pending_uploads.is_empty() {
                (ErrorCode::UploadPending, "File uploads are still pending")
            } else if !report.missing.is_empty() {
                (ErrorCode::Missing, "Required fields are missing")
            } else {
                (ErrorCode::Invalid, "Submitted fields failed validation")
            };
            let mut issues = report.missing.clone();
            issues.extend(report.invalid.clone());
            let err = IntakeError::new(code, message)
                .with_fields(issues)
                .with_next_action(NextAction::new("set_fields"))
                .with_submission(id.0, updated.state, Some(updated.resume_token.clone()));

            let record = SubmitRecord::Rejected {
                status: err.http_status().as_u16(),
                envelope: serde_json::to_value(ErrorEnvelope::from(&err))?,
            };
            let entry = SubmitIdempotencyEntry {
                submission_id: id,
                key: idempotency_key.to_string(),
                payload_hash: hash,
                response: serde_json::to_value(&record)?,
                created_at: now,
            };
            let event = SubmissionEvent::new(
                EventType::ValidationFailed,
                id,
                actor,
                updated.state,
                updated.version,
                json!({
                    "missing": report.missing,
                    "invalid": report.invalid,
                    "pendingUploads": report.pending_uploads,
                }),
            );

            self.commit(token, current.version, &updated, &event, Some(&entry))
                .await?;
            return Err(err);
        }

        let review_required = GateEvaluator::review_required(intake);
        let event = if review_required {
            updated.state = SubmissionState::NeedsReview;
            SubmissionEvent::new(
                EventType::ReviewRequested,
                id,
                actor,
                updated.state,
                updated.version,
                json!({
                    "gates": intake.gates.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
                    "requiredApprovals": GateEvaluator::required_approvals(intake),
                }),
            )
        } else {
            updated.state = SubmissionState::Submitted;
            SubmissionEvent::new(
                EventType::SubmissionSubmitted,
                id,
                actor,
                updated.state,
                updated.version,
                json!({ "destinations": intake.destinations.len() }),
            )
        };

        let record = SubmitRecord::Accepted {
            submission: updated.clone(),
            review_required,
        };
        let entry = SubmitIdempotencyEntry {
            submission_id: id,
            key: idempotency_key.to_string(),
            payload_hash: hash,
            response: serde_json::to_value(&record)?,
            created_at: now,
        };

        self.commit(token, current.version, &updated, &event, Some(&entry))
            .await?;
        info!(submission_id = %id, state = %updated.state, "submission submitted");

        if !review_required {
            self.enqueue_deliveries(&updated, intake).await?;
        }
        Ok(SubmitOutcome::Applied(record))
    }

    /// Apply a review decision. Only legal from `needs_review`; rejection
    /// requires at least one reason and is terminal.
    pub async fn review(
        &self,
        id: SubmissionId,
        token: &str,
        actor: Actor,
        decision: ReviewDecision,
        reasons: Vec<String>,
    ) -> Result<Submission> {
        let current = self.load(id).await?;
        self.ensure_state(&current, SubmissionState::NeedsReview, "review")?;
        let intake = self.registry.get(&current.intake_id)?;
        self.authorize_reviewer(&actor, intake, &current)?;
        self.check_token(&current, token)?;

        let mut updated = current.clone();
        Self::advance(&mut updated);

        let event = match decision {
            ReviewDecision::Rejected => {
                if reasons.is_empty() {
                    return Err(IntakeError::invalid_request(
                        "Rejection requires at least one reason",
                    )
                    .with_submission(id.0, current.state, Some(current.resume_token.clone())));
                }
                updated.state = SubmissionState::Rejected;
                SubmissionEvent::new(
                    EventType::ReviewRejected,
                    id,
                    actor,
                    updated.state,
                    updated.version,
                    json!({ "reasons": reasons }),
                )
            }
            ReviewDecision::Approved => {
                let prior = self
                    .store
                    .events_for(id)
                    .await?
                    .iter()
                    .filter(|e| e.event_type == EventType::ReviewApproved)
                    .count() as u32;
                let approvals = prior + 1;
                let complete = GateEvaluator::review_complete(intake, approvals);
                updated.state = if complete {
                    SubmissionState::Approved
                } else {
                    SubmissionState::NeedsReview
                };
                SubmissionEvent::new(
                    EventType::ReviewApproved,
                    id,
                    actor,
                    updated.state,
                    updated.version,
                    json!({
                        "approvals": approvals,
                        "required": GateEvaluator::required_approvals(intake),
                        "complete": complete,
                    }),
                )
            }
        };

        self.commit(token, current.version, &updated, &event, None)
            .await?;
        info!(submission_id = %id, state = %updated.state, "review decision applied");

        match updated.state {
            SubmissionState::Approved => {
                self.enqueue_deliveries(&updated, intake).await?;
            }
            SubmissionState::Rejected => {
                self.store.prune_idempotency(id).await?;
            }
            _ => {}
        }
        Ok(updated)
    }

    /// Return a `needs_review` submission to `in_progress` with reviewer
    /// comments, without introducing a new formal state.
    pub async fn request_changes(
        &self,
        id: SubmissionId,
        token: &str,
        actor: Actor,
        comments: Vec<FieldComment>,
    ) -> Result<Submission> {
        let current = self.load(id).await?;
        self.ensure_state(&current, SubmissionState::NeedsReview, "request_changes")?;
        let intake = self.registry.get(&current.intake_id)?;
        self.authorize_reviewer(&actor, intake, &current)?;
        self.check_token(&current, token)?;

        let mut updated = current.clone();
        updated.state = SubmissionState::InProgress;
        Self::advance(&mut updated);

        let event = SubmissionEvent::new(
            EventType::FieldUpdated,
            id,
            actor,
            updated.state,
            updated.version,
            json!({ "action": "request_changes", "comments": comments }),
        );

        self.commit(token, current.version, &updated, &event, None)
            .await?;
        Ok(updated)
    }

    /// Cancel from any non-terminal state. Immediately terminal.
    pub async fn cancel(
        &self,
        id: SubmissionId,
        token: &str,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Submission> {
        let current = self.load(id).await?;
        self.ensure_not_terminal(&current, "cancel")?;
        self.check_token(&current, token)?;

        let mut updated = current.clone();
        updated.state = SubmissionState::Cancelled;
        Self::advance(&mut updated);

        let event = SubmissionEvent::new(
            EventType::SubmissionCancelled,
            id,
            actor,
            updated.state,
            updated.version,
            json!({ "reason": reason }),
        );

        self.commit(token, current.version, &updated, &event, None)
            .await?;
        info!(submission_id = %id, "submission cancelled");
        self.store.prune_idempotency(id).await?;
        Ok(updated)
    }

    /// Explicit handoff of the single-slot token: rotates it so the caller
    /// can pass the fresh value to the receiving party, leaving state
    /// untouched.
    pub async fn handoff(
        &self,
        id: SubmissionId,
        token: &str,
        actor: Actor,
        to: Actor,
    ) -> Result<Submission> {
        let current = self.load(id).await?;
        self.ensure_not_terminal(&current, "handoff")?;
        self.check_token(&current, token)?;

        let mut updated = current.clone();
        Self::advance(&mut updated);

        let event = SubmissionEvent::new(
            EventType::SubmissionHandedOff,
            id,
            actor.clone(),
            updated.state,
            updated.version,
            json!({ "from": actor, "to": to }),
        );

        self.commit(token, current.version, &updated, &event, None)
            .await?;
        Ok(updated)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event log reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Filtered, paginated event read. Every returned event is redacted.
    pub async fn events(
        &self,
        id: SubmissionId,
        filter: &EventFilter,
        query: EventQuery,
    ) -> Result<EventPage> {
        let _ = self.load(id).await?;
        let all = self.store.events_for(id).await?;
        Ok(EventPage::from_events(&all, filter, query))
    }

    /// Full redacted event list in version order, for export.
    pub async fn export_events(&self, id: SubmissionId) -> Result<Vec<SubmissionEvent>> {
        let _ = self.load(id).await?;
        Ok(self
            .store
            .events_for(id)
            .await?
            .iter()
            .map(redact_event)
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery manager hooks
    // ─────────────────────────────────────────────────────────────────────────

    /// Pre-dispatch liveness check: the owning submission must not be
    /// cancelled or expired, or the delivery is abandoned.
    pub async fn delivery_target(&self, id: SubmissionId) -> Result<Option<Submission>> {
        let submission = self.load(id).await?;
        match submission.state {
            SubmissionState::Cancelled | SubmissionState::Expired => Ok(None),
            _ => Ok(Some(submission)),
        }
    }

    /// Record that an attempt is being dispatched.
    pub async fn note_delivery_attempt(&self, record: &DeliveryRecord) -> Result<()> {
        let payload = json!({
            "deliveryId": record.id,
            "destination": record.destination_url,
            "attempt": record.attempts + 1,
        });
        self.system_commit(record.submission_id, |current| {
            if current.state.is_terminal() {
                return None;
            }
            Some((current.state, EventType::DeliveryAttempted, payload.clone()))
        })
        .await?;
        Ok(())
    }

    /// Record a successful delivery and finalize the submission if it is
    /// still awaiting that.
    pub async fn record_delivery_success(
        &self,
        record: &DeliveryRecord,
        status_code: u16,
    ) -> Result<()> {
        let payload = json!({ "deliveryId": record.id, "statusCode": status_code });
        self.system_commit(record.submission_id, |current| {
            if current.state.is_terminal() {
                return None;
            }
            Some((current.state, EventType::DeliverySucceeded, payload.clone()))
        })
        .await?;

        let finalize_payload = json!({ "deliveryId": record.id });
        let finalized = self
            .system_commit(record.submission_id, |current| {
                if !current.state.is_delivery_eligible() {
                    return None;
                }
                Some((
                    SubmissionState::Finalized,
                    EventType::SubmissionFinalized,
                    finalize_payload.clone(),
                ))
            })
            .await?;

        if let Some(submission) = finalized {
            if submission.state == SubmissionState::Finalized {
                info!(submission_id = %record.submission_id, "submission finalized");
                self.store.prune_idempotency(record.submission_id).await?;
            }
        }
        Ok(())
    }

    /// Record a failed delivery attempt. Submission state never changes on
    /// delivery failure; only the delivery record does.
    pub async fn record_delivery_failure(&self, record: &DeliveryRecord) -> Result<()> {
        let payload = json!({
            "deliveryId": record.id,
            "attempts": record.attempts,
            "error": record.last_error,
            "statusCode": record.last_status_code,
            "nextRetryAt": record.next_retry_at,
        });
        self.system_commit(record.submission_id, |current| {
            if current.state.is_terminal() {
                return None;
            }
            Some((current.state, EventType::DeliveryFailed, payload.clone()))
        })
        .await?;
        Ok(())
    }

    /// Record that a delivery was rescheduled by a manual retry.
    pub async fn note_delivery_rescheduled(&self, record: &DeliveryRecord) -> Result<()> {
        let payload = json!({ "deliveryId": record.id, "manual": true });
        self.system_commit(record.submission_id, |current| {
            if current.state.is_terminal() {
                return None;
            }
            Some((current.state, EventType::DeliveryScheduled, payload.clone()))
        })
        .await?;
        Ok(())
    }

    /// Create one pending delivery record per configured destination.
    async fn enqueue_deliveries(
        &self,
        submission: &Submission,
        intake: &IntakeDefinition,
    ) -> Result<Vec<DeliveryRecord>> {
        let mut records = Vec::with_capacity(intake.destinations.len());
        for destination in &intake.destinations {
            let record = DeliveryRecord::new(submission.id, &destination.url);
            self.store.insert_delivery(&record).await?;
            counter!("intake_deliveries_enqueued_total").increment(1);
            debug!(
                submission_id = %submission.id,
                delivery_id = %record.id,
                destination = %destination.url,
                "delivery enqueued"
            );
            records.push(record);
        }
        Ok(records)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    /// Load a submission, forcing lazy expiry before anything else sees it.
    async fn load(&self, id: SubmissionId) -> Result<Submission> {
        let submission = self
            .store
            .get_submission(id)
            .await?
            .ok_or_else(|| IntakeError::not_found("submission", id))?;

        if !submission.is_past_expiry(Utc::now()) {
            return Ok(submission);
        }

        let payload = json!({ "expiredAt": submission.expires_at });
        let expired = self
            .system_commit(id, |current| {
                if current.state.is_terminal() {
                    return None;
                }
                Some((
                    SubmissionState::Expired,
                    EventType::SubmissionExpired,
                    payload.clone(),
                ))
            })
            .await?
            .ok_or_else(|| IntakeError::not_found("submission", id))?;

        if expired.state == SubmissionState::Expired {
            warn!(submission_id = %id, "submission expired");
            self.store.prune_idempotency(id).await?;
        }
        Ok(expired)
    }

    /// The state the validator's report parks a writable submission in.
    fn parking_state(report: &crate::validation::ValidationReport) -> SubmissionState {
        if report.ready {
            SubmissionState::InProgress
        } else if !report.pending_uploads.is_empty() {
            SubmissionState::AwaitingUpload
        } else {
            SubmissionState::AwaitingInput
        }
    }

    /// Version bump, token rotation, updated timestamp.
    fn advance(submission: &mut Submission) {
        submission.version += 1;
        submission.resume_token = generate_resume_token();
        submission.updated_at = Utc::now();
    }

    fn check_token(&self, current: &Submission, presented: &str) -> Result<()> {
        if current.resume_token == presented {
            return Ok(());
        }
        counter!("intake_stale_tokens_total").increment(1);
        Err(IntakeError::invalid_resume_token().with_submission(
            current.id.0,
            current.state,
            Some(current.resume_token.clone()),
        ))
    }

    fn ensure_accepts_writes(&self, current: &Submission, operation: &str) -> Result<()> {
        if current.state.accepts_field_writes() {
            return Ok(());
        }
        Err(self.state_error(current, operation))
    }

    fn ensure_state(
        &self,
        current: &Submission,
        expected: SubmissionState,
        operation: &str,
    ) -> Result<()> {
        if current.state == expected {
            return Ok(());
        }
        Err(self.state_error(current, operation))
    }

    fn ensure_not_terminal(&self, current: &Submission, operation: &str) -> Result<()> {
        if !current.state.is_terminal() {
            return Ok(());
        }
        Err(self.state_error(current, operation))
    }

    fn state_error(&self, current: &Submission, operation: &str) -> IntakeError {
        let err = match current.state {
            SubmissionState::Expired => {
                IntakeError::new(ErrorCode::Expired, "Submission has expired")
            }
            SubmissionState::Cancelled => {
                IntakeError::new(ErrorCode::Cancelled, "Submission was cancelled")
            }
            state => IntakeError::invalid_state(state, operation),
        };
        err.with_submission(
            current.id.0,
            current.state,
            Some(current.resume_token.clone()),
        )
    }

    /// Push one mutation through the store's compare-and-set, mapping a
    /// lost race to `invalid_resume_token` carrying the current token.
    async fn commit(
        &self,
        expected_token: &str,
        expected_version: u64,
        updated: &Submission,
        event: &SubmissionEvent,
        entry: Option<&SubmitIdempotencyEntry>,
    ) -> Result<()> {
        match self
            .store
            .commit(expected_token, expected_version, updated, event, entry)
            .await?
        {
            CommitResult::Applied => {
                counter!(
                    "intake_transitions_total",
                    "event" => event.event_type.as_str(),
                    "state" => updated.state.as_str(),
                )
                .increment(1);
                Ok(())
            }
            CommitResult::Stale => {
                counter!("intake_stale_tokens_total").increment(1);
                let current = self.store.get_submission(updated.id).await?;
                let (state, token) = current
                    .map(|s| (s.state, Some(s.resume_token)))
                    .unwrap_or((updated.state, None));
                Err(IntakeError::invalid_resume_token()
                    .with_submission(updated.id.0, state, token))
            }
        }
    }

    /// Apply a system-driven transition, presenting the stored token and
    /// retrying the compare-and-set on races. The closure returns the
    /// target state, event type, and payload, or `None` to skip.
    ///
    /// Returns the submission as last observed, `None` if it no longer
    /// exists.
    async fn system_commit<F>(&self, id: SubmissionId, decide: F) -> Result<Option<Submission>>
    where
        F: Fn(&Submission) -> Option<(SubmissionState, EventType, serde_json::Value)>,
    {
        for _ in 0..SYSTEM_COMMIT_RETRIES {
            let current = match self.store.get_submission(id).await? {
                Some(s) => s,
                None => return Ok(None),
            };
            let Some((state, event_type, payload)) = decide(&current) else {
                return Ok(Some(current));
            };

            let mut updated = current.clone();
            updated.state = state;
            Self::advance(&mut updated);
            let event = SubmissionEvent::new(
                event_type,
                id,
                Actor::system(),
                state,
                updated.version,
                payload,
            );

            if let CommitResult::Applied = self
                .store
                .commit(&current.resume_token, current.version, &updated, &event, None)
                .await?
            {
                counter!(
                    "intake_transitions_total",
                    "event" => event_type.as_str(),
                    "state" => state.as_str(),
                )
                .increment(1);
                return Ok(Some(updated));
            }
        }
        Err(IntakeError::storage(
            "system transition kept losing the token race",
        ))
    }

    fn authorize_reviewer(
        &self,
        actor: &Actor,
        intake: &IntakeDefinition,
        current: &Submission,
    ) -> Result<()> {
        for gate in &intake.gates {
            if !self.reviewers.is_authorized_reviewer(actor, gate) {
                return Err(IntakeError::forbidden(format!(
                    "Actor {} is not an authorized reviewer for gate {}",
                    actor, gate.name
                ))
                .with_submission(
                    current.id.0,
                    current.state,
                    Some(current.resume_token.clone()),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_hash_is_order_insensitive() {
        let a = json!({ "b": 2, "a": 1 });
        let b = json!({ "a": 1, "b": 2 });
        assert_eq!(payload_hash(&a).unwrap(), payload_hash(&b).unwrap());
        assert_ne!(
            payload_hash(&a).unwrap(),
            payload_hash(&json!({ "a": 1, "b": 3 })).unwrap()
        );
    }

    #[test]
    fn test_submit_record_round_trip() {
        let record = SubmitRecord::Rejected {
            status: 400,
            envelope: json!({ "ok": false }),
        };
        let value = serde_json::to_value(&record).unwrap();
        let back: SubmitRecord = serde_json::from_value(value).unwrap();
        match back {
            SubmitRecord::Rejected { status, .. } => assert_eq!(status, 400),
            _ => panic!("wrong variant"),
        }
    }
}
