//! End-to-end tests for the submission state machine.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use intake_core::engine::{IntakeRegistry, ReviewDecision, SubmissionEngine, SubmitOutcome, SubmitRecord};
use intake_core::error::ErrorCode;
use intake_core::model::{
    Actor, ApprovalGate, EventType, FieldKind, FieldMap, FieldSchema, FieldSpec,
    IntakeDefinition, SubmissionState,
};
use intake_core::store::{MemoryStore, SubmissionStore};
use intake_core::validation::{AcceptAllUploads, AllowAllReviewers, SchemaValidator};

// ============================================================================
// Test Utilities
// ============================================================================

fn schema() -> FieldSchema {
    FieldSchema {
        fields: vec![
            FieldSpec {
                name: "companyName".to_string(),
                required: true,
                kind: FieldKind::Text,
            },
            FieldSpec {
                name: "employeeCount".to_string(),
                required: false,
                kind: FieldKind::Number,
            },
        ],
    }
}

fn basic_intake() -> IntakeDefinition {
    IntakeDefinition::new("vendor-onboarding").with_schema(schema())
}

fn gated_intake(required_approvals: u32) -> IntakeDefinition {
    basic_intake().with_gate(ApprovalGate {
        name: "compliance".to_string(),
        required_approvals,
        escalate_after_ms: None,
    })
}

fn engine_with(intakes: Vec<IntakeDefinition>) -> (Arc<SubmissionEngine>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(SubmissionEngine::new(
        store.clone(),
        IntakeRegistry::new(intakes),
        Arc::new(SchemaValidator),
        Arc::new(AcceptAllUploads::new("https://uploads.test")),
        Arc::new(AllowAllReviewers),
    ));
    (engine, store)
}

fn fields(values: &[(&str, serde_json::Value)]) -> FieldMap {
    values
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ============================================================================
// Creation and Field Writes
// ============================================================================

#[tokio::test]
async fn test_create_starts_in_draft_with_token() {
    let (engine, _) = engine_with(vec![basic_intake()]);

    let result = engine
        .create("vendor-onboarding", Actor::agent("bot-1"), None, None)
        .await
        .unwrap();

    assert!(!result.replayed);
    assert_eq!(result.submission.state, SubmissionState::Draft);
    assert_eq!(result.submission.version, 0);
    assert_eq!(result.submission.resume_token.len(), 64);
}

#[tokio::test]
async fn test_create_with_initial_fields_is_in_progress() {
    let (engine, _) = engine_with(vec![basic_intake()]);

    let result = engine
        .create(
            "vendor-onboarding",
            Actor::agent("bot-1"),
            None,
            Some(fields(&[("companyName", json!("Acme"))])),
        )
        .await
        .unwrap();

    assert_eq!(result.submission.state, SubmissionState::InProgress);
    assert_eq!(result.submission.fields["companyName"], json!("Acme"));
}

#[tokio::test]
async fn test_create_unknown_intake_is_not_found() {
    let (engine, _) = engine_with(vec![basic_intake()]);
    let err = engine
        .create("no-such-intake", Actor::agent("bot-1"), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_set_fields_rotates_token_and_bumps_version_once() {
    let (engine, _) = engine_with(vec![basic_intake()]);
    let created = engine
        .create("vendor-onboarding", Actor::agent("bot-1"), None, None)
        .await
        .unwrap()
        .submission;

    let updated = engine
        .set_fields(
            created.id,
            &created.resume_token,
            Actor::agent("bot-1"),
            fields(&[("companyName", json!("Acme"))]),
        )
        .await
        .unwrap();

    assert_eq!(updated.version, created.version + 1);
    assert_ne!(updated.resume_token, created.resume_token);
    assert_eq!(updated.state, SubmissionState::InProgress);
}

#[tokio::test]
async fn test_stale_token_is_rejected_and_changes_nothing() {
    let (engine, store) = engine_with(vec![basic_intake()]);
    let created = engine
        .create("vendor-onboarding", Actor::agent("bot-1"), None, None)
        .await
        .unwrap()
        .submission;

    let current = engine
        .set_fields(
            created.id,
            &created.resume_token,
            Actor::agent("bot-1"),
            fields(&[("companyName", json!("Acme"))]),
        )
        .await
        .unwrap();

    // Present the superseded token.
    let err = engine
        .set_fields(
            created.id,
            &created.resume_token,
            Actor::agent("bot-2"),
            fields(&[("companyName", json!("Mallory Inc"))]),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidResumeToken);
    assert!(err.is_retryable());
    // The error carries the current token so the loser can resynchronize.
    let ctx = err.submission_context().unwrap();
    assert_eq!(ctx.resume_token.as_deref(), Some(current.resume_token.as_str()));

    // Nothing was written: same version, same fields, same event count.
    let after = engine.get(created.id).await.unwrap();
    assert_eq!(after.version, current.version);
    assert_eq!(after.fields["companyName"], json!("Acme"));
    assert_eq!(store.events_for(created.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_versions_are_strictly_sequential() {
    let (engine, store) = engine_with(vec![basic_intake()]);
    let mut current = engine
        .create("vendor-onboarding", Actor::agent("bot-1"), None, None)
        .await
        .unwrap()
        .submission;

    for i in 0..5u64 {
        current = engine
            .set_fields(
                current.id,
                &current.resume_token,
                Actor::agent("bot-1"),
                fields(&[("companyName", json!(format!("Acme v{}", i)))]),
            )
            .await
            .unwrap();
    }

    let events = store.events_for(current.id).await.unwrap();
    let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![0, 1, 2, 3, 4, 5]);
}

// ============================================================================
// Submit and Review
// ============================================================================

#[tokio::test]
async fn test_ungated_submit_goes_to_submitted() {
    let (engine, _) = engine_with(vec![basic_intake()]);
    let created = engine
        .create(
            "vendor-onboarding",
            Actor::agent("bot-1"),
            None,
            Some(fields(&[("companyName", json!("Acme"))])),
        )
        .await
        .unwrap()
        .submission;

    let outcome = engine
        .submit(
            created.id,
            &created.resume_token,
            Actor::agent("bot-1"),
            "submit-key-1",
            &json!({ "idempotencyKey": "submit-key-1" }),
        )
        .await
        .unwrap();

    match outcome {
        SubmitOutcome::Applied(SubmitRecord::Accepted {
            submission,
            review_required,
        }) => {
            assert!(!review_required);
            assert_eq!(submission.state, SubmissionState::Submitted);
            assert_eq!(submission.version, created.version + 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_gated_submit_parks_in_needs_review_then_approves() {
    let (engine, _) = engine_with(vec![gated_intake(1)]);
    let created = engine
        .create(
            "vendor-onboarding",
            Actor::agent("bot-1"),
            None,
            Some(fields(&[("companyName", json!("Acme"))])),
        )
        .await
        .unwrap()
        .submission;

    let outcome = engine
        .submit(
            created.id,
            &created.resume_token,
            Actor::agent("bot-1"),
            "submit-key-1",
            &json!({}),
        )
        .await
        .unwrap();

    let submitted = match outcome {
        SubmitOutcome::Applied(SubmitRecord::Accepted {
            submission,
            review_required,
        }) => {
            assert!(review_required);
            assert_eq!(submission.state, SubmissionState::NeedsReview);
            submission
        }
        other => panic!("unexpected outcome: {:?}", other),
    };

    let approved = engine
        .review(
            submitted.id,
            &submitted.resume_token,
            Actor::human("reviewer-1"),
            ReviewDecision::Approved,
            Vec::new(),
        )
        .await
        .unwrap();
    assert_eq!(approved.state, SubmissionState::Approved);
}

#[tokio::test]
async fn test_multi_approval_gate_requires_all_approvals() {
    let (engine, _) = engine_with(vec![gated_intake(2)]);
    let created = engine
        .create(
            "vendor-onboarding",
            Actor::agent("bot-1"),
            None,
            Some(fields(&[("companyName", json!("Acme"))])),
        )
        .await
        .unwrap()
        .submission;

    let outcome = engine
        .submit(created.id, &created.resume_token, Actor::agent("bot-1"), "k1", &json!({}))
        .await
        .unwrap();
    let submitted = match outcome {
        SubmitOutcome::Applied(SubmitRecord::Accepted { submission, .. }) => submission,
        other => panic!("unexpected outcome: {:?}", other),
    };

    let first = engine
        .review(
            submitted.id,
            &submitted.resume_token,
            Actor::human("reviewer-1"),
            ReviewDecision::Approved,
            Vec::new(),
        )
        .await
        .unwrap();
    assert_eq!(first.state, SubmissionState::NeedsReview);

    let second = engine
        .review(
            first.id,
            &first.resume_token,
            Actor::human("reviewer-2"),
            ReviewDecision::Approved,
            Vec::new(),
        )
        .await
        .unwrap();
    assert_eq!(second.state, SubmissionState::Approved);
}

#[tokio::test]
async fn test_rejection_requires_reasons_and_is_terminal() {
    let (engine, _) = engine_with(vec![gated_intake(1)]);
    let created = engine
        .create(
            "vendor-onboarding",
            Actor::agent("bot-1"),
            None,
            Some(fields(&[("companyName", json!("Acme"))])),
        )
        .await
        .unwrap()
        .submission;
    let outcome = engine
        .submit(created.id, &created.resume_token, Actor::agent("bot-1"), "k1", &json!({}))
        .await
        .unwrap();
    let submitted = match outcome {
        SubmitOutcome::Applied(SubmitRecord::Accepted { submission, .. }) => submission,
        other => panic!("unexpected outcome: {:?}", other),
    };

    let err = engine
        .review(
            submitted.id,
            &submitted.resume_token,
            Actor::human("reviewer-1"),
            ReviewDecision::Rejected,
            Vec::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);

    let rejected = engine
        .review(
            submitted.id,
            &submitted.resume_token,
            Actor::human("reviewer-1"),
            ReviewDecision::Rejected,
            vec!["tax id does not match registry".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(rejected.state, SubmissionState::Rejected);

    // Terminal: nothing further is accepted.
    let err = engine
        .set_fields(
            rejected.id,
            &rejected.resume_token,
            Actor::agent("bot-1"),
            fields(&[("companyName", json!("Acme 2"))]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
}

#[tokio::test]
async fn test_request_changes_returns_to_in_progress() {
    let (engine, store) = engine_with(vec![gated_intake(1)]);
    let created = engine
        .create(
            "vendor-onboarding",
            Actor::agent("bot-1"),
            None,
            Some(fields(&[("companyName", json!("Acme"))])),
        )
        .await
        .unwrap()
        .submission;
    let outcome = engine
        .submit(created.id, &created.resume_token, Actor::agent("bot-1"), "k1", &json!({}))
        .await
        .unwrap();
    let submitted = match outcome {
        SubmitOutcome::Applied(SubmitRecord::Accepted { submission, .. }) => submission,
        other => panic!("unexpected outcome: {:?}", other),
    };

    let reworked = engine
        .request_changes(
            submitted.id,
            &submitted.resume_token,
            Actor::human("reviewer-1"),
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(reworked.state, SubmissionState::InProgress);

    // Recorded as a field.updated action, not a distinct event kind.
    let events = store.events_for(created.id).await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::FieldUpdated);
    assert_eq!(last.payload["action"], "request_changes");
}

// ============================================================================
// Cancel, Handoff, Expiry
// ============================================================================

#[tokio::test]
async fn test_cancel_is_legal_from_needs_review() {
    let (engine, _) = engine_with(vec![gated_intake(1)]);
    let created = engine
        .create(
            "vendor-onboarding",
            Actor::agent("bot-1"),
            None,
            Some(fields(&[("companyName", json!("Acme"))])),
        )
        .await
        .unwrap()
        .submission;
    let outcome = engine
        .submit(created.id, &created.resume_token, Actor::agent("bot-1"), "k1", &json!({}))
        .await
        .unwrap();
    let submitted = match outcome {
        SubmitOutcome::Applied(SubmitRecord::Accepted { submission, .. }) => submission,
        other => panic!("unexpected outcome: {:?}", other),
    };

    let cancelled = engine
        .cancel(
            submitted.id,
            &submitted.resume_token,
            Actor::human("requester-1"),
            Some("duplicate request".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(cancelled.state, SubmissionState::Cancelled);

    let err = engine
        .cancel(cancelled.id, &cancelled.resume_token, Actor::human("requester-1"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
}

#[tokio::test]
async fn test_handoff_rotates_token_without_changing_state() {
    let (engine, _) = engine_with(vec![basic_intake()]);
    let created = engine
        .create(
            "vendor-onboarding",
            Actor::agent("bot-1"),
            None,
            Some(fields(&[("companyName", json!("Acme"))])),
        )
        .await
        .unwrap()
        .submission;

    let handed = engine
        .handoff(
            created.id,
            &created.resume_token,
            Actor::agent("bot-1"),
            Actor::human("requester-1"),
        )
        .await
        .unwrap();

    assert_eq!(handed.state, created.state);
    assert_ne!(handed.resume_token, created.resume_token);
    assert_eq!(handed.version, created.version + 1);

    // The old holder's token is dead.
    let err = engine
        .set_fields(
            created.id,
            &created.resume_token,
            Actor::agent("bot-1"),
            fields(&[("companyName", json!("Acme 2"))]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidResumeToken);
}

#[tokio::test]
async fn test_expiry_is_applied_lazily_on_read() {
    let intake = basic_intake().with_submission_ttl(Duration::from_millis(10));
    let (engine, store) = engine_with(vec![intake]);

    let created = engine
        .create("vendor-onboarding", Actor::agent("bot-1"), None, None)
        .await
        .unwrap()
        .submission;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let read = engine.get(created.id).await.unwrap();
    assert_eq!(read.state, SubmissionState::Expired);

    let events = store.events_for(created.id).await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::SubmissionExpired);

    let err = engine
        .set_fields(
            created.id,
            &read.resume_token,
            Actor::agent("bot-1"),
            fields(&[("companyName", json!("Acme"))]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Expired);
    assert!(!err.is_retryable());
}
