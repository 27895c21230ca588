//! HTTP API tests against a server bound to an ephemeral port.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};

use intake_core::api::{build_router, AppState};
use intake_core::config::DeliveryConfig;
use intake_core::delivery::DeliveryManager;
use intake_core::engine::{IntakeRegistry, SubmissionEngine};
use intake_core::model::{FieldKind, FieldSchema, FieldSpec, IntakeDefinition};
use intake_core::store::{MemoryStore, SubmissionStore};
use intake_core::validation::{AcceptAllUploads, AllowAllReviewers, SchemaValidator};

// ============================================================================
// Test Harness
// ============================================================================

struct TestApp {
    base: String,
    client: reqwest::Client,
}

impl TestApp {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

fn vendor_intake() -> IntakeDefinition {
    IntakeDefinition::new("vendor-onboarding").with_schema(FieldSchema {
        fields: vec![FieldSpec {
            name: "companyName".to_string(),
            required: true,
            kind: FieldKind::Text,
        }],
    })
}

async fn spawn_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(SubmissionEngine::new(
        store.clone(),
        IntakeRegistry::new(vec![vendor_intake()]),
        Arc::new(SchemaValidator),
        Arc::new(AcceptAllUploads::new("https://uploads.test")),
        Arc::new(AllowAllReviewers),
    ));
    let delivery = Arc::new(
        DeliveryManager::new(
            engine.clone(),
            store.clone() as Arc<dyn SubmissionStore>,
            DeliveryConfig::default(),
        )
        .unwrap(),
    );
    // A per-test recorder; the global one can only be installed once per process.
    let metrics = PrometheusBuilder::new().build_recorder().handle();

    let app = build_router(AppState {
        engine,
        delivery,
        store,
        metrics,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base,
        client: reqwest::Client::new(),
    }
}

fn agent() -> Value {
    json!({ "kind": "agent", "id": "bot-1" })
}

async fn create_submission(app: &TestApp, body: Value) -> (reqwest::StatusCode, Value) {
    let response = app
        .client
        .post(app.url("/intakes/vendor-onboarding/submissions"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

// ============================================================================
// Lifecycle over HTTP
// ============================================================================

#[tokio::test]
async fn test_health_endpoint_reports_healthy() {
    let app = spawn_app().await;
    let response = app.client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_create_then_replay_with_same_key() {
    let app = spawn_app().await;
    let body = json!({
        "actor": agent(),
        "idempotencyKey": "create-1",
        "fields": { "companyName": "Acme" },
    });

    let (status, first) = create_submission(&app, body.clone()).await;
    assert_eq!(status, reqwest::StatusCode::CREATED);
    assert_eq!(first["ok"], true);
    assert_eq!(first["state"], "in_progress");
    assert!(!first["resumeToken"].as_str().unwrap().is_empty());

    let (status, replay) = create_submission(&app, body).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(replay["submissionId"], first["submissionId"]);
    assert_eq!(replay["resumeToken"], first["resumeToken"]);
}

#[tokio::test]
async fn test_stale_token_answers_conflict_with_current_token() {
    let app = spawn_app().await;
    let (_, created) = create_submission(&app, json!({ "actor": agent() })).await;
    let id = created["submissionId"].as_str().unwrap().to_string();
    let stale = created["resumeToken"].as_str().unwrap().to_string();

    // Rotate the token with a legal edit.
    let response = app
        .client
        .patch(app.url(&format!("/submissions/{}/fields", id)))
        .json(&json!({
            "resumeToken": stale,
            "actor": agent(),
            "fields": { "companyName": "Acme" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let edited: Value = response.json().await.unwrap();
    let current = edited["resumeToken"].as_str().unwrap();

    // The stale token is now rejected, and the envelope carries the
    // current one so the caller can resynchronize.
    let response = app
        .client
        .patch(app.url(&format!("/submissions/{}/fields", id)))
        .json(&json!({
            "resumeToken": stale,
            "actor": agent(),
            "fields": { "companyName": "Other" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    let envelope: Value = response.json().await.unwrap();
    assert_eq!(envelope["ok"], false);
    assert_eq!(envelope["error"]["type"], "invalid_resume_token");
    assert_eq!(envelope["error"]["retryable"], true);
    assert_eq!(envelope["resumeToken"], current);
}

#[tokio::test]
async fn test_ungated_submit_is_accepted_and_replayable() {
    let app = spawn_app().await;
    let (_, created) = create_submission(
        &app,
        json!({ "actor": agent(), "fields": { "companyName": "Acme" } }),
    )
    .await;
    let id = created["submissionId"].as_str().unwrap().to_string();

    let body = json!({
        "resumeToken": created["resumeToken"],
        "actor": agent(),
        "idempotencyKey": "submit-1",
    });
    let response = app
        .client
        .post(app.url(&format!("/submissions/{}/submit", id)))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let first_body = response.text().await.unwrap();
    let first: Value = serde_json::from_str(&first_body).unwrap();
    assert_eq!(first["state"], "submitted");
    assert_eq!(first["data"]["reviewRequired"], false);

    // The replay answers from the ledger, stale token and all, and the
    // response body is byte-identical to the first one.
    let response = app
        .client
        .post(app.url(&format!("/submissions/{}/submit", id)))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let replay_body = response.text().await.unwrap();
    assert_eq!(replay_body, first_body);

    // This intake configures no destinations, so the listing is empty but
    // still well formed.
    let response = app
        .client
        .get(app.url(&format!("/submissions/{}/deliveries", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let listing: Value = response.json().await.unwrap();
    assert!(listing["data"].is_array());
}

#[tokio::test]
async fn test_failed_submit_returns_and_replays_the_error_envelope() {
    let app = spawn_app().await;
    // Required field never supplied.
    let (_, created) = create_submission(&app, json!({ "actor": agent() })).await;
    let id = created["submissionId"].as_str().unwrap().to_string();

    let body = json!({
        "resumeToken": created["resumeToken"],
        "actor": agent(),
        "idempotencyKey": "submit-1",
    });
    let response = app
        .client
        .post(app.url(&format!("/submissions/{}/submit", id)))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let envelope: Value = response.json().await.unwrap();
    assert_eq!(envelope["ok"], false);
    assert_eq!(envelope["error"]["type"], "missing");
    assert_eq!(envelope["error"]["fields"][0]["path"], "companyName");

    // The cached rejection comes back verbatim with its original status.
    let response = app
        .client
        .post(app.url(&format!("/submissions/{}/submit", id)))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let replayed: Value = response.json().await.unwrap();
    assert_eq!(replayed["error"]["type"], "missing");
}

#[tokio::test]
async fn test_unknown_submission_is_not_found() {
    let app = spawn_app().await;
    let response = app
        .client
        .get(app.url(&format!("/submissions/{}", uuid::Uuid::new_v4())))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let envelope: Value = response.json().await.unwrap();
    assert_eq!(envelope["ok"], false);
    assert_eq!(envelope["error"]["type"], "not_found");
}

#[tokio::test]
async fn test_cancel_via_delete_then_further_edits_conflict() {
    let app = spawn_app().await;
    let (_, created) = create_submission(&app, json!({ "actor": agent() })).await;
    let id = created["submissionId"].as_str().unwrap().to_string();

    let response = app
        .client
        .delete(app.url(&format!("/submissions/{}", id)))
        .json(&json!({
            "resumeToken": created["resumeToken"],
            "actor": { "kind": "human", "id": "requester-1" },
            "reason": "duplicate request",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let cancelled: Value = response.json().await.unwrap();
    assert_eq!(cancelled["state"], "cancelled");

    let response = app
        .client
        .patch(app.url(&format!("/submissions/{}/fields", id)))
        .json(&json!({
            "resumeToken": cancelled["resumeToken"],
            "actor": agent(),
            "fields": { "companyName": "Acme" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let envelope: Value = response.json().await.unwrap();
    assert_eq!(envelope["error"]["type"], "cancelled");
    assert_eq!(envelope["error"]["retryable"], false);
}

// ============================================================================
// Event Log over HTTP
// ============================================================================

#[tokio::test]
async fn test_event_listing_filters_and_ndjson_export() {
    let app = spawn_app().await;
    let (_, created) = create_submission(&app, json!({ "actor": agent() })).await;
    let id = created["submissionId"].as_str().unwrap().to_string();

    let response = app
        .client
        .patch(app.url(&format!("/submissions/{}/fields", id)))
        .json(&json!({
            "resumeToken": created["resumeToken"],
            "actor": agent(),
            "fields": { "companyName": "Acme" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = app
        .client
        .get(app.url(&format!(
            "/submissions/{}/events?types=field.updated",
            id
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let page: Value = response.json().await.unwrap();
    assert_eq!(page["data"]["total"], 1);
    assert_eq!(page["data"]["events"].as_array().unwrap().len(), 1);

    let response = app
        .client
        .get(app.url(&format!(
            "/submissions/{}/events/export?format=ndjson",
            id
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .unwrap(),
        "application/x-ndjson"
    );
    let body = response.text().await.unwrap();
    assert_eq!(body.lines().count(), 2);

    // Unknown export formats are rejected.
    let response = app
        .client
        .get(app.url(&format!(
            "/submissions/{}/events/export?format=csv",
            id
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_endpoint_renders() {
    let app = spawn_app().await;
    let response = app.client.get(app.url("/metrics")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}
