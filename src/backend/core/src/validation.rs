//! External collaborator contracts.
//!
//! The engine does not decide how fields are validated, how uploads are
//! stored, or who may review — it consumes these contracts and reacts to
//! their results. [`SchemaValidator`] is the minimal schema-driven validator
//! used for wiring and tests; real deployments inject their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FieldIssue;
use crate::model::{Actor, ApprovalGate, FieldKind, FieldMap, FieldSchema};

// ═══════════════════════════════════════════════════════════════════════════════
// Validator
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of validating a field map against an intake schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// True when the submission is complete enough to proceed.
    pub ready: bool,
    /// Required fields not yet supplied.
    pub missing: Vec<FieldIssue>,
    /// Supplied fields that failed validation.
    pub invalid: Vec<FieldIssue>,
    /// File fields awaiting upload confirmation.
    pub pending_uploads: Vec<String>,
}

impl ValidationReport {
    pub fn passed() -> Self {
        Self {
            ready: true,
            ..Default::default()
        }
    }

    pub fn has_problems(&self) -> bool {
        !self.missing.is_empty() || !self.invalid.is_empty() || !self.pending_uploads.is_empty()
    }
}

/// Decides whether a field map satisfies an intake schema.
///
/// Potentially CPU-bound but not assumed to block on I/O, so the contract
/// is synchronous.
pub trait Validator: Send + Sync {
    fn validate(&self, fields: &FieldMap, schema: &FieldSchema) -> ValidationReport;
}

/// Minimal schema-driven validator: required-field presence, primitive type
/// checks, and upload confirmation for file fields.
#[derive(Debug, Default, Clone)]
pub struct SchemaValidator;

impl SchemaValidator {
    /// File field values carry `{ "uploadId": ..., "verified": bool }`;
    /// unverified uploads park the submission in `awaiting_upload`.
    fn file_verified(value: &serde_json::Value) -> bool {
        value
            .get("verified")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    fn type_matches(kind: FieldKind, value: &serde_json::Value) -> bool {
        match kind {
            FieldKind::Text => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::File => value.is_object(),
        }
    }

    fn expected_type(kind: FieldKind) -> &'static str {
        match kind {
            FieldKind::Text => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::File => "upload object",
        }
    }
}

impl Validator for SchemaValidator {
    fn validate(&self, fields: &FieldMap, schema: &FieldSchema) -> ValidationReport {
        let mut report = ValidationReport::default();

        for spec in &schema.fields {
            match fields.get(&spec.name) {
                None | Some(serde_json::Value::Null) => {
                    if spec.required {
                        report.missing.push(FieldIssue::new(
                            &spec.name,
                            "required",
                            format!("Field {} is required", spec.name),
                        ));
                    }
                }
                Some(value) => {
                    if !Self::type_matches(spec.kind, value) {
                        report.invalid.push(
                            FieldIssue::new(
                                &spec.name,
                                "type_mismatch",
                                format!("Field {} has the wrong type", spec.name),
                            )
                            .with_expected(Self::expected_type(spec.kind))
                            .with_received(json_type_name(value)),
                        );
                    } else if spec.kind == FieldKind::File && !Self::file_verified(value) {
                        report.pending_uploads.push(spec.name.clone());
                    }
                }
            }
        }

        report.ready = !report.has_problems();
        report
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Upload Storage
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata for negotiating an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMeta {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// Storage backend that issues signed upload URLs. Contract only; the
/// engine never handles file bytes.
#[async_trait]
pub trait UploadStorage: Send + Sync {
    async fn negotiate_upload(&self, meta: &UploadMeta) -> crate::error::Result<String>;
    async fn confirm_upload(&self, upload_id: &str) -> crate::error::Result<bool>;
}

/// Upload backend used for wiring and tests: issues opaque URLs under a
/// base prefix and confirms every upload. Real deployments inject an
/// object-store-backed implementation.
#[derive(Debug, Clone)]
pub struct AcceptAllUploads {
    base_url: String,
}

impl AcceptAllUploads {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl UploadStorage for AcceptAllUploads {
    async fn negotiate_upload(&self, _meta: &UploadMeta) -> crate::error::Result<String> {
        Ok(format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            uuid::Uuid::new_v4()
        ))
    }

    async fn confirm_upload(&self, _upload_id: &str) -> crate::error::Result<bool> {
        Ok(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reviewer Authorization
// ═══════════════════════════════════════════════════════════════════════════════

/// Decides whether an actor may review against a gate. The engine records
/// the actor on every review event but delegates the decision.
pub trait ReviewerAuthorization: Send + Sync {
    fn is_authorized_reviewer(&self, actor: &Actor, gate: &ApprovalGate) -> bool;
}

/// Permissive default used for wiring and tests.
#[derive(Debug, Default, Clone)]
pub struct AllowAllReviewers;

impl ReviewerAuthorization for AllowAllReviewers {
    fn is_authorized_reviewer(&self, _actor: &Actor, _gate: &ApprovalGate) -> bool {
        true
    }
}
