//! Intake definitions.
//!
//! An intake is a named data-collection template: the field schema handed to
//! the external validator, zero or more approval gates, and the destinations
//! finalized submissions are delivered to.

use serde::{Deserialize, Serialize};

/// Kind of a declared field, as far as the engine needs to know.
///
/// Full schema semantics (formats, nested shapes) belong to the external
/// validator; the engine only distinguishes file fields because pending
/// uploads park the submission in `awaiting_upload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Boolean,
    File,
}

impl Default for FieldKind {
    fn default() -> Self {
        Self::Text
    }
}

/// One declared field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub kind: FieldKind,
}

/// The field schema for an intake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl FieldSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A human review checkpoint required before finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalGate {
    pub name: String,
    /// Approvals needed before the gate passes.
    #[serde(default = "default_required_approvals")]
    pub required_approvals: u32,
    /// Recorded for an external escalation scheduler; no timer runs here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalate_after_ms: Option<u64>,
}

fn default_required_approvals() -> u32 {
    1
}

/// External endpoint a finalized submission is delivered to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub url: String,
    /// Shared secret for HMAC signing of outbound payloads.
    pub secret: String,
}

/// A named data-collection template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeDefinition {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub schema: FieldSchema,
    #[serde(default)]
    pub gates: Vec<ApprovalGate>,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    /// Submissions expire this long after creation, if set.
    #[serde(default, with = "humantime_serde::option")]
    pub submission_ttl: Option<std::time::Duration>,
}

impl IntakeDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            schema: FieldSchema::default(),
            gates: Vec::new(),
            destinations: Vec::new(),
            submission_ttl: None,
        }
    }

    pub fn with_schema(mut self, schema: FieldSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_gate(mut self, gate: ApprovalGate) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn with_destination(mut self, url: impl Into<String>, secret: impl Into<String>) -> Self {
        self.destinations.push(Destination {
            url: url.into(),
            secret: secret.into(),
        });
        self
    }

    pub fn with_submission_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.submission_ttl = Some(ttl);
        self
    }
}
