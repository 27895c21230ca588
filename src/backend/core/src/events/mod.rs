//! Event log read and export APIs.
//!
//! Reads are always ordered by ascending version and support filtering by
//! event type, actor kind, and time window with offset/limit pagination and
//! a total count. Every event leaving the engine through these APIs passes
//! through [`redact_payload`] first: resume tokens must never leak through
//! audit endpoints.

mod query;

pub use query::{EventFilter, EventPage, EventQuery, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

use crate::model::SubmissionEvent;

/// Payload keys that are stripped before an event is returned.
const REDACTED_KEYS: &[&str] = &["resumeToken", "resume_token"];

/// Strip resume-token keys from a payload, recursively.
pub fn redact_payload(payload: &mut serde_json::Value) {
    match payload {
        serde_json::Value::Object(map) => {
            for key in REDACTED_KEYS {
                map.remove(*key);
            }
            for value in map.values_mut() {
                redact_payload(value);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                redact_payload(item);
            }
        }
        _ => {}
    }
}

/// Return a copy of the event safe to expose through read/export APIs.
pub fn redact_event(event: &SubmissionEvent) -> SubmissionEvent {
    let mut redacted = event.clone();
    redact_payload(&mut redacted.payload);
    redacted
}

/// Serialize events as newline-delimited JSON, one event object per line,
/// preserving version order.
pub fn export_ndjson(events: &[SubmissionEvent]) -> crate::error::Result<String> {
    let mut out = String::new();
    for event in events {
        out.push_str(&serde_json::to_string(event)?);
        out.push('\n');
    }
    Ok(out)
}
