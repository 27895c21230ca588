//! Domain model for the submission lifecycle engine.
//!
//! - [`actor`]: agent/human/system identity attached to every action
//! - [`submission`]: the submission record and its state machine states
//! - [`event`]: the closed set of audit event kinds and the event record
//! - [`delivery`]: the outbound delivery record and its attempt transitions
//! - [`intake`]: intake definitions (schema handle, gates, destinations)

mod actor;
mod delivery;
mod event;
mod intake;
mod submission;

pub use actor::{Actor, ActorKind};
pub use delivery::{DeliveryId, DeliveryRecord, DeliveryStatus, RetryPolicy};
pub use event::{EventId, EventType, SubmissionEvent};
pub use intake::{ApprovalGate, Destination, FieldKind, FieldSchema, FieldSpec, IntakeDefinition};
pub use submission::{FieldMap, Submission, SubmissionId, SubmissionState};
