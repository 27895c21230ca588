//! Outbound delivery records.
//!
//! One record tracks one destination's attempt cycle for a submission. The
//! attempt transitions live here, on the record, so the scheduler loop and
//! the manual retry endpoint cannot diverge in what they mutate.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::SubmissionId;

/// Unique identifier for a delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for the first attempt.
    Pending,
    /// A 2xx response was received; no further attempts.
    Succeeded,
    /// Last attempt failed; retried automatically while `next_retry_at`
    /// is set, otherwise only by explicit manual retry.
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Retry/backoff configuration for delivery attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum automatic retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt given the number of attempts made.
    ///
    /// `min(initial_delay_ms * multiplier^(attempts-1), max_delay_ms)`.
    pub fn delay_after_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let delay =
            (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(exponent as i32);
        let capped = delay.min(self.max_delay_ms as f64) as i64;
        Duration::milliseconds(capped)
    }

    /// Whether another automatic attempt remains after `attempts` failures.
    pub fn retries_remaining(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}

/// One destination's outbound attempt record for a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    pub submission_id: SubmissionId,
    pub destination_url: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Create a pending record, due immediately.
    pub fn new(submission_id: SubmissionId, destination_url: impl Into<String>) -> Self {
        Self {
            id: DeliveryId::new(),
            submission_id,
            destination_url: destination_url.into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            last_status_code: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the scheduler should dispatch this record now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            DeliveryStatus::Pending => {
                self.next_retry_at.map(|at| at <= now).unwrap_or(true)
            }
            DeliveryStatus::Failed => {
                self.next_retry_at.map(|at| at <= now).unwrap_or(false)
            }
            DeliveryStatus::Succeeded => false,
        }
    }

    /// Record a successful attempt. Terminal; no further attempts.
    pub fn record_success(&mut self, now: DateTime<Utc>, status_code: u16) {
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.last_status_code = Some(status_code);
        self.last_error = None;
        self.next_retry_at = None;
        self.status = DeliveryStatus::Succeeded;
    }

    /// Record a failed attempt (non-2xx, network error, or timeout).
    ///
    /// Schedules the next automatic retry per `policy` while retries remain;
    /// after the last one, `next_retry_at` is cleared so nothing automatic
    /// is left and only a manual retry can re-enter the cycle.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        status_code: Option<u16>,
        error: impl Into<String>,
        policy: &RetryPolicy,
    ) {
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.last_status_code = status_code;
        self.last_error = Some(error.into());
        self.status = DeliveryStatus::Failed;
        self.next_retry_at = if policy.retries_remaining(self.attempts) {
            Some(now + policy.delay_after_attempt(self.attempts))
        } else {
            None
        };
    }

    /// Reset for a manual retry: attempts back to zero, error and schedule
    /// cleared, status back to pending. Identity fields are untouched.
    ///
    /// Only legal from `failed`; the caller maps the `false` case to a
    /// conflict error.
    pub fn reset_for_manual_retry(&mut self) -> bool {
        if self.status != DeliveryStatus::Failed {
            return false;
        }
        self.status = DeliveryStatus::Pending;
        self.attempts = 0;
        self.last_attempt_at = None;
        self.next_retry_at = None;
        self.last_status_code = None;
        self.last_error = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let p = policy();
        assert_eq!(p.delay_after_attempt(1).num_milliseconds(), 1_000);
        assert_eq!(p.delay_after_attempt(2).num_milliseconds(), 2_000);
        assert_eq!(p.delay_after_attempt(3).num_milliseconds(), 4_000);
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = RetryPolicy {
            max_retries: 10,
            initial_delay_ms: 1_000,
            backoff_multiplier: 10.0,
            max_delay_ms: 5_000,
        };
        assert_eq!(p.delay_after_attempt(4).num_milliseconds(), 5_000);
    }

    #[test]
    fn test_failure_schedules_then_exhausts() {
        let p = policy();
        let mut record = DeliveryRecord::new(SubmissionId::new(), "https://example.com/hook");
        let now = Utc::now();

        record.record_failure(now, Some(500), "500 Internal Server Error", &p);
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.next_retry_at, Some(now + Duration::milliseconds(1_000)));

        record.record_failure(now, Some(500), "500 Internal Server Error", &p);
        assert_eq!(record.next_retry_at, Some(now + Duration::milliseconds(2_000)));

        record.record_failure(now, Some(500), "500 Internal Server Error", &p);
        assert_eq!(record.next_retry_at, Some(now + Duration::milliseconds(4_000)));

        // Fourth attempt exhausts the budget: nothing automatic remains.
        record.record_failure(now, Some(500), "500 Internal Server Error", &p);
        assert_eq!(record.attempts, 4);
        assert_eq!(record.next_retry_at, None);
        assert!(!record.is_due(now + Duration::days(1)));
    }

    #[test]
    fn test_manual_retry_resets_only_from_failed() {
        let p = policy();
        let mut record = DeliveryRecord::new(SubmissionId::new(), "https://example.com/hook");
        assert!(!record.reset_for_manual_retry());

        let now = Utc::now();
        record.record_failure(now, None, "connection refused", &p);
        let created_at = record.created_at;

        assert!(record.reset_for_manual_retry());
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_none());
        assert!(record.next_retry_at.is_none());
        assert_eq!(record.created_at, created_at);
    }

    #[test]
    fn test_success_is_terminal() {
        let mut record = DeliveryRecord::new(SubmissionId::new(), "https://example.com/hook");
        record.record_success(Utc::now(), 200);
        assert_eq!(record.status, DeliveryStatus::Succeeded);
        assert!(!record.is_due(Utc::now() + Duration::days(1)));
        assert!(!record.reset_for_manual_retry());
    }
}
