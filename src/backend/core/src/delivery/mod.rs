//! Webhook delivery manager.
//!
//! A scheduler loop periodically scans for due delivery records and
//! dispatches attempts with bounded cross-record concurrency. Attempts for
//! one record are serialized: a record is never dispatched while a previous
//! attempt for it is still in flight. Automatic retries and manual retries
//! both go through the transition functions on [`DeliveryRecord`], so the
//! two paths cannot diverge in what they reset.

pub mod signer;

use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::engine::SubmissionEngine;
use crate::error::{ErrorCode, IntakeError, Result};
use crate::model::{DeliveryId, DeliveryRecord, RetryPolicy, Submission};
use crate::store::SubmissionStore;

/// Owns the scheduler loop, the outbound HTTP client, and manual retry.
pub struct DeliveryManager {
    engine: Arc<SubmissionEngine>,
    store: Arc<dyn SubmissionStore>,
    client: reqwest::Client,
    policy: RetryPolicy,
    config: DeliveryConfig,
    semaphore: Arc<Semaphore>,
    /// Records with an attempt currently in flight.
    in_flight: Mutex<HashSet<DeliveryId>>,
    shutdown: watch::Sender<bool>,
}

impl DeliveryManager {
    pub fn new(
        engine: Arc<SubmissionEngine>,
        store: Arc<dyn SubmissionStore>,
        config: DeliveryConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IntakeError::internal(format!("failed to build http client: {}", e)))?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            engine,
            store,
            client,
            policy: config.retry_policy(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            in_flight: Mutex::new(HashSet::new()),
            shutdown,
        })
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.shutdown.subscribe();
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            poll_interval = ?self.config.poll_interval,
            max_concurrency = self.config.max_concurrency,
            "delivery scheduler started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.clone().dispatch_due().await {
                        warn!(error = %e, "delivery scan failed");
                    }
                }
                _ = rx.changed() => {
                    if *rx.borrow() {
                        info!("delivery scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Stop the scheduler loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Scan for due records and dispatch each on its own task.
    async fn dispatch_due(self: Arc<Self>) -> Result<()> {
        let due = self
            .store
            .due_deliveries(Utc::now(), self.config.batch_size)
            .await?;

        for record in due {
            if !self.in_flight.lock().insert(record.id) {
                continue;
            }
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let manager = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let id = record.id;
                if let Err(e) = manager.attempt(record).await {
                    warn!(delivery_id = %id, error = %e, "delivery attempt errored");
                }
                manager.in_flight.lock().remove(&id);
            });
        }
        Ok(())
    }

    /// One signed delivery attempt for a record.
    ///
    /// Checks the owning submission is still deliverable first; a
    /// cancelled or expired submission abandons the record without
    /// attempting.
    pub async fn attempt(&self, mut record: DeliveryRecord) -> Result<()> {
        let Some(submission) = self.engine.delivery_target(record.submission_id).await? else {
            debug!(delivery_id = %record.id, "owning submission no longer deliverable, abandoning");
            record.status = crate::model::DeliveryStatus::Failed;
            record.next_retry_at = None;
            record.last_error = Some("submission is no longer deliverable".to_string());
            self.store.update_delivery(&record).await?;
            counter!("intake_deliveries_total", "outcome" => "abandoned").increment(1);
            return Ok(());
        };

        let Some(secret) = self.destination_secret(&submission, &record) else {
            warn!(
                delivery_id = %record.id,
                destination = %record.destination_url,
                "destination no longer configured, abandoning"
            );
            record.status = crate::model::DeliveryStatus::Failed;
            record.next_retry_at = None;
            record.last_error = Some("destination is no longer configured".to_string());
            self.store.update_delivery(&record).await?;
            counter!("intake_deliveries_total", "outcome" => "abandoned").increment(1);
            return Ok(());
        };

        self.engine.note_delivery_attempt(&record).await?;
        counter!("intake_delivery_attempts_total").increment(1);

        let body = serde_json::to_vec(&delivery_payload(&submission))?;
        let signature = signer::sign(&secret, &body);
        let timestamp = Utc::now().to_rfc3339();

        let outcome = self
            .client
            .post(&record.destination_url)
            .header(signer::SIGNATURE_HEADER, signature)
            .header(signer::TIMESTAMP_HEADER, timestamp)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;

        let now = Utc::now();
        match outcome {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                record.record_success(now, status);
                self.store.update_delivery(&record).await?;
                counter!("intake_deliveries_total", "outcome" => "succeeded").increment(1);
                info!(
                    delivery_id = %record.id,
                    submission_id = %record.submission_id,
                    status,
                    "delivery succeeded"
                );
                self.engine.record_delivery_success(&record, status).await?;
            }
            Ok(response) => {
                let status = response.status().as_u16();
                record.record_failure(
                    now,
                    Some(status),
                    format!("destination returned {}", status),
                    &self.policy,
                );
                self.store.update_delivery(&record).await?;
                counter!("intake_deliveries_total", "outcome" => "failed").increment(1);
                warn!(
                    delivery_id = %record.id,
                    status,
                    attempts = record.attempts,
                    next_retry_at = ?record.next_retry_at,
                    "delivery failed"
                );
                self.engine.record_delivery_failure(&record).await?;
            }
            // timeouts and connect errors are failures like any non-2xx
            Err(e) => {
                record.record_failure(now, None, e.to_string(), &self.policy);
                self.store.update_delivery(&record).await?;
                counter!("intake_deliveries_total", "outcome" => "failed").increment(1);
                warn!(
                    delivery_id = %record.id,
                    error = %e,
                    attempts = record.attempts,
                    next_retry_at = ?record.next_retry_at,
                    "delivery errored"
                );
                self.engine.record_delivery_failure(&record).await?;
            }
        }
        Ok(())
    }

    /// Reset a failed record and re-enter the automatic retry cycle.
    /// Rejected with `conflict` unless the record's status is `failed`.
    pub async fn manual_retry(&self, id: DeliveryId) -> Result<DeliveryRecord> {
        let mut record = self
            .store
            .get_delivery(id)
            .await?
            .ok_or_else(|| IntakeError::not_found("delivery", id))?;

        if !record.reset_for_manual_retry() {
            return Err(IntakeError::new(
                ErrorCode::Conflict,
                "Only failed deliveries can be retried manually",
            ));
        }
        self.store.update_delivery(&record).await?;
        counter!("intake_deliveries_total", "outcome" => "manual_retry").increment(1);
        info!(delivery_id = %id, "delivery manually rescheduled");
        self.engine.note_delivery_rescheduled(&record).await?;
        Ok(record)
    }

    fn destination_secret(&self, submission: &Submission, record: &DeliveryRecord) -> Option<String> {
        self.engine
            .registry()
            .get(&submission.intake_id)
            .ok()?
            .destinations
            .iter()
            .find(|d| d.url == record.destination_url)
            .map(|d| d.secret.clone())
    }
}

/// The outbound payload for a destination.
///
/// Built explicitly rather than serializing the record so the resume token
/// can never ride along.
fn delivery_payload(submission: &Submission) -> serde_json::Value {
    json!({
        "submissionId": submission.id,
        "intakeId": submission.intake_id,
        "state": submission.state,
        "fields": submission.fields,
        "attribution": submission.attribution,
        "createdBy": submission.created_by,
        "createdAt": submission.created_at,
        "updatedAt": submission.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Actor;

    #[test]
    fn test_delivery_payload_never_contains_token() {
        let submission = Submission::new(
            "vendor-onboarding",
            Actor::agent("bot-1"),
            "super-secret-token".to_string(),
            None,
            None,
        );
        let payload = delivery_payload(&submission);
        let rendered = payload.to_string();
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("resumeToken"));
        assert_eq!(payload["intakeId"], "vendor-onboarding");
    }
}
