//! PostgreSQL store.
//!
//! Every multi-row step runs inside one transaction. The commit primitive is
//! an `UPDATE ... WHERE resume_token = $expected AND version = $expected`;
//! zero rows affected means another writer got there first and the whole
//! transaction rolls back untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{IntakeError, Result};
use crate::model::{
    Actor, DeliveryId, DeliveryRecord, DeliveryStatus, FieldMap, Submission, SubmissionEvent,
    SubmissionId, SubmissionState,
};

use super::{CommitResult, CreateOutcome, CreationKey, SubmissionStore, SubmitIdempotencyEntry};

/// PostgreSQL-backed [`SubmissionStore`] implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32, min_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| IntakeError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SubmissionStore for PgStore {
    async fn insert_submission(
        &self,
        submission: &Submission,
        event: &SubmissionEvent,
        creation_key: Option<&CreationKey>,
    ) -> Result<CreateOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(key) = creation_key {
            // Claim the key with a conflict-free insert so two concurrent
            // creates converge: the loser waits on the winner's row lock,
            // affects zero rows, and replays the winner's submission.
            let claimed = sqlx::query(
                r#"
                INSERT INTO creation_idempotency (intake_id, key, submission_id, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (intake_id, key) DO NOTHING
                "#,
            )
            .bind(&key.intake_id)
            .bind(&key.key)
            .bind(submission.id.0)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            if claimed.rows_affected() == 0 {
                let (submission_id,): (Uuid,) = sqlx::query_as(
                    r#"
                    SELECT submission_id
                    FROM creation_idempotency
                    WHERE intake_id = $1 AND key = $2
                    "#,
                )
                .bind(&key.intake_id)
                .bind(&key.key)
                .fetch_one(&mut *tx)
                .await?;
                return Ok(CreateOutcome::Existing(SubmissionId(submission_id)));
            }
        }

        insert_submission_row(&mut tx, submission).await?;
        insert_event_row(&mut tx, event).await?;

        tx.commit().await?;
        Ok(CreateOutcome::Created)
    }

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>> {
        let row: Option<SubmissionRow> = sqlx::query_as(
            r#"
            SELECT id, intake_id, state, resume_token, version, idempotency_key,
                   fields, attribution, created_by, created_at, updated_at, expires_at
            FROM submissions
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Submission::try_from).transpose()
    }

    async fn commit(
        &self,
        expected_token: &str,
        expected_version: u64,
        submission: &Submission,
        event: &SubmissionEvent,
        submit_entry: Option<&SubmitIdempotencyEntry>,
    ) -> Result<CommitResult> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE submissions
            SET state = $2, resume_token = $3, version = $4, fields = $5,
                attribution = $6, updated_at = $7, expires_at = $8
            WHERE id = $1 AND resume_token = $9 AND version = $10
            "#,
        )
        .bind(submission.id.0)
        .bind(submission.state.as_str())
        .bind(&submission.resume_token)
        .bind(submission.version as i64)
        .bind(serde_json::to_value(&submission.fields)?)
        .bind(serde_json::to_value(&submission.attribution)?)
        .bind(submission.updated_at)
        .bind(submission.expires_at)
        .bind(expected_token)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(CommitResult::Stale);
        }

        insert_event_row(&mut tx, event).await?;

        if let Some(entry) = submit_entry {
            sqlx::query(
                r#"
                INSERT INTO submit_idempotency (submission_id, key, payload_hash, response, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(entry.submission_id.0)
            .bind(&entry.key)
            .bind(&entry.payload_hash)
            .bind(&entry.response)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(CommitResult::Applied)
    }

    async fn events_for(&self, id: SubmissionId) -> Result<Vec<SubmissionEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, event_type, submission_id, occurred_at, actor,
                   resulting_state, version, payload
            FROM submission_events
            WHERE submission_id = $1
            ORDER BY version
            "#,
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubmissionEvent::try_from).collect()
    }

    async fn get_submit_entry(
        &self,
        submission_id: SubmissionId,
        key: &str,
    ) -> Result<Option<SubmitIdempotencyEntry>> {
        let row: Option<SubmitEntryRow> = sqlx::query_as(
            r#"
            SELECT submission_id, key, payload_hash, response, created_at
            FROM submit_idempotency
            WHERE submission_id = $1 AND key = $2
            "#,
        )
        .bind(submission_id.0)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SubmitIdempotencyEntry::from))
    }

    async fn insert_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deliveries (id, submission_id, destination_url, status, attempts,
                                    last_attempt_at, next_retry_at, last_status_code,
                                    last_error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id.0)
        .bind(record.submission_id.0)
        .bind(&record.destination_url)
        .bind(record.status.to_string())
        .bind(record.attempts as i32)
        .bind(record.last_attempt_at)
        .bind(record.next_retry_at)
        .bind(record.last_status_code.map(|c| c as i32))
        .bind(&record.last_error)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        let row: Option<DeliveryRow> = sqlx::query_as(
            r#"
            SELECT id, submission_id, destination_url, status, attempts,
                   last_attempt_at, next_retry_at, last_status_code, last_error, created_at
            FROM deliveries
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeliveryRecord::try_from).transpose()
    }

    async fn update_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = $2, attempts = $3, last_attempt_at = $4, next_retry_at = $5,
                last_status_code = $6, last_error = $7
            WHERE id = $1
            "#,
        )
        .bind(record.id.0)
        .bind(record.status.to_string())
        .bind(record.attempts as i32)
        .bind(record.last_attempt_at)
        .bind(record.next_retry_at)
        .bind(record.last_status_code.map(|c| c as i32))
        .bind(&record.last_error)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(IntakeError::not_found("delivery", record.id));
        }
        Ok(())
    }

    async fn deliveries_for(&self, submission_id: SubmissionId) -> Result<Vec<DeliveryRecord>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            r#"
            SELECT id, submission_id, destination_url, status, attempts,
                   last_attempt_at, next_retry_at, last_status_code, last_error, created_at
            FROM deliveries
            WHERE submission_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(submission_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryRecord::try_from).collect()
    }

    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            r#"
            SELECT id, submission_id, destination_url, status, attempts,
                   last_attempt_at, next_retry_at, last_status_code, last_error, created_at
            FROM deliveries
            WHERE (status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1))
               OR (status = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= $1)
            ORDER BY COALESCE(next_retry_at, created_at)
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryRecord::try_from).collect()
    }

    async fn prune_idempotency(&self, submission_id: SubmissionId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM submit_idempotency WHERE submission_id = $1")
            .bind(submission_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM creation_idempotency WHERE submission_id = $1")
            .bind(submission_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn insert_submission_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    submission: &Submission,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO submissions (id, intake_id, state, resume_token, version, idempotency_key,
                                 fields, attribution, created_by, created_at, updated_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(submission.id.0)
    .bind(&submission.intake_id)
    .bind(submission.state.as_str())
    .bind(&submission.resume_token)
    .bind(submission.version as i64)
    .bind(&submission.idempotency_key)
    .bind(serde_json::to_value(&submission.fields)?)
    .bind(serde_json::to_value(&submission.attribution)?)
    .bind(serde_json::to_value(&submission.created_by)?)
    .bind(submission.created_at)
    .bind(submission.updated_at)
    .bind(submission.expires_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_event_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &SubmissionEvent,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO submission_events (id, event_type, submission_id, occurred_at, actor,
                                       resulting_state, version, payload)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(event.id.0)
    .bind(event.event_type.as_str())
    .bind(event.submission_id.0)
    .bind(event.timestamp)
    .bind(serde_json::to_value(&event.actor)?)
    .bind(event.resulting_state.as_str())
    .bind(event.version as i64)
    .bind(&event.payload)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types (for sqlx queries)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct SubmissionRow {
    id: Uuid,
    intake_id: String,
    state: String,
    resume_token: String,
    version: i64,
    idempotency_key: Option<String>,
    fields: serde_json::Value,
    attribution: serde_json::Value,
    created_by: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = IntakeError;

    fn try_from(row: SubmissionRow) -> Result<Self> {
        Ok(Self {
            id: SubmissionId(row.id),
            intake_id: row.intake_id,
            state: parse_state(&row.state)?,
            resume_token: row.resume_token,
            version: row.version as u64,
            idempotency_key: row.idempotency_key,
            fields: serde_json::from_value::<FieldMap>(row.fields)?,
            attribution: serde_json::from_value(row.attribution)?,
            created_by: serde_json::from_value::<Actor>(row.created_by)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    event_type: String,
    submission_id: Uuid,
    occurred_at: DateTime<Utc>,
    actor: serde_json::Value,
    resulting_state: String,
    version: i64,
    payload: serde_json::Value,
}

impl TryFrom<EventRow> for SubmissionEvent {
    type Error = IntakeError;

    fn try_from(row: EventRow) -> Result<Self> {
        let event_type = crate::model::EventType::parse(&row.event_type).ok_or_else(|| {
            IntakeError::storage(format!("unknown event type in store: {}", row.event_type))
        })?;

        Ok(Self {
            id: crate::model::EventId(row.id),
            event_type,
            submission_id: SubmissionId(row.submission_id),
            timestamp: row.occurred_at,
            actor: serde_json::from_value(row.actor)?,
            resulting_state: parse_state(&row.resulting_state)?,
            version: row.version as u64,
            payload: row.payload,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubmitEntryRow {
    submission_id: Uuid,
    key: String,
    payload_hash: String,
    response: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<SubmitEntryRow> for SubmitIdempotencyEntry {
    fn from(row: SubmitEntryRow) -> Self {
        Self {
            submission_id: SubmissionId(row.submission_id),
            key: row.key,
            payload_hash: row.payload_hash,
            response: row.response,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    submission_id: Uuid,
    destination_url: String,
    status: String,
    attempts: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    last_status_code: Option<i32>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for DeliveryRecord {
    type Error = IntakeError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        let status: DeliveryStatus =
            serde_json::from_value(serde_json::Value::String(row.status.clone())).map_err(
                |_| IntakeError::storage(format!("unknown delivery status in store: {}", row.status)),
            )?;

        Ok(Self {
            id: DeliveryId(row.id),
            submission_id: SubmissionId(row.submission_id),
            destination_url: row.destination_url,
            status,
            attempts: row.attempts as u32,
            last_attempt_at: row.last_attempt_at,
            next_retry_at: row.next_retry_at,
            last_status_code: row.last_status_code.map(|c| c as u16),
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

fn parse_state(s: &str) -> Result<SubmissionState> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| IntakeError::storage(format!("unknown submission state in store: {}", s)))
}
