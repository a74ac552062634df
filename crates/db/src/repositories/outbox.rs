use async_trait::async_trait;
use leavegate_core::chrono::{DateTime, Utc};
use leavegate_core::domain::outcome::OutcomeEvent;
use leavegate_core::outbox::{OutcomeOutbox, PendingDelivery};
use leavegate_core::store::StoreError;
use sqlx::{sqlite::SqliteRow, Row};

use super::{format_timestamp, parse_timestamp, parse_u32, parse_u64, RepositoryError};
use crate::DbPool;

pub struct SqlOutcomeOutbox {
    pool: DbPool,
}

impl SqlOutcomeOutbox {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, delivery: &PendingDelivery) -> Result<(), RepositoryError> {
        let outcome_json = serde_json::to_string(&delivery.outcome).map_err(|error| {
            RepositoryError::Decode(format!("outcome is not serializable: {error}"))
        })?;

        sqlx::query(
            "INSERT INTO outcome_outbox (
                id, publisher, request_id, employee_id, outcome_json,
                attempts, last_error, next_attempt_at, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                last_error = excluded.last_error,
                next_attempt_at = excluded.next_attempt_at",
        )
        .bind(&delivery.id)
        .bind(&delivery.publisher)
        .bind(delivery.outcome.request_id.as_str())
        .bind(delivery.outcome.employee_id.as_str())
        .bind(outcome_json)
        .bind(i64::from(delivery.attempts.max(1)))
        .bind(&delivery.last_error)
        .bind(format_timestamp(&delivery.next_attempt_at))
        .bind(format_timestamp(&delivery.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PendingDelivery>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id, publisher, outcome_json, attempts, last_error, next_attempt_at, created_at
             FROM outcome_outbox
             WHERE next_attempt_at <= ?
             ORDER BY next_attempt_at ASC, id ASC
             LIMIT ?",
        )
        .bind(format_timestamp(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(delivery_from_row).collect()
    }

    async fn update_schedule(
        &self,
        id: &str,
        attempts: u32,
        last_error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE outcome_outbox
             SET attempts = ?, last_error = ?, next_attempt_at = ?
             WHERE id = ?",
        )
        .bind(i64::from(attempts.max(1)))
        .bind(last_error)
        .bind(format_timestamp(&next_attempt_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM outcome_outbox WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outcome_outbox")
            .fetch_one(&self.pool)
            .await?;
        parse_u64("count", count)
    }
}

#[async_trait]
impl OutcomeOutbox for SqlOutcomeOutbox {
    async fn enqueue(&self, delivery: PendingDelivery) -> Result<(), StoreError> {
        Ok(self.insert(&delivery).await?)
    }

    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<PendingDelivery>, StoreError> {
        Ok(self.select_due(now, limit).await?)
    }

    async fn reschedule(
        &self,
        id: &str,
        attempts: u32,
        last_error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(self.update_schedule(id, attempts, last_error, next_attempt_at).await?)
    }

    async fn complete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.delete(id).await?)
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        Ok(self.count().await?)
    }
}

fn delivery_from_row(row: &SqliteRow) -> Result<PendingDelivery, RepositoryError> {
    let outcome_json: String = row.try_get("outcome_json")?;
    let outcome = serde_json::from_str::<OutcomeEvent>(&outcome_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid `outcome_json`: {error}")))?;

    Ok(PendingDelivery {
        id: row.try_get("id")?,
        publisher: row.try_get("publisher")?,
        outcome,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        last_error: row.try_get("last_error")?,
        next_attempt_at: parse_timestamp("next_attempt_at", row.try_get("next_attempt_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
