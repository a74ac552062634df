use async_trait::async_trait;
use leavegate_core::chrono::{DateTime, Utc};
use leavegate_core::dead_letter::{DeadLetter, DeadLetterSink};
use leavegate_core::store::StoreError;
use sqlx::{sqlite::SqliteRow, Row};

use super::{
    format_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32, parse_u64, to_i64,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlDeadLetterSink {
    pool: DbPool,
}

impl SqlDeadLetterSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn upsert(&self, letter: &DeadLetter) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO dead_letter (
                id, partition_id, stream_offset, request_id, employee_id, payload,
                error_class, message, attempts, first_failed_at, last_failed_at, resolved_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
             ON CONFLICT(id) DO UPDATE SET
                attempts = dead_letter.attempts + 1,
                error_class = excluded.error_class,
                message = excluded.message,
                last_failed_at = excluded.last_failed_at,
                resolved_at = NULL",
        )
        .bind(&letter.id)
        .bind(letter.partition.map(i64::from))
        .bind(letter.offset.map(|offset| to_i64("stream_offset", offset)).transpose()?)
        .bind(letter.request_id.as_deref())
        .bind(letter.employee_id.as_deref())
        .bind(&letter.payload)
        .bind(&letter.error_class)
        .bind(&letter.message)
        .bind(i64::from(letter.attempts.max(1)))
        .bind(format_timestamp(&letter.first_failed_at))
        .bind(format_timestamp(&letter.last_failed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_resolved(&self, id: &str, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("UPDATE dead_letter SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL")
                .bind(format_timestamp(&at))
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn unresolved(&self, limit: u32) -> Result<Vec<DeadLetter>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id, partition_id, stream_offset, request_id, employee_id, payload,
                error_class, message, attempts, first_failed_at, last_failed_at, resolved_at
             FROM dead_letter
             WHERE resolved_at IS NULL
             ORDER BY first_failed_at ASC, id ASC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(letter_from_row).collect()
    }
}

#[async_trait]
impl DeadLetterSink for SqlDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<(), StoreError> {
        Ok(self.upsert(&letter).await?)
    }

    async fn resolve(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.mark_resolved(id, at).await?)
    }

    async fn list_unresolved(&self, limit: u32) -> Result<Vec<DeadLetter>, StoreError> {
        Ok(self.unresolved(limit).await?)
    }
}

fn letter_from_row(row: &SqliteRow) -> Result<DeadLetter, RepositoryError> {
    let partition = row
        .try_get::<Option<i64>, _>("partition_id")?
        .map(|value| parse_u32("partition_id", value))
        .transpose()?;
    let offset = row
        .try_get::<Option<i64>, _>("stream_offset")?
        .map(|value| parse_u64("stream_offset", value))
        .transpose()?;

    Ok(DeadLetter {
        id: row.try_get("id")?,
        partition,
        offset,
        request_id: row.try_get("request_id")?,
        employee_id: row.try_get("employee_id")?,
        payload: row.try_get("payload")?,
        error_class: row.try_get("error_class")?,
        message: row.try_get("message")?,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        first_failed_at: parse_timestamp("first_failed_at", row.try_get("first_failed_at")?)?,
        last_failed_at: parse_timestamp("last_failed_at", row.try_get("last_failed_at")?)?,
        resolved_at: parse_optional_timestamp("resolved_at", row.try_get("resolved_at")?)?,
    })
}
