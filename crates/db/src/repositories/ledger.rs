use async_trait::async_trait;
use leavegate_core::chrono::{DateTime, Utc};
use leavegate_core::domain::employee::EmployeeId;
use leavegate_core::domain::event::LeaveEventType;
use leavegate_core::domain::outcome::OutcomeEvent;
use leavegate_core::domain::request::RequestId;
use leavegate_core::ledger::{IdempotencyEntry, IdempotencyKey, LedgerEntryState};
use leavegate_core::store::{IdempotencyLedger, StoreError};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use super::{format_timestamp, parse_optional_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

pub struct SqlIdempotencyLedger {
    pool: DbPool,
}

impl SqlIdempotencyLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyEntry>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                request_id,
                event_type,
                employee_id,
                payload_fingerprint,
                state,
                outcome_json,
                first_seen_at,
                completed_at,
                expires_at
             FROM idempotency_ledger
             WHERE request_id = ? AND event_type = ?",
        )
        .bind(key.request_id.as_str())
        .bind(key.event_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn insert_reserved(&self, entry: &IdempotencyEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO idempotency_ledger (
                request_id, event_type, employee_id, payload_fingerprint, state,
                outcome_json, first_seen_at, completed_at, expires_at
             ) VALUES (?, ?, ?, ?, ?, NULL, ?, NULL, NULL)
             ON CONFLICT(request_id, event_type) DO NOTHING",
        )
        .bind(entry.key.request_id.as_str())
        .bind(entry.key.event_type.as_str())
        .bind(entry.employee_id.as_str())
        .bind(&entry.payload_fingerprint)
        .bind(LedgerEntryState::Reserved.as_str())
        .bind(format_timestamp(&entry.first_seen_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, entry: &IdempotencyEntry) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        upsert_entry(&mut *conn, entry, true).await?;
        Ok(())
    }

    async fn purge(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM idempotency_ledger
             WHERE state = ? AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(LedgerEntryState::Completed.as_str())
        .bind(format_timestamp(&now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdempotencyLedger for SqlIdempotencyLedger {
    async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyEntry>, StoreError> {
        Ok(self.fetch(key).await?)
    }

    async fn reserve(&self, entry: IdempotencyEntry) -> Result<(), StoreError> {
        Ok(self.insert_reserved(&entry).await?)
    }

    async fn record_outcome(&self, entry: IdempotencyEntry) -> Result<(), StoreError> {
        Ok(self.complete(&entry).await?)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.purge(now).await?)
    }
}

/// Writes `entry`, keeping the original `first_seen_at` of an existing row.
/// Without `overwrite_completed` a completed row is left alone and the
/// returned count is zero.
pub(crate) async fn upsert_entry(
    conn: &mut SqliteConnection,
    entry: &IdempotencyEntry,
    overwrite_completed: bool,
) -> Result<u64, RepositoryError> {
    let outcome_json = entry
        .outcome
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| RepositoryError::Decode(format!("outcome is not serializable: {error}")))?;

    let statement = if overwrite_completed {
        UPSERT_ENTRY
    } else {
        UPSERT_UNLESS_COMPLETED
    };

    let result = sqlx::query(statement)
        .bind(entry.key.request_id.as_str())
        .bind(entry.key.event_type.as_str())
        .bind(entry.employee_id.as_str())
        .bind(&entry.payload_fingerprint)
        .bind(entry.state.as_str())
        .bind(outcome_json)
        .bind(format_timestamp(&entry.first_seen_at))
        .bind(entry.completed_at.as_ref().map(format_timestamp))
        .bind(entry.expires_at.as_ref().map(format_timestamp))
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

const UPSERT_ENTRY: &str = "INSERT INTO idempotency_ledger (
        request_id, event_type, employee_id, payload_fingerprint, state,
        outcome_json, first_seen_at, completed_at, expires_at
     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(request_id, event_type) DO UPDATE SET
        employee_id = excluded.employee_id,
        payload_fingerprint = excluded.payload_fingerprint,
        state = excluded.state,
        outcome_json = excluded.outcome_json,
        completed_at = excluded.completed_at,
        expires_at = excluded.expires_at";

const UPSERT_UNLESS_COMPLETED: &str = "INSERT INTO idempotency_ledger (
        request_id, event_type, employee_id, payload_fingerprint, state,
        outcome_json, first_seen_at, completed_at, expires_at
     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(request_id, event_type) DO UPDATE SET
        employee_id = excluded.employee_id,
        payload_fingerprint = excluded.payload_fingerprint,
        state = excluded.state,
        outcome_json = excluded.outcome_json,
        completed_at = excluded.completed_at,
        expires_at = excluded.expires_at
     WHERE idempotency_ledger.state <> 'completed'";

fn entry_from_row(row: &SqliteRow) -> Result<IdempotencyEntry, RepositoryError> {
    let event_type_raw: String = row.try_get("event_type")?;
    let event_type = LeaveEventType::parse(&event_type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown event type `{event_type_raw}`")))?;

    let state_raw: String = row.try_get("state")?;
    let state = LedgerEntryState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown ledger state `{state_raw}`")))?;

    let outcome = row
        .try_get::<Option<String>, _>("outcome_json")?
        .map(|json| serde_json::from_str::<OutcomeEvent>(&json))
        .transpose()
        .map_err(|error| RepositoryError::Decode(format!("invalid `outcome_json`: {error}")))?;

    Ok(IdempotencyEntry {
        key: IdempotencyKey { request_id: RequestId(row.try_get("request_id")?), event_type },
        employee_id: EmployeeId(row.try_get("employee_id")?),
        payload_fingerprint: row.try_get("payload_fingerprint")?,
        state,
        outcome,
        first_seen_at: parse_timestamp("first_seen_at", row.try_get("first_seen_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        expires_at: parse_optional_timestamp("expires_at", row.try_get("expires_at")?)?,
    })
}
