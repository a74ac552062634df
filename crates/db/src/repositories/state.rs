use async_trait::async_trait;
use leavegate_core::chrono::NaiveDate;
use leavegate_core::domain::employee::{
    AvailabilityRecord, AvailabilityStatus, DateRange, EmployeeId, QuotaRecord,
};
use leavegate_core::domain::outcome::DecisionReason;
use leavegate_core::domain::request::{
    ClosureKind, LeaveRequest, LeaveRequestStatus, LeaveType, RequestClosure, RequestId,
};
use leavegate_core::policy::AdmissionSnapshot;
use leavegate_core::store::{CommitStatus, StateCommit, StateStore, StoreError, VersionGuard};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use tracing::debug;

use super::ledger::upsert_entry;
use super::{
    format_date, format_timestamp, parse_date, parse_optional_timestamp, parse_timestamp,
    parse_u32, parse_u64, to_i64, RepositoryError,
};
use crate::DbPool;

const AVAILABILITY_COLUMNS: &str = "employee_id, status, leave_from, leave_to, active_request_id, \
     version, updated_at";
const QUOTA_COLUMNS: &str = "employee_id, annual_allowance, carried_over, taken_ytd, \
     pending_days, available_days, version, updated_at";
const REQUEST_COLUMNS: &str = "request_id, employee_id, leave_type, start_date, end_date, days, \
     status, decision_reason, decided_at, reviewed_by, closure_kind, closed_at, version, created_at";

/// SQLite-backed [`StateStore`]. Every commit is a single transaction whose
/// first statement is a write, so the guards and updates run under the write
/// lock against the latest data.
pub struct SqlStateStore {
    pool: DbPool,
}

impl SqlStateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_availability(
        &self,
        employee_id: &EmployeeId,
    ) -> Result<Option<AvailabilityRecord>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        availability_by_id(&mut *conn, employee_id).await
    }

    async fn fetch_quota(
        &self,
        employee_id: &EmployeeId,
    ) -> Result<Option<QuotaRecord>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        quota_by_id(&mut *conn, employee_id).await
    }

    async fn fetch_roster(&self) -> Result<Vec<AvailabilityRecord>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        roster(&mut *conn).await
    }

    async fn fetch_quotas(&self) -> Result<Vec<QuotaRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {QUOTA_COLUMNS} FROM leave_quota ORDER BY employee_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(quota_from_row).collect()
    }

    async fn fetch_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<LeaveRequest>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        request_by_id(&mut *conn, request_id).await
    }

    async fn fetch_requests(
        &self,
        employee_id: &EmployeeId,
    ) -> Result<Vec<LeaveRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS}
             FROM leave_request
             WHERE employee_id = ?
             ORDER BY created_at ASC, request_id ASC"
        ))
        .bind(employee_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn insert_employee(
        &self,
        availability: AvailabilityRecord,
        quota: QuotaRecord,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO employee_availability (
                employee_id, status, leave_from, leave_to, active_request_id, version, updated_at
             ) VALUES (?, ?, ?, ?, ?, 1, ?)
             ON CONFLICT(employee_id) DO NOTHING",
        )
        .bind(availability.employee_id.as_str())
        .bind(availability.status.as_str())
        .bind(availability.leave.map(|leave| format_date(&leave.start)))
        .bind(availability.leave.map(|leave| format_date(&leave.end)))
        .bind(availability.active_request_id.as_ref().map(RequestId::as_str))
        .bind(format_timestamp(&availability.updated_at))
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO leave_quota (
                employee_id, annual_allowance, carried_over, taken_ytd, pending_days,
                available_days, version, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(quota.employee_id.as_str())
        .bind(i64::from(quota.annual_allowance))
        .bind(i64::from(quota.carried_over))
        .bind(i64::from(quota.taken_ytd))
        .bind(i64::from(quota.pending_days))
        .bind(i64::from(quota.available_days))
        .bind(format_timestamp(&quota.updated_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn read_snapshot(
        &self,
        employee_id: &EmployeeId,
        request_id: &RequestId,
    ) -> Result<Result<AdmissionSnapshot, StoreError>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let availability = availability_by_id(&mut *tx, employee_id).await?;
        let quota = quota_by_id(&mut *tx, employee_id).await?;
        let request = request_by_id(&mut *tx, request_id).await?;
        let roster = roster(&mut *tx).await?;
        tx.commit().await?;

        let Some(availability) = availability else {
            return Ok(Err(missing("availability", employee_id)));
        };
        let Some(quota) = quota else {
            return Ok(Err(missing("quota", employee_id)));
        };
        Ok(Ok(AdmissionSnapshot { availability, quota, request, roster }))
    }

    async fn apply(&self, commit: &StateCommit) -> Result<CommitStatus, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        match apply_commit(&mut *tx, commit).await? {
            Some(detail) => {
                tx.rollback().await?;
                debug!(
                    event_name = "store.commit.rolled_back",
                    guards = commit.read_set.len(),
                    detail = %detail,
                    "version guard rejected commit"
                );
                Ok(CommitStatus::Conflict { detail })
            }
            None => {
                tx.commit().await?;
                Ok(CommitStatus::Applied)
            }
        }
    }
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn get_availability(
        &self,
        employee_id: &EmployeeId,
    ) -> Result<Option<AvailabilityRecord>, StoreError> {
        Ok(self.fetch_availability(employee_id).await?)
    }

    async fn get_quota(&self, employee_id: &EmployeeId) -> Result<Option<QuotaRecord>, StoreError> {
        Ok(self.fetch_quota(employee_id).await?)
    }

    async fn list_availability(&self) -> Result<Vec<AvailabilityRecord>, StoreError> {
        Ok(self.fetch_roster().await?)
    }

    async fn list_quotas(&self) -> Result<Vec<QuotaRecord>, StoreError> {
        Ok(self.fetch_quotas().await?)
    }

    async fn find_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<LeaveRequest>, StoreError> {
        Ok(self.fetch_request(request_id).await?)
    }

    async fn list_requests(
        &self,
        employee_id: &EmployeeId,
    ) -> Result<Vec<LeaveRequest>, StoreError> {
        Ok(self.fetch_requests(employee_id).await?)
    }

    async fn onboard(
        &self,
        availability: AvailabilityRecord,
        quota: QuotaRecord,
    ) -> Result<(), StoreError> {
        let employee_id = availability.employee_id.0.clone();
        if self.insert_employee(availability, quota).await? {
            Ok(())
        } else {
            Err(StoreError::AlreadyOnboarded(employee_id))
        }
    }

    async fn load_snapshot(
        &self,
        employee_id: &EmployeeId,
        request_id: &RequestId,
    ) -> Result<AdmissionSnapshot, StoreError> {
        self.read_snapshot(employee_id, request_id).await?
    }

    async fn commit(&self, commit: StateCommit) -> Result<CommitStatus, StoreError> {
        Ok(self.apply(&commit).await?)
    }
}

fn missing(kind: &'static str, employee_id: &EmployeeId) -> StoreError {
    StoreError::MissingRecord { kind, employee_id: employee_id.0.clone() }
}

/// Runs every guard and write of `commit`. Returns the conflict detail when a
/// version no longer matches; the caller rolls back in that case.
async fn apply_commit(
    conn: &mut SqliteConnection,
    commit: &StateCommit,
) -> Result<Option<String>, RepositoryError> {
    for guard in &commit.read_set {
        if !hold_guard(conn, guard).await? {
            return Ok(Some(format!(
                "availability of `{}` moved past version {}",
                guard.employee_id, guard.version
            )));
        }
    }

    if let Some(record) = &commit.availability {
        if !update_availability(conn, record).await? {
            return Ok(Some(format!("availability of `{}` changed", record.employee_id)));
        }
    }

    if let Some(record) = &commit.quota {
        if !update_quota(conn, record).await? {
            return Ok(Some(format!("quota of `{}` changed", record.employee_id)));
        }
    }

    if let Some(request) = &commit.request {
        let written = if request.version == 0 {
            insert_request(conn, request).await?
        } else {
            update_request(conn, request).await?
        };
        if !written {
            return Ok(Some(format!("request `{}` changed", request.request_id)));
        }
    }

    if let Some(entry) = &commit.ledger_entry {
        if upsert_entry(conn, entry, false).await? == 0 {
            return Ok(Some(format!("ledger entry `{}` already completed", entry.key)));
        }
    }

    Ok(None)
}

/// Touches the guarded row without changing it, taking the write lock.
async fn hold_guard(
    conn: &mut SqliteConnection,
    guard: &VersionGuard,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "UPDATE employee_availability SET version = version
         WHERE employee_id = ? AND version = ?",
    )
    .bind(guard.employee_id.as_str())
    .bind(to_i64("version", guard.version)?)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn update_availability(
    conn: &mut SqliteConnection,
    record: &AvailabilityRecord,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "UPDATE employee_availability
         SET status = ?, leave_from = ?, leave_to = ?, active_request_id = ?,
             version = version + 1, updated_at = ?
         WHERE employee_id = ? AND version = ?",
    )
    .bind(record.status.as_str())
    .bind(record.leave.map(|leave| format_date(&leave.start)))
    .bind(record.leave.map(|leave| format_date(&leave.end)))
    .bind(record.active_request_id.as_ref().map(RequestId::as_str))
    .bind(format_timestamp(&record.updated_at))
    .bind(record.employee_id.as_str())
    .bind(to_i64("version", record.version)?)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn update_quota(
    conn: &mut SqliteConnection,
    record: &QuotaRecord,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "UPDATE leave_quota
         SET annual_allowance = ?, carried_over = ?, taken_ytd = ?, pending_days = ?,
             available_days = ?, version = version + 1, updated_at = ?
         WHERE employee_id = ? AND version = ?",
    )
    .bind(i64::from(record.annual_allowance))
    .bind(i64::from(record.carried_over))
    .bind(i64::from(record.taken_ytd))
    .bind(i64::from(record.pending_days))
    .bind(i64::from(record.available_days))
    .bind(format_timestamp(&record.updated_at))
    .bind(record.employee_id.as_str())
    .bind(to_i64("version", record.version)?)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn insert_request(
    conn: &mut SqliteConnection,
    request: &LeaveRequest,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "INSERT INTO leave_request (
            request_id, employee_id, leave_type, start_date, end_date, days, status,
            decision_reason, decided_at, reviewed_by, closure_kind, closed_at, version, created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(request_id) DO NOTHING",
    )
    .bind(request.request_id.as_str())
    .bind(request.employee_id.as_str())
    .bind(request.leave_type.as_str())
    .bind(format_date(&request.range.start))
    .bind(format_date(&request.range.end))
    .bind(i64::from(request.days))
    .bind(request.status.as_str())
    .bind(request.decision_reason.as_str())
    .bind(format_timestamp(&request.decided_at))
    .bind(request.reviewed_by.as_deref())
    .bind(request.closure.map(|closure| closure.kind.as_str()))
    .bind(request.closure.map(|closure| format_timestamp(&closure.at)))
    .bind(format_timestamp(&request.created_at))
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn update_request(
    conn: &mut SqliteConnection,
    request: &LeaveRequest,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "UPDATE leave_request
         SET status = ?, decision_reason = ?, decided_at = ?, reviewed_by = ?,
             closure_kind = ?, closed_at = ?, version = version + 1
         WHERE request_id = ? AND version = ?",
    )
    .bind(request.status.as_str())
    .bind(request.decision_reason.as_str())
    .bind(format_timestamp(&request.decided_at))
    .bind(request.reviewed_by.as_deref())
    .bind(request.closure.map(|closure| closure.kind.as_str()))
    .bind(request.closure.map(|closure| format_timestamp(&closure.at)))
    .bind(request.request_id.as_str())
    .bind(to_i64("version", request.version)?)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn availability_by_id(
    conn: &mut SqliteConnection,
    employee_id: &EmployeeId,
) -> Result<Option<AvailabilityRecord>, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {AVAILABILITY_COLUMNS} FROM employee_availability WHERE employee_id = ?"
    ))
    .bind(employee_id.as_str())
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(availability_from_row).transpose()
}

async fn quota_by_id(
    conn: &mut SqliteConnection,
    employee_id: &EmployeeId,
) -> Result<Option<QuotaRecord>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {QUOTA_COLUMNS} FROM leave_quota WHERE employee_id = ?"))
        .bind(employee_id.as_str())
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(quota_from_row).transpose()
}

async fn request_by_id(
    conn: &mut SqliteConnection,
    request_id: &RequestId,
) -> Result<Option<LeaveRequest>, RepositoryError> {
    let row =
        sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM leave_request WHERE request_id = ?"))
            .bind(request_id.as_str())
            .fetch_optional(conn)
            .await?;
    row.as_ref().map(request_from_row).transpose()
}

async fn roster(conn: &mut SqliteConnection) -> Result<Vec<AvailabilityRecord>, RepositoryError> {
    let rows = sqlx::query(&format!(
        "SELECT {AVAILABILITY_COLUMNS} FROM employee_availability ORDER BY employee_id ASC"
    ))
    .fetch_all(conn)
    .await?;
    rows.iter().map(availability_from_row).collect()
}

fn availability_from_row(row: &SqliteRow) -> Result<AvailabilityRecord, RepositoryError> {
    let status_raw: String = row.try_get("status")?;
    let status = AvailabilityStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown availability status `{status_raw}`"))
    })?;

    let leave_from: Option<String> = row.try_get("leave_from")?;
    let leave_to: Option<String> = row.try_get("leave_to")?;
    let leave = match (leave_from, leave_to) {
        (Some(from), Some(to)) => Some(date_range(
            parse_date("leave_from", from)?,
            parse_date("leave_to", to)?,
        )?),
        (None, None) => None,
        _ => {
            return Err(RepositoryError::Decode(
                "`leave_from` and `leave_to` must be set together".to_string(),
            ))
        }
    };

    Ok(AvailabilityRecord {
        employee_id: EmployeeId(row.try_get("employee_id")?),
        status,
        leave,
        active_request_id: row.try_get::<Option<String>, _>("active_request_id")?.map(RequestId),
        version: parse_u64("version", row.try_get("version")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn quota_from_row(row: &SqliteRow) -> Result<QuotaRecord, RepositoryError> {
    Ok(QuotaRecord {
        employee_id: EmployeeId(row.try_get("employee_id")?),
        annual_allowance: parse_u32("annual_allowance", row.try_get("annual_allowance")?)?,
        carried_over: parse_u32("carried_over", row.try_get("carried_over")?)?,
        taken_ytd: parse_u32("taken_ytd", row.try_get("taken_ytd")?)?,
        pending_days: parse_u32("pending_days", row.try_get("pending_days")?)?,
        available_days: parse_u32("available_days", row.try_get("available_days")?)?,
        version: parse_u64("version", row.try_get("version")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn request_from_row(row: &SqliteRow) -> Result<LeaveRequest, RepositoryError> {
    let leave_type_raw: String = row.try_get("leave_type")?;
    let leave_type = LeaveType::new(&leave_type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("empty leave type `{leave_type_raw}`")))?;

    let status_raw: String = row.try_get("status")?;
    let status = LeaveRequestStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown request status `{status_raw}`")))?;

    let reason_raw: String = row.try_get("decision_reason")?;
    let decision_reason = DecisionReason::parse(&reason_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown decision reason `{reason_raw}`")))?;

    let closure_kind: Option<String> = row.try_get("closure_kind")?;
    let closed_at = parse_optional_timestamp("closed_at", row.try_get("closed_at")?)?;
    let closure = match (closure_kind, closed_at) {
        (Some(kind), Some(at)) => {
            let kind = ClosureKind::parse(&kind)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown closure kind `{kind}`")))?;
            Some(RequestClosure { kind, at })
        }
        (None, None) => None,
        _ => {
            return Err(RepositoryError::Decode(
                "`closure_kind` and `closed_at` must be set together".to_string(),
            ))
        }
    };

    Ok(LeaveRequest {
        request_id: RequestId(row.try_get("request_id")?),
        employee_id: EmployeeId(row.try_get("employee_id")?),
        leave_type,
        range: date_range(
            parse_date("start_date", row.try_get("start_date")?)?,
            parse_date("end_date", row.try_get("end_date")?)?,
        )?,
        days: parse_u32("days", row.try_get("days")?)?,
        status,
        decision_reason,
        decided_at: parse_timestamp("decided_at", row.try_get("decided_at")?)?,
        reviewed_by: row.try_get("reviewed_by")?,
        closure,
        version: parse_u64("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn date_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange, RepositoryError> {
    DateRange::new(start, end).map_err(|error| RepositoryError::Decode(error.to_string()))
}

#[cfg(test)]
mod tests {
    use leavegate_core::chrono::{DateTime, NaiveDate, Utc};
    use leavegate_core::domain::employee::{
        AvailabilityRecord, AvailabilityStatus, DateRange, EmployeeId, QuotaRecord,
    };
    use leavegate_core::domain::outcome::DecisionReason;
    use leavegate_core::domain::request::{
        ClosureKind, LeaveRequest, LeaveRequestStatus, LeaveType, RequestId,
    };
    use leavegate_core::store::{CommitStatus, StateCommit, StateStore, StoreError, VersionGuard};

    use super::SqlStateStore;
    use crate::migrations;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2026, 3, 2).expect("date"),
            NaiveDate::from_ymd_opt(2026, 3, 6).expect("date"),
        )
        .expect("range")
    }

    async fn onboarded(store: &SqlStateStore, ids: &[&str]) {
        let at = parse_ts("2026-02-23T12:00:00.123456789Z");
        for id in ids {
            let employee = EmployeeId((*id).to_string());
            store
                .onboard(
                    AvailabilityRecord::onboard(employee.clone(), at),
                    QuotaRecord::onboard(employee, 20, 2, 0, at).expect("quota"),
                )
                .await
                .expect("onboard");
        }
    }

    fn approved_request(employee: &str, request: &str) -> LeaveRequest {
        let at = parse_ts("2026-02-24T09:00:00Z");
        LeaveRequest {
            request_id: RequestId(request.to_string()),
            employee_id: EmployeeId(employee.to_string()),
            leave_type: LeaveType::new("annual").expect("leave type"),
            range: range(),
            days: 5,
            status: LeaveRequestStatus::Approved,
            decision_reason: DecisionReason::WithinPolicy,
            decided_at: at,
            reviewed_by: None,
            closure: None,
            version: 0,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn onboarding_starts_records_at_version_one() {
        let pool = setup_pool().await;
        let store = SqlStateStore::new(pool.clone());
        onboarded(&store, &["e-1"]).await;

        let employee = EmployeeId("e-1".to_string());
        let availability = store.get_availability(&employee).await.expect("get").expect("row");
        assert_eq!(availability.version, 1);
        assert_eq!(availability.status, AvailabilityStatus::Available);
        assert_eq!(availability.updated_at, parse_ts("2026-02-23T12:00:00.123456789Z"));

        let quota = store.get_quota(&employee).await.expect("get").expect("row");
        assert_eq!((quota.available_days, quota.version), (22, 1));

        let duplicate = store
            .onboard(
                AvailabilityRecord::onboard(employee.clone(), Utc::now()),
                QuotaRecord::onboard(employee, 20, 0, 0, Utc::now()).expect("quota"),
            )
            .await
            .expect_err("duplicate onboarding");
        assert_eq!(duplicate, StoreError::AlreadyOnboarded("e-1".to_string()));

        pool.close().await;
    }

    #[tokio::test]
    async fn snapshot_of_unknown_employee_is_missing_record() {
        let pool = setup_pool().await;
        let store = SqlStateStore::new(pool.clone());

        let error = store
            .load_snapshot(&EmployeeId("ghost".to_string()), &RequestId("r-1".to_string()))
            .await
            .expect_err("missing employee");
        assert!(matches!(error, StoreError::MissingRecord { kind: "availability", .. }));
        assert!(!error.is_transient());

        pool.close().await;
    }

    #[tokio::test]
    async fn applied_commit_bumps_every_written_version() {
        let pool = setup_pool().await;
        let store = SqlStateStore::new(pool.clone());
        onboarded(&store, &["e-1", "e-2"]).await;

        let snapshot = store
            .load_snapshot(&EmployeeId("e-1".to_string()), &RequestId("r-1".to_string()))
            .await
            .expect("snapshot");
        assert!(snapshot.request.is_none());
        assert_eq!(snapshot.roster.len(), 2);

        let at = parse_ts("2026-02-24T09:00:00Z");
        let request = approved_request("e-1", "r-1");
        let commit = StateCommit {
            availability: Some(snapshot.availability.start_leave(
                AvailabilityStatus::OnLeave,
                range(),
                request.request_id.clone(),
                at,
            )),
            quota: Some(snapshot.quota.consume(5, at).expect("consume")),
            request: Some(request.clone()),
            read_set: vec![VersionGuard { employee_id: EmployeeId("e-2".to_string()), version: 1 }],
            ledger_entry: None,
        };
        assert_eq!(store.commit(commit).await.expect("commit"), CommitStatus::Applied);

        let stored = store.find_request(&request.request_id).await.expect("find").expect("row");
        assert_eq!(stored, LeaveRequest { version: 1, ..request });

        let availability = store
            .get_availability(&EmployeeId("e-1".to_string()))
            .await
            .expect("get")
            .expect("row");
        assert_eq!(availability.version, 2);
        assert_eq!(availability.leave, Some(range()));
        assert!(availability.holds_request(&RequestId("r-1".to_string())));

        let quota =
            store.get_quota(&EmployeeId("e-1".to_string())).await.expect("get").expect("row");
        assert_eq!((quota.taken_ytd, quota.available_days, quota.version), (5, 17, 2));

        let untouched = store
            .get_availability(&EmployeeId("e-2".to_string()))
            .await
            .expect("get")
            .expect("row");
        assert_eq!(untouched.version, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn stale_read_set_guard_rolls_back_the_whole_commit() {
        let pool = setup_pool().await;
        let store = SqlStateStore::new(pool.clone());
        onboarded(&store, &["e-1", "e-2"]).await;

        let first = store
            .load_snapshot(&EmployeeId("e-1".to_string()), &RequestId("r-1".to_string()))
            .await
            .expect("snapshot");
        let second = store
            .load_snapshot(&EmployeeId("e-2".to_string()), &RequestId("r-2".to_string()))
            .await
            .expect("snapshot");
        let at = parse_ts("2026-02-24T09:00:00Z");

        let winner = StateCommit {
            availability: Some(second.availability.start_leave(
                AvailabilityStatus::OnLeave,
                range(),
                RequestId("r-2".to_string()),
                at,
            )),
            quota: None,
            request: Some(approved_request("e-2", "r-2")),
            read_set: vec![VersionGuard { employee_id: EmployeeId("e-1".to_string()), version: 1 }],
            ledger_entry: None,
        };
        assert_eq!(store.commit(winner).await.expect("winner"), CommitStatus::Applied);

        let loser = StateCommit {
            availability: Some(first.availability.start_leave(
                AvailabilityStatus::OnLeave,
                range(),
                RequestId("r-1".to_string()),
                at,
            )),
            quota: None,
            request: Some(approved_request("e-1", "r-1")),
            read_set: vec![VersionGuard { employee_id: EmployeeId("e-2".to_string()), version: 1 }],
            ledger_entry: None,
        };
        let status = store.commit(loser).await.expect("loser");
        assert!(matches!(status, CommitStatus::Conflict { .. }), "got {status:?}");

        assert!(store
            .find_request(&RequestId("r-1".to_string()))
            .await
            .expect("find")
            .is_none());
        let subject = store
            .get_availability(&EmployeeId("e-1".to_string()))
            .await
            .expect("get")
            .expect("row");
        assert_eq!((subject.status, subject.version), (AvailabilityStatus::Available, 1));

        pool.close().await;
    }

    #[tokio::test]
    async fn reinserting_an_existing_request_conflicts() {
        let pool = setup_pool().await;
        let store = SqlStateStore::new(pool.clone());
        onboarded(&store, &["e-1"]).await;

        let commit = StateCommit {
            availability: None,
            quota: None,
            request: Some(approved_request("e-1", "r-1")),
            read_set: vec![VersionGuard { employee_id: EmployeeId("e-1".to_string()), version: 1 }],
            ledger_entry: None,
        };
        assert_eq!(store.commit(commit.clone()).await.expect("first"), CommitStatus::Applied);
        assert!(matches!(
            store.commit(commit).await.expect("second"),
            CommitStatus::Conflict { .. }
        ));

        pool.close().await;
    }

    #[tokio::test]
    async fn closing_a_request_round_trips_the_closure() {
        let pool = setup_pool().await;
        let store = SqlStateStore::new(pool.clone());
        onboarded(&store, &["e-1"]).await;

        let request = approved_request("e-1", "r-1");
        store
            .commit(StateCommit {
                availability: None,
                quota: None,
                request: Some(request.clone()),
                read_set: Vec::new(),
                ledger_entry: None,
            })
            .await
            .expect("insert");

        let stored = store.find_request(&request.request_id).await.expect("find").expect("row");
        let closed = stored.close(ClosureKind::Cancelled, parse_ts("2026-02-25T10:30:00Z"));
        assert_eq!(
            store
                .commit(StateCommit {
                    availability: None,
                    quota: None,
                    request: Some(closed.clone()),
                    read_set: Vec::new(),
                    ledger_entry: None,
                })
                .await
                .expect("close"),
            CommitStatus::Applied
        );

        let requests = store.list_requests(&EmployeeId("e-1".to_string())).await.expect("list");
        assert_eq!(requests, vec![LeaveRequest { version: 2, ..closed }]);
        assert!(!requests[0].is_active());

        pool.close().await;
    }
}
