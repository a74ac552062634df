use std::sync::Arc;
use std::time::Duration;

use leavegate_core::admission::{
    AdmissionCoordinator, AdmissionService, AdmissionSettings, Backoff, HandleDisposition,
    SubmitLeave,
};
use leavegate_core::chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use leavegate_core::config::LedgerMode;
use leavegate_core::dead_letter::DeadLetterSink;
use leavegate_core::ledger::IdempotencyKey;
use leavegate_core::{
    AdmissionLimits, ApplicationError, AvailabilityStatus, CapacityPolicy, DateRange, Decision,
    DecisionReason, EmployeeId, IdempotencyLedger, LeaveEvent, LeaveEventKind, LeaveType,
    OutcomeFanout, PublishRetryPolicy, RequestId, StateStore,
};
use leavegate_db::{
    connect_with_settings, migrations, DbPool, RosterSeed, SqlDeadLetterSink,
    SqlIdempotencyLedger, SqlStateStore,
};

type SqlAdmissionResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err(format!(
                "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                $left,
                $right
            ));
        }
    };
}

struct SqlOffice {
    pool: DbPool,
    store: Arc<SqlStateStore>,
    ledger: Arc<SqlIdempotencyLedger>,
    coordinator: Arc<AdmissionCoordinator>,
}

async fn sql_office(staff: u32, limits: AdmissionLimits) -> SqlAdmissionResult<SqlOffice> {
    let pool = connect_with_settings("sqlite::memory:", 1, 30)
        .await
        .map_err(|error| error.to_string())?;
    migrations::run_pending(&pool).await.map_err(|error| error.to_string())?;
    RosterSeed::new(staff, 20).load(&pool, Utc::now()).await.map_err(|error| error.to_string())?;

    let store = Arc::new(SqlStateStore::new(pool.clone()));
    let ledger = Arc::new(SqlIdempotencyLedger::new(pool.clone()));
    let coordinator = Arc::new(AdmissionCoordinator::new(
        store.clone(),
        ledger.clone(),
        Arc::new(CapacityPolicy::new(limits)),
        OutcomeFanout::new(PublishRetryPolicy::default()),
        AdmissionSettings {
            max_commit_attempts: 50,
            backoff: Backoff::new(1, 5),
            handle_timeout: Duration::from_secs(10),
            ledger_mode: LedgerMode::Transactional,
            ..AdmissionSettings::default()
        },
    ));
    Ok(SqlOffice { pool, store, ledger, coordinator })
}

fn day(day: u32) -> SqlAdmissionResult<NaiveDate> {
    NaiveDate::from_ymd_opt(2026, 9, day).ok_or_else(|| format!("invalid day {day}"))
}

fn submitted(employee: &str, request: &str, start: u32, end: u32) -> SqlAdmissionResult<LeaveEvent> {
    Ok(LeaveEvent {
        request_id: RequestId(request.to_string()),
        employee_id: EmployeeId(employee.to_string()),
        issued_at: Utc::now(),
        kind: LeaveEventKind::Submitted {
            leave_type: LeaveType::new("annual").ok_or("empty leave type")?,
            range: DateRange::new(day(start)?, day(end)?).map_err(|error| error.to_string())?,
        },
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sql_admissions_respect_the_absence_limit() -> SqlAdmissionResult {
    // 12 staff with 9 required on duty leaves three slots.
    let office = sql_office(12, AdmissionLimits::new(9)).await?;

    let mut handles = Vec::new();
    for index in 1..=12 {
        let coordinator = office.coordinator.clone();
        let event = submitted(&format!("emp-{index:03}"), &format!("r-{index}"), 7, 11)?;
        handles.push(tokio::spawn(async move { coordinator.handle(&event).await }));
    }

    let mut approved = 0;
    for handle in handles {
        let report =
            handle.await.map_err(|error| error.to_string())?.map_err(|error| error.to_string())?;
        match report.outcome.decision {
            Decision::Approved => approved += 1,
            Decision::Denied => {
                require_eq!(report.outcome.reason, DecisionReason::CapacityExceeded)
            }
            other => return Err(format!("unexpected decision {other:?}")),
        }
    }
    require_eq!(approved, 3);

    let on_leave = office
        .store
        .list_availability()
        .await
        .map_err(|error| error.to_string())?
        .into_iter()
        .filter(|record| record.status == AvailabilityStatus::OnLeave)
        .count();
    require_eq!(on_leave, 3);

    office.pool.close().await;
    Ok(())
}

#[tokio::test]
async fn sql_redelivery_replays_and_cancel_restores_quota() -> SqlAdmissionResult {
    let office = sql_office(3, AdmissionLimits::new(1)).await?;
    let event = submitted("emp-001", "r-1", 1, 4)?;

    let first = office.coordinator.handle(&event).await.map_err(|error| error.to_string())?;
    require_eq!(first.outcome.decision, Decision::Approved);
    let again = office.coordinator.handle(&event).await.map_err(|error| error.to_string())?;
    require_eq!(again.disposition, HandleDisposition::Replayed);
    require_eq!(again.outcome, first.outcome);

    let quota = office
        .store
        .get_quota(&EmployeeId("emp-001".to_string()))
        .await
        .map_err(|error| error.to_string())?
        .ok_or("missing quota")?;
    require_eq!((quota.taken_ytd, quota.available_days), (4, 16));

    let cancel = LeaveEvent {
        request_id: RequestId("r-1".to_string()),
        employee_id: EmployeeId("emp-001".to_string()),
        issued_at: Utc::now(),
        kind: LeaveEventKind::Cancelled,
    };
    let cancelled = office.coordinator.handle(&cancel).await.map_err(|error| error.to_string())?;
    require_eq!(cancelled.outcome.reason, DecisionReason::Cancelled);

    let quota = office
        .store
        .get_quota(&EmployeeId("emp-001".to_string()))
        .await
        .map_err(|error| error.to_string())?
        .ok_or("missing quota")?;
    require_eq!((quota.taken_ytd, quota.available_days), (0, 20));

    let key = IdempotencyKey::for_event(&event);
    require!(office.ledger.has_seen(&key).await.map_err(|error| error.to_string())?);
    let retention = office.coordinator.settings().ledger_retention;
    let purged = office
        .ledger
        .purge_expired(Utc::now() + retention + ChronoDuration::seconds(1))
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(purged, 2);

    office.pool.close().await;
    Ok(())
}

#[tokio::test]
async fn sql_service_parks_events_for_unknown_employees() -> SqlAdmissionResult {
    let office = sql_office(2, AdmissionLimits::new(1)).await?;
    let dead_letters = Arc::new(SqlDeadLetterSink::new(office.pool.clone()));
    let service = AdmissionService::new(
        office.coordinator.clone(),
        dead_letters.clone(),
        AdmissionLimits::new(1),
    );

    let result = service
        .submit(SubmitLeave {
            request_id: Some("r-ghost".to_string()),
            employee_id: "emp-999".to_string(),
            leave_type: "annual".to_string(),
            start_date: day(1)?,
            end_date: day(2)?,
        })
        .await;
    require!(
        matches!(result, Err(ApplicationError::InvalidInput(_))),
        "unexpected result {result:?}"
    );

    let parked = dead_letters.list_unresolved(10).await.map_err(|error| error.to_string())?;
    require_eq!(parked.len(), 1);
    require_eq!(parked[0].id.as_str(), "sync-r-ghost-submitted");
    require_eq!(parked[0].error_class.as_str(), "malformed_event");

    office.pool.close().await;
    Ok(())
}
