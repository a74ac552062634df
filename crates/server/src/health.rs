//! Readiness of the admission runtime: the database, the idempotency ledger,
//! the dead-letter sink, the outcome outbox and the replay consumer.
//!
//! Parked events and queued outcomes are reported but never fail readiness;
//! a consumer partition that stopped on its own does.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use leavegate_core::{
    ConsumerSummary, DeadLetterSink, IdempotencyKey, IdempotencyLedger, LeaveEventType,
    OutcomeOutbox, RequestId,
};
use leavegate_db::DbPool;
use serde::Serialize;
use tokio::sync::watch;

/// Upper bound on the unresolved letters read per check.
const DEAD_LETTER_WINDOW: u32 = 50;

const LEDGER_CHECK_REQUEST: &str = "health-check";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    /// No replay source configured.
    Disabled,
    Running,
    Finished { stopped_partitions: Vec<u32> },
}

impl From<&ConsumerSummary> for ConsumerState {
    fn from(summary: &ConsumerSummary) -> Self {
        Self::Finished { stopped_partitions: summary.halted_partitions() }
    }
}

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub outbox: Arc<dyn OutcomeOutbox>,
    pub consumer: watch::Receiver<ConsumerState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn ready(detail: impl Into<String>) -> Self {
        Self { status: CheckStatus::Ready, detail: detail.into() }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self { status: CheckStatus::Degraded, detail: detail.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    pub status: CheckStatus,
    pub database: CheckResult,
    pub ledger: CheckResult,
    pub dead_letters: CheckResult,
    pub outbox: CheckResult,
    pub consumer: CheckResult,
    pub checked_at: String,
}

impl ReadinessReport {
    fn checks(&self) -> [&CheckResult; 5] {
        [&self.database, &self.ledger, &self.dead_letters, &self.outbox, &self.consumer]
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<ReadinessReport>) {
    let consumer = consumer_check(&state.consumer.borrow());
    let mut report = ReadinessReport {
        status: CheckStatus::Ready,
        database: database_check(&state.db_pool).await,
        ledger: ledger_check(state.ledger.as_ref()).await,
        dead_letters: dead_letter_check(state.dead_letters.as_ref()).await,
        outbox: outbox_check(state.outbox.as_ref()).await,
        consumer,
        checked_at: Utc::now().to_rfc3339(),
    };
    if report.checks().iter().any(|check| check.status == CheckStatus::Degraded) {
        report.status = CheckStatus::Degraded;
    }

    let status_code = match report.status {
        CheckStatus::Ready => StatusCode::OK,
        CheckStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(report))
}

async fn database_check(db_pool: &DbPool) -> CheckResult {
    match leavegate_db::ping(db_pool).await {
        Ok(()) => CheckResult::ready("database answered"),
        Err(error) => CheckResult::degraded(format!("database unreachable: {error}")),
    }
}

async fn ledger_check(ledger: &dyn IdempotencyLedger) -> CheckResult {
    let key = IdempotencyKey {
        request_id: RequestId(LEDGER_CHECK_REQUEST.to_string()),
        event_type: LeaveEventType::Submitted,
    };
    match ledger.find(&key).await {
        Ok(_) => CheckResult::ready("ledger lookups succeed"),
        Err(error) => CheckResult::degraded(format!("ledger lookup failed: {error}")),
    }
}

async fn dead_letter_check(dead_letters: &dyn DeadLetterSink) -> CheckResult {
    match dead_letters.list_unresolved(DEAD_LETTER_WINDOW).await {
        Ok(letters) if letters.len() as u32 >= DEAD_LETTER_WINDOW => {
            CheckResult::ready(format!("{DEAD_LETTER_WINDOW}+ events parked for review"))
        }
        Ok(letters) => CheckResult::ready(format!("{} events parked for review", letters.len())),
        Err(error) => CheckResult::degraded(format!("dead-letter sink unreadable: {error}")),
    }
}

async fn outbox_check(outbox: &dyn OutcomeOutbox) -> CheckResult {
    match outbox.pending_count().await {
        Ok(pending) => CheckResult::ready(format!("{pending} outcomes awaiting delivery")),
        Err(error) => CheckResult::degraded(format!("outbox unreadable: {error}")),
    }
}

fn consumer_check(state: &ConsumerState) -> CheckResult {
    match state {
        ConsumerState::Disabled => CheckResult::ready("no replay source configured"),
        ConsumerState::Running => CheckResult::ready("consuming"),
        ConsumerState::Finished { stopped_partitions } if stopped_partitions.is_empty() => {
            CheckResult::ready("replay drained")
        }
        ConsumerState::Finished { stopped_partitions } => {
            CheckResult::degraded(format!("partitions stopped on failure: {stopped_partitions:?}"))
        }
    }
}
