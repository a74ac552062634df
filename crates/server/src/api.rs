//! On-demand request API for interactive callers.
//!
//! Every call runs through the same [`AdmissionService`] as the stream
//! consumer, so a synchronous submit is decided by the same policy and
//! committed under the same version guards.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use leavegate_core::{
    AdmissionService, ApplicationError, AvailabilityStats, InterfaceError, LeaveRequest,
    OutcomeEvent, QuotaBalance, RosterEntry, SubmitLeave,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    service: Arc<AdmissionService>,
}

impl ApiState {
    pub fn new(service: Arc<AdmissionService>) -> Self {
        Self { service }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReviewBody {
    pub approve: bool,
    pub reviewer: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RosterResponse {
    pub employees: Vec<RosterEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestsResponse {
    pub employee_id: String,
    pub requests: Vec<LeaveRequest>,
}

type ApiFailure = (StatusCode, Json<ApiError>);

pub fn router(service: Arc<AdmissionService>) -> Router {
    Router::new()
        .route("/v1/employees", get(roster))
        .route("/v1/employees/{id}/balance", get(balance))
        .route("/v1/employees/{id}/requests", get(requests))
        .route("/v1/availability", get(availability))
        .route("/v1/leave-requests", post(submit))
        .route("/v1/leave-requests/{id}/cancel", post(cancel))
        .route("/v1/leave-requests/{id}/review", post(review))
        .with_state(ApiState::new(service))
}

pub async fn balance(
    State(state): State<ApiState>,
    Path(employee_id): Path<String>,
) -> Result<Json<QuotaBalance>, ApiFailure> {
    state.service.balance(&employee_id).await.map(Json).map_err(failure)
}

pub async fn roster(State(state): State<ApiState>) -> Result<Json<RosterResponse>, ApiFailure> {
    let employees = state.service.roster().await.map_err(failure)?;
    Ok(Json(RosterResponse { employees }))
}

pub async fn availability(
    State(state): State<ApiState>,
) -> Result<Json<AvailabilityStats>, ApiFailure> {
    state.service.availability_stats().await.map(Json).map_err(failure)
}

pub async fn requests(
    State(state): State<ApiState>,
    Path(employee_id): Path<String>,
) -> Result<Json<RequestsResponse>, ApiFailure> {
    let requests = state.service.requests(&employee_id).await.map_err(failure)?;
    Ok(Json(RequestsResponse { employee_id, requests }))
}

pub async fn submit(
    State(state): State<ApiState>,
    Json(body): Json<SubmitLeave>,
) -> Result<Json<OutcomeEvent>, ApiFailure> {
    let outcome = state.service.submit(body).await.map_err(failure)?;
    log_outcome("api.leave_request.submitted", &outcome);
    Ok(Json(outcome))
}

pub async fn cancel(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> Result<Json<OutcomeEvent>, ApiFailure> {
    let outcome = state.service.cancel(&request_id).await.map_err(failure)?;
    log_outcome("api.leave_request.cancelled", &outcome);
    Ok(Json(outcome))
}

pub async fn review(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> Result<Json<OutcomeEvent>, ApiFailure> {
    let outcome =
        state.service.review(&request_id, body.approve, &body.reviewer).await.map_err(failure)?;
    log_outcome("api.leave_request.reviewed", &outcome);
    Ok(Json(outcome))
}

fn log_outcome(event_name: &'static str, outcome: &OutcomeEvent) {
    info!(
        event_name,
        correlation_id = %outcome.request_id,
        request_id = %outcome.request_id,
        employee_id = %outcome.employee_id,
        decision = outcome.decision.as_str(),
        reason = outcome.reason.as_str(),
        "on-demand leave request decided"
    );
}

fn failure(error: ApplicationError) -> ApiFailure {
    let correlation_id = Uuid::new_v4().to_string();
    let interface = error.into_interface(correlation_id);
    let (status, code) = match &interface {
        InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
        InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        InterfaceError::ServiceUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        }
        InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };

    warn!(
        event_name = "api.request.failed",
        correlation_id = interface.correlation_id(),
        status = status.as_u16(),
        error = %interface,
        "on-demand request failed"
    );

    let message = match &interface {
        InterfaceError::BadRequest { message, .. } | InterfaceError::NotFound { message, .. } => {
            message.clone()
        }
        _ => interface.user_message().to_string(),
    };
    (
        status,
        Json(ApiError {
            error: code.to_string(),
            message,
            correlation_id: interface.correlation_id().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        extract::{Path, State},
        http::StatusCode,
        Json,
    };
    use leavegate_core::admission::Backoff;
    use leavegate_core::chrono::{NaiveDate, Utc};
    use leavegate_core::{
        AdmissionCoordinator, AdmissionLimits, AdmissionService, AdmissionSettings,
        AvailabilityRecord, CapacityPolicy, Decision, DecisionReason, EmployeeId,
        InMemoryAdmissionStore, InMemoryDeadLetterSink, OutcomeFanout, QuotaRecord, StateStore,
        SubmitLeave,
    };

    use super::{
        availability, balance, cancel, requests, review, roster, submit, ApiState, ReviewBody,
    };

    async fn state(staff: u32, minimum_available: u32) -> ApiState {
        let store = Arc::new(InMemoryAdmissionStore::new());
        for index in 1..=staff {
            let employee = EmployeeId(format!("emp-{index:03}"));
            store
                .onboard(
                    AvailabilityRecord::onboard(employee.clone(), Utc::now()),
                    QuotaRecord::onboard(employee, 20, 0, 0, Utc::now()).expect("quota"),
                )
                .await
                .expect("onboard");
        }
        let limits = AdmissionLimits::new(minimum_available).with_review_type("unpaid");
        let coordinator = Arc::new(AdmissionCoordinator::new(
            store.clone(),
            store,
            Arc::new(CapacityPolicy::new(limits.clone())),
            OutcomeFanout::default(),
            AdmissionSettings { backoff: Backoff::new(0, 0), ..AdmissionSettings::default() },
        ));
        let service = AdmissionService::new(
            coordinator,
            Arc::new(InMemoryDeadLetterSink::default()),
            limits,
        );
        ApiState::new(Arc::new(service))
    }

    fn leave(request_id: &str, employee: &str, leave_type: &str) -> SubmitLeave {
        SubmitLeave {
            request_id: Some(request_id.to_string()),
            employee_id: employee.to_string(),
            leave_type: leave_type.to_string(),
            start_date: NaiveDate::from_ymd_opt(2026, 6, 1).expect("date"),
            end_date: NaiveDate::from_ymd_opt(2026, 6, 5).expect("date"),
        }
    }

    #[tokio::test]
    async fn submit_then_balance_reflects_the_approved_days() {
        let state = state(3, 1).await;

        let Json(outcome) = submit(State(state.clone()), Json(leave("r-1", "emp-001", "annual")))
            .await
            .expect("submit");
        assert_eq!(outcome.decision, Decision::Approved);

        let Json(quota) =
            balance(State(state.clone()), Path("emp-001".to_string())).await.expect("balance");
        assert_eq!((quota.taken_ytd, quota.available_days), (5, 15));

        let Json(stats) = availability(State(state.clone())).await.expect("availability");
        assert_eq!((stats.total_employees, stats.available, stats.absent), (3, 2, 1));

        let Json(listed) =
            requests(State(state), Path("emp-001".to_string())).await.expect("requests");
        assert_eq!(listed.requests.len(), 1);
        assert_eq!(listed.requests[0].request_id.as_str(), "r-1");
    }

    #[tokio::test]
    async fn capacity_denial_is_a_successful_response() {
        let state = state(2, 1).await;
        submit(State(state.clone()), Json(leave("r-1", "emp-001", "annual")))
            .await
            .expect("first submit");

        let Json(outcome) = submit(State(state), Json(leave("r-2", "emp-002", "annual")))
            .await
            .expect("denial is still an outcome");
        assert_eq!(
            (outcome.decision, outcome.reason),
            (Decision::Denied, DecisionReason::CapacityExceeded)
        );
    }

    #[tokio::test]
    async fn deferred_request_is_resolved_through_review() {
        let state = state(3, 1).await;
        let Json(deferred) = submit(State(state.clone()), Json(leave("r-9", "emp-002", "unpaid")))
            .await
            .expect("submit");
        assert_eq!(deferred.decision, Decision::Deferred);

        let Json(approved) = review(
            State(state.clone()),
            Path("r-9".to_string()),
            Json(ReviewBody { approve: true, reviewer: "lead-1".to_string() }),
        )
        .await
        .expect("review");
        assert_eq!(approved.reason, DecisionReason::ReviewApproved);

        let Json(cancelled) =
            cancel(State(state.clone()), Path("r-9".to_string())).await.expect("cancel");
        assert_eq!(cancelled.reason, DecisionReason::Cancelled);

        let Json(roster) = roster(State(state)).await.expect("roster");
        assert_eq!(roster.employees.len(), 3);
    }

    #[tokio::test]
    async fn unknown_employee_maps_to_not_found_with_correlation_id() {
        let state = state(1, 0).await;

        let (status, Json(error)) =
            balance(State(state), Path("emp-404".to_string())).await.expect_err("missing");
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error.error, "not_found");
        assert!(!error.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn inverted_range_is_a_bad_request() {
        let state = state(1, 0).await;
        let mut body = leave("r-1", "emp-001", "annual");
        std::mem::swap(&mut body.start_date, &mut body.end_date);

        let (status, Json(error)) = submit(State(state), Json(body)).await.expect_err("invalid");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error.message.contains("invalid date range"));
    }
}
