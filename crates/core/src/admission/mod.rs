//! Admission of leave lifecycle events.
//!
//! [`AdmissionCoordinator`] is shared by the streaming consumer and the
//! synchronous [`AdmissionService`], so both paths go through the same ledger
//! and the same conditional commit.

pub mod coordinator;
pub mod error;
pub mod retry;

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

pub use coordinator::{AdmissionCoordinator, AdmissionSettings, HandleDisposition, HandleReport};
pub use error::{AdmissionError, FailureDisposition};
pub use retry::Backoff;

use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::domain::employee::{AvailabilityRecord, DateRange, EmployeeId, QuotaRecord};
use crate::domain::event::{LeaveEvent, LeaveEventKind};
use crate::domain::outcome::OutcomeEvent;
use crate::domain::request::{LeaveRequest, LeaveType, RequestId};
use crate::errors::ApplicationError;
use crate::policy::{capacity_of, AdmissionLimits};
use crate::store::{StateStore, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitLeave {
    #[serde(default)]
    pub request_id: Option<String>,
    pub employee_id: String,
    pub leave_type: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaBalance {
    pub employee_id: EmployeeId,
    pub annual_allowance: u32,
    pub carried_over: u32,
    pub taken_ytd: u32,
    pub pending_days: u32,
    pub available_days: u32,
}

impl From<QuotaRecord> for QuotaBalance {
    fn from(quota: QuotaRecord) -> Self {
        Self {
            employee_id: quota.employee_id,
            annual_allowance: quota.annual_allowance,
            carried_over: quota.carried_over,
            taken_ytd: quota.taken_ytd,
            pending_days: quota.pending_days,
            available_days: quota.available_days,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub availability: AvailabilityRecord,
    pub quota: Option<QuotaBalance>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityStats {
    pub total_employees: u32,
    pub available: u32,
    pub absent: u32,
    pub availability_percentage: f64,
    pub minimum_available: u32,
    pub remaining_capacity: u32,
}

/// Synchronous entry point used by the HTTP API.
///
/// Failed events are parked in the dead-letter sink under a stable id so a
/// retried API call updates the same entry.
pub struct AdmissionService {
    coordinator: Arc<AdmissionCoordinator>,
    store: Arc<dyn StateStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    limits: AdmissionLimits,
}

impl AdmissionService {
    pub fn new(
        coordinator: Arc<AdmissionCoordinator>,
        dead_letters: Arc<dyn DeadLetterSink>,
        limits: AdmissionLimits,
    ) -> Self {
        let store = coordinator.store().clone();
        Self { coordinator, store, dead_letters, limits }
    }

    pub fn coordinator(&self) -> &Arc<AdmissionCoordinator> {
        &self.coordinator
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    pub async fn submit(&self, input: SubmitLeave) -> Result<OutcomeEvent, ApplicationError> {
        let leave_type = LeaveType::new(&input.leave_type).ok_or_else(|| {
            ApplicationError::InvalidInput("leave_type must not be empty".to_string())
        })?;
        let range = DateRange::new(input.start_date, input.end_date)?;
        let employee_id = required("employee_id", &input.employee_id)?;
        let request_id = match input.request_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let event = LeaveEvent {
            request_id: RequestId(request_id),
            employee_id: EmployeeId(employee_id),
            issued_at: Utc::now(),
            kind: LeaveEventKind::Submitted { leave_type, range },
        };
        self.decide_now(&event).await
    }

    pub async fn cancel(&self, request_id: &str) -> Result<OutcomeEvent, ApplicationError> {
        let request = self.require_request(request_id).await?;
        let event = LeaveEvent {
            request_id: request.request_id,
            employee_id: request.employee_id,
            issued_at: Utc::now(),
            kind: LeaveEventKind::Cancelled,
        };
        self.decide_now(&event).await
    }

    pub async fn review(
        &self,
        request_id: &str,
        approve: bool,
        reviewer: &str,
    ) -> Result<OutcomeEvent, ApplicationError> {
        let reviewer = required("reviewer", reviewer)?;
        let request = self.require_request(request_id).await?;
        let event = LeaveEvent {
            request_id: request.request_id,
            employee_id: request.employee_id,
            issued_at: Utc::now(),
            kind: LeaveEventKind::Reviewed { approve, reviewer },
        };
        self.decide_now(&event).await
    }

    /// Runs one event through the coordinator and returns its outcome directly.
    pub async fn decide_now(&self, event: &LeaveEvent) -> Result<OutcomeEvent, ApplicationError> {
        match self.coordinator.handle(event).await {
            Ok(report) => Ok(report.outcome),
            Err(admission_error) => {
                // An unparked failure is reported as a store outage so the caller retries.
                self.park(event, &admission_error).await.map_err(store_failure)?;
                Err(admission_error.into())
            }
        }
    }

    pub async fn balance(&self, employee_id: &str) -> Result<QuotaBalance, ApplicationError> {
        let employee_id = EmployeeId(required("employee_id", employee_id)?);
        self.store
            .get_quota(&employee_id)
            .await
            .map_err(store_failure)?
            .map(QuotaBalance::from)
            .ok_or_else(|| ApplicationError::NotFound(format!("employee `{employee_id}`")))
    }

    pub async fn roster(&self) -> Result<Vec<RosterEntry>, ApplicationError> {
        let availability = self.store.list_availability().await.map_err(store_failure)?;
        let mut quotas = self.store.list_quotas().await.map_err(store_failure)?;

        Ok(availability
            .into_iter()
            .map(|record| {
                let quota = quotas
                    .iter()
                    .position(|quota| quota.employee_id == record.employee_id)
                    .map(|index| QuotaBalance::from(quotas.swap_remove(index)));
                RosterEntry { availability: record, quota }
            })
            .collect())
    }

    pub async fn availability_stats(&self) -> Result<AvailabilityStats, ApplicationError> {
        let roster = self.store.list_availability().await.map_err(store_failure)?;
        let total = self
            .limits
            .total_employees
            .unwrap_or_else(|| u32::try_from(roster.len()).unwrap_or(u32::MAX));
        let view = capacity_of(&roster, self.limits.minimum_available, total);
        let available = view.available();
        let availability_percentage = if total == 0 {
            0.0
        } else {
            (f64::from(available) / f64::from(total) * 1000.0).round() / 10.0
        };

        Ok(AvailabilityStats {
            total_employees: total,
            available,
            absent: view.absent,
            availability_percentage,
            minimum_available: view.minimum_available,
            remaining_capacity: view.remaining(),
        })
    }

    pub async fn requests(&self, employee_id: &str) -> Result<Vec<LeaveRequest>, ApplicationError> {
        let employee_id = EmployeeId(required("employee_id", employee_id)?);
        if self.store.get_availability(&employee_id).await.map_err(store_failure)?.is_none() {
            return Err(ApplicationError::NotFound(format!("employee `{employee_id}`")));
        }
        self.store.list_requests(&employee_id).await.map_err(store_failure)
    }

    async fn require_request(&self, request_id: &str) -> Result<LeaveRequest, ApplicationError> {
        let request_id = RequestId(required("request_id", request_id)?);
        self.store
            .find_request(&request_id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| ApplicationError::NotFound(format!("leave request `{request_id}`")))
    }

    async fn park(&self, event: &LeaveEvent, admission_error: &AdmissionError) -> Result<(), StoreError> {
        if admission_error.disposition() == FailureDisposition::RetryUnacknowledged {
            warn!(
                event_name = "admission.sync.transient_failure",
                request_id = %event.request_id,
                employee_id = %event.employee_id,
                error = %admission_error,
                "synchronous admission failed, caller should retry"
            );
            return Ok(());
        }

        let payload = serde_json::to_string(&event.to_wire()).unwrap_or_default();
        let letter = DeadLetter::new(
            DeadLetter::sync_id(event.request_id.as_str(), event.event_type().as_str()),
            payload,
            admission_error.error_class(),
            admission_error.to_string(),
            Utc::now(),
        )
        .for_request(event.request_id.as_str(), event.employee_id.as_str());

        self.dead_letters.record(letter).await.map_err(|sink_error| {
            error!(
                event_name = "dead_letter.record.failed",
                request_id = %event.request_id,
                error = %sink_error,
                "could not park failed synchronous event"
            );
            sink_error
        })
    }
}

fn required(field: &str, value: &str) -> Result<String, ApplicationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApplicationError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

fn store_failure(store_error: StoreError) -> ApplicationError {
    ApplicationError::Persistence(store_error.to_string())
}
