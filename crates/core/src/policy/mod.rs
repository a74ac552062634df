//! Admission policy engine.
//!
//! `decide` is a pure function of an [`AdmissionSnapshot`] and a [`LeaveEvent`].
//! It never performs I/O; the records it returns are the new values the
//! coordinator will try to commit, still carrying the versions that were read.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AdmissionConfig;
use crate::domain::employee::{AvailabilityRecord, AvailabilityStatus, DateRange, QuotaRecord};
use crate::domain::event::{LeaveEvent, LeaveEventKind};
use crate::domain::outcome::{Decision, DecisionReason, Outcome};
use crate::domain::request::{ClosureKind, LeaveRequest, LeaveRequestStatus, LeaveType};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub minimum_available: u32,
    pub total_employees: Option<u32>,
    pub review_leave_types: BTreeSet<String>,
}

impl AdmissionLimits {
    pub fn new(minimum_available: u32) -> Self {
        Self { minimum_available, total_employees: None, review_leave_types: BTreeSet::new() }
    }

    pub fn with_total_employees(mut self, total: u32) -> Self {
        self.total_employees = Some(total);
        self
    }

    pub fn with_review_type(mut self, leave_type: &str) -> Self {
        self.review_leave_types.insert(leave_type.trim().to_ascii_lowercase());
        self
    }

    pub fn requires_review(&self, leave_type: &LeaveType) -> bool {
        self.review_leave_types.contains(leave_type.as_str())
    }
}

impl From<&AdmissionConfig> for AdmissionLimits {
    fn from(config: &AdmissionConfig) -> Self {
        Self {
            minimum_available: config.minimum_available,
            total_employees: config.total_employees,
            review_leave_types: config.review_leave_types.iter().cloned().collect(),
        }
    }
}

/// Consistent read of everything one decision depends on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub availability: AvailabilityRecord,
    pub quota: QuotaRecord,
    pub request: Option<LeaveRequest>,
    /// Availability records of every employee, the subject included.
    pub roster: Vec<AvailabilityRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityView {
    pub total_employees: u32,
    pub minimum_available: u32,
    pub absent: u32,
}

impl CapacityView {
    /// Largest number of simultaneous absences the invariant allows.
    pub fn absence_limit(&self) -> u32 {
        self.total_employees.saturating_sub(self.minimum_available)
    }

    pub fn available(&self) -> u32 {
        self.total_employees.saturating_sub(self.absent)
    }

    pub fn remaining(&self) -> u32 {
        self.absence_limit().saturating_sub(self.absent)
    }

    pub fn is_breached(&self) -> bool {
        self.absent > self.absence_limit()
    }
}

impl AdmissionSnapshot {
    pub fn total_employees(&self, limits: &AdmissionLimits) -> u32 {
        limits
            .total_employees
            .unwrap_or_else(|| u32::try_from(self.roster.len()).unwrap_or(u32::MAX))
    }

    pub fn capacity(&self, limits: &AdmissionLimits) -> CapacityView {
        capacity_of(&self.roster, limits.minimum_available, self.total_employees(limits))
    }

    /// Slots that would be held during `range` if the subject were admitted for it.
    fn occupancy_with_subject(&self, range: &DateRange) -> u32 {
        let others = self
            .roster
            .iter()
            .filter(|record| record.employee_id != self.availability.employee_id)
            .filter(|record| record.occupies_slot_during(range))
            .count();
        u32::try_from(others).unwrap_or(u32::MAX).saturating_add(1)
    }
}

/// Counts committed `ON_LEAVE` records. Pending slots only compete per date range.
pub fn capacity_of(
    roster: &[AvailabilityRecord],
    minimum_available: u32,
    total_employees: u32,
) -> CapacityView {
    let absent = roster
        .iter()
        .filter(|record| matches!(record.status, AvailabilityStatus::OnLeave))
        .count();
    CapacityView {
        total_employees,
        minimum_available,
        absent: u32::try_from(absent).unwrap_or(u32::MAX),
    }
}

/// New record values a decision wants committed. `None` means untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateChange {
    pub availability: Option<AvailabilityRecord>,
    pub quota: Option<QuotaRecord>,
    pub request: Option<LeaveRequest>,
}

impl StateChange {
    pub fn is_empty(&self) -> bool {
        self.availability.is_none() && self.quota.is_none() && self.request.is_none()
    }

    /// Whether the change takes a capacity slot, which makes every other
    /// availability record part of the decision's read set.
    pub fn claims_slot(&self) -> bool {
        self.availability.as_ref().map(AvailabilityRecord::is_absent).unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyDecision {
    pub outcome: Outcome,
    pub change: StateChange,
}

impl PolicyDecision {
    fn no_op(reason: DecisionReason) -> Self {
        Self { outcome: Outcome::new(Decision::NoOp, reason), change: StateChange::default() }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("snapshot belongs to `{snapshot}` but the event names `{event}`")]
    EmployeeMismatch { snapshot: String, event: String },
    #[error("request `{request_id}` belongs to `{owner}`, not `{employee_id}`")]
    RequestOwnerMismatch { request_id: String, owner: String, employee_id: String },
    #[error("request `{0}` was already submitted")]
    DuplicateSubmission(String),
    #[error("capacity already breached: {absent} absent with a limit of {limit}")]
    CapacityBreached { absent: u32, limit: u32 },
    #[error(transparent)]
    Domain(#[from] DomainError),
}

pub trait AdmissionPolicy: Send + Sync {
    fn decide(
        &self,
        snapshot: &AdmissionSnapshot,
        event: &LeaveEvent,
        decided_at: DateTime<Utc>,
    ) -> Result<PolicyDecision, PolicyError>;
}

#[derive(Clone, Debug)]
pub struct CapacityPolicy {
    limits: AdmissionLimits,
}

impl CapacityPolicy {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    fn ensure_not_breached(&self, snapshot: &AdmissionSnapshot) -> Result<(), PolicyError> {
        let view = snapshot.capacity(&self.limits);
        if view.is_breached() {
            return Err(PolicyError::CapacityBreached {
                absent: view.absent,
                limit: view.absence_limit(),
            });
        }
        Ok(())
    }

    fn has_room(&self, snapshot: &AdmissionSnapshot, range: &DateRange) -> bool {
        let limit = snapshot.capacity(&self.limits).absence_limit();
        snapshot.occupancy_with_subject(range) <= limit
    }

    fn submit(
        &self,
        snapshot: &AdmissionSnapshot,
        event: &LeaveEvent,
        leave_type: &LeaveType,
        range: DateRange,
        at: DateTime<Utc>,
    ) -> Result<PolicyDecision, PolicyError> {
        if let Some(existing) = &snapshot.request {
            return Err(PolicyError::DuplicateSubmission(existing.request_id.0.clone()));
        }
        self.ensure_not_breached(snapshot)?;

        let days = range.days();
        let mut request = LeaveRequest {
            request_id: event.request_id.clone(),
            employee_id: event.employee_id.clone(),
            leave_type: leave_type.clone(),
            range,
            days,
            status: LeaveRequestStatus::Denied,
            decision_reason: DecisionReason::InsufficientQuota,
            decided_at: at,
            reviewed_by: None,
            closure: None,
            version: 0,
            created_at: at,
        };

        let denial = if snapshot.quota.available_days < days {
            Some(DecisionReason::InsufficientQuota)
        } else if snapshot.availability.is_absent() {
            Some(DecisionReason::ActiveLeaveExists)
        } else if !self.has_room(snapshot, &range) {
            Some(DecisionReason::CapacityExceeded)
        } else {
            None
        };

        if let Some(reason) = denial {
            request.decision_reason = reason;
            return Ok(PolicyDecision {
                outcome: Outcome::new(Decision::Denied, reason),
                change: StateChange { request: Some(request), ..StateChange::default() },
            });
        }

        let (decision, reason, status, availability_status, quota) =
            if self.limits.requires_review(leave_type) {
                (
                    Decision::Deferred,
                    DecisionReason::ReviewRequired,
                    LeaveRequestStatus::Pending,
                    AvailabilityStatus::Pending,
                    snapshot.quota.reserve(days, at)?,
                )
            } else {
                (
                    Decision::Approved,
                    DecisionReason::WithinPolicy,
                    LeaveRequestStatus::Approved,
                    AvailabilityStatus::OnLeave,
                    snapshot.quota.consume(days, at)?,
                )
            };

        request.status = status;
        request.decision_reason = reason;
        let availability = snapshot.availability.start_leave(
            availability_status,
            range,
            event.request_id.clone(),
            at,
        );

        Ok(PolicyDecision {
            outcome: Outcome::new(decision, reason),
            change: StateChange {
                availability: Some(availability),
                quota: Some(quota),
                request: Some(request),
            },
        })
    }

    fn release(
        &self,
        snapshot: &AdmissionSnapshot,
        kind: ClosureKind,
        at: DateTime<Utc>,
    ) -> Result<PolicyDecision, PolicyError> {
        let reason = match kind {
            ClosureKind::Cancelled => DecisionReason::Cancelled,
            ClosureKind::Ended => DecisionReason::Ended,
        };
        let request = match &snapshot.request {
            Some(request) if request.is_active() => request,
            _ => return Ok(PolicyDecision::no_op(DecisionReason::NotActive)),
        };

        let quota = match (kind, request.status) {
            (ClosureKind::Cancelled, LeaveRequestStatus::Approved) => {
                Some(snapshot.quota.restore_taken(request.days, at)?)
            }
            (ClosureKind::Cancelled, LeaveRequestStatus::Pending) => {
                Some(snapshot.quota.release_pending(request.days, at)?)
            }
            (ClosureKind::Ended, LeaveRequestStatus::Approved) => None,
            // A leave that was never granted cannot end.
            (ClosureKind::Ended, _) => return Ok(PolicyDecision::no_op(DecisionReason::NotActive)),
            (ClosureKind::Cancelled, LeaveRequestStatus::Denied) => {
                return Ok(PolicyDecision::no_op(DecisionReason::NotActive))
            }
        };

        let availability = if snapshot.availability.holds_request(&request.request_id) {
            Some(snapshot.availability.release(at))
        } else {
            return Err(PolicyError::Domain(DomainError::InvariantViolation(format!(
                "active request `{}` is not held by the availability record of `{}`",
                request.request_id, request.employee_id
            ))));
        };

        Ok(PolicyDecision {
            outcome: Outcome::new(Decision::Released, reason),
            change: StateChange { availability, quota, request: Some(request.close(kind, at)) },
        })
    }

    fn review(
        &self,
        snapshot: &AdmissionSnapshot,
        approve: bool,
        reviewer: &str,
        at: DateTime<Utc>,
    ) -> Result<PolicyDecision, PolicyError> {
        let request = match &snapshot.request {
            Some(request) if request.is_active() && request.status == LeaveRequestStatus::Pending => {
                request
            }
            _ => return Ok(PolicyDecision::no_op(DecisionReason::NotActive)),
        };
        if !snapshot.availability.holds_request(&request.request_id) {
            return Err(PolicyError::Domain(DomainError::InvariantViolation(format!(
                "pending request `{}` is not held by the availability record",
                request.request_id
            ))));
        }

        if approve {
            self.ensure_not_breached(snapshot)?;
        }

        let admit = approve && self.has_room(snapshot, &request.range);
        if admit {
            let quota = snapshot.quota.commit_pending(request.days, at)?;
            let availability = snapshot.availability.start_leave(
                AvailabilityStatus::OnLeave,
                request.range,
                request.request_id.clone(),
                at,
            );
            let reason = DecisionReason::ReviewApproved;
            return Ok(PolicyDecision {
                outcome: Outcome::new(Decision::Approved, reason),
                change: StateChange {
                    availability: Some(availability),
                    quota: Some(quota),
                    request: Some(request.resolve_review(
                        LeaveRequestStatus::Approved,
                        reason,
                        reviewer,
                        at,
                    )),
                },
            });
        }

        let reason =
            if approve { DecisionReason::CapacityExceeded } else { DecisionReason::ReviewRejected };
        Ok(PolicyDecision {
            outcome: Outcome::new(Decision::Denied, reason),
            change: StateChange {
                availability: Some(snapshot.availability.release(at)),
                quota: Some(snapshot.quota.release_pending(request.days, at)?),
                request: Some(request.resolve_review(
                    LeaveRequestStatus::Denied,
                    reason,
                    reviewer,
                    at,
                )),
            },
        })
    }
}

impl AdmissionPolicy for CapacityPolicy {
    fn decide(
        &self,
        snapshot: &AdmissionSnapshot,
        event: &LeaveEvent,
        decided_at: DateTime<Utc>,
    ) -> Result<PolicyDecision, PolicyError> {
        if snapshot.availability.employee_id != event.employee_id {
            return Err(PolicyError::EmployeeMismatch {
                snapshot: snapshot.availability.employee_id.0.clone(),
                event: event.employee_id.0.clone(),
            });
        }
        if let Some(request) = &snapshot.request {
            if request.employee_id != event.employee_id {
                return Err(PolicyError::RequestOwnerMismatch {
                    request_id: request.request_id.0.clone(),
                    owner: request.employee_id.0.clone(),
                    employee_id: event.employee_id.0.clone(),
                });
            }
        }

        match &event.kind {
            LeaveEventKind::Submitted { leave_type, range } => {
                self.submit(snapshot, event, leave_type, *range, decided_at)
            }
            LeaveEventKind::Cancelled => self.release(snapshot, ClosureKind::Cancelled, decided_at),
            LeaveEventKind::Ended => self.release(snapshot, ClosureKind::Ended, decided_at),
            LeaveEventKind::Reviewed { approve, reviewer } => {
                self.review(snapshot, *approve, reviewer, decided_at)
            }
        }
    }
}
