use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::employee::EmployeeId;
use crate::domain::event::LeaveEventType;
use crate::domain::request::{LeaveRequestStatus, RequestId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Denied,
    Deferred,
    /// A cancel or leave-end took effect and freed the slot.
    Released,
    /// The event had nothing to act on.
    NoOp,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Denied => "DENIED",
            Self::Deferred => "DEFERRED",
            Self::Released => "RELEASED",
            Self::NoOp => "NO_OP",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "APPROVED" => Some(Self::Approved),
            "DENIED" => Some(Self::Denied),
            "DEFERRED" => Some(Self::Deferred),
            "RELEASED" => Some(Self::Released),
            "NO_OP" => Some(Self::NoOp),
            _ => None,
        }
    }

    pub fn for_status(status: LeaveRequestStatus) -> Self {
        match status {
            LeaveRequestStatus::Pending => Self::Deferred,
            LeaveRequestStatus::Approved => Self::Approved,
            LeaveRequestStatus::Denied => Self::Denied,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    WithinPolicy,
    InsufficientQuota,
    ActiveLeaveExists,
    CapacityExceeded,
    ReviewRequired,
    ReviewApproved,
    ReviewRejected,
    Cancelled,
    Ended,
    NotActive,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WithinPolicy => "WITHIN_POLICY",
            Self::InsufficientQuota => "INSUFFICIENT_QUOTA",
            Self::ActiveLeaveExists => "ACTIVE_LEAVE_EXISTS",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
            Self::ReviewRequired => "REVIEW_REQUIRED",
            Self::ReviewApproved => "REVIEW_APPROVED",
            Self::ReviewRejected => "REVIEW_REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::Ended => "ENDED",
            Self::NotActive => "NOT_ACTIVE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "WITHIN_POLICY" => Some(Self::WithinPolicy),
            "INSUFFICIENT_QUOTA" => Some(Self::InsufficientQuota),
            "ACTIVE_LEAVE_EXISTS" => Some(Self::ActiveLeaveExists),
            "CAPACITY_EXCEEDED" => Some(Self::CapacityExceeded),
            "REVIEW_REQUIRED" => Some(Self::ReviewRequired),
            "REVIEW_APPROVED" => Some(Self::ReviewApproved),
            "REVIEW_REJECTED" => Some(Self::ReviewRejected),
            "CANCELLED" => Some(Self::Cancelled),
            "ENDED" => Some(Self::Ended),
            "NOT_ACTIVE" => Some(Self::NotActive),
            _ => None,
        }
    }
}

/// What the policy engine concluded for one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub decision: Decision,
    pub reason: DecisionReason,
}

impl Outcome {
    pub fn new(decision: Decision, reason: DecisionReason) -> Self {
        Self { decision, reason }
    }
}

/// Decision record surfaced to downstream consumers, which deduplicate on
/// `(request_id, event_type)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub request_id: RequestId,
    pub employee_id: EmployeeId,
    pub event_type: LeaveEventType,
    pub decision: Decision,
    pub reason: DecisionReason,
    pub decided_at: DateTime<Utc>,
}

impl OutcomeEvent {
    pub fn outcome(&self) -> Outcome {
        Outcome::new(self.decision, self.reason)
    }
}
