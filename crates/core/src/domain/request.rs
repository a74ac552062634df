use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::employee::{DateRange, EmployeeId};
use crate::domain::outcome::DecisionReason;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Free-form leave category, stored lowercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaveType(String);

impl LeaveType {
    pub fn new(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        (!normalized.is_empty()).then_some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaveRequestStatus {
    Pending,
    Approved,
    Denied,
}

impl LeaveRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Denied => "DENIED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "APPROVED" => Some(Self::Approved),
            "DENIED" => Some(Self::Denied),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureKind {
    Cancelled,
    Ended,
}

impl ClosureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cancelled" => Some(Self::Cancelled),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// End of a request's lifecycle. Written once and never cleared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestClosure {
    pub kind: ClosureKind,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub request_id: RequestId,
    pub employee_id: EmployeeId,
    pub leave_type: LeaveType,
    pub range: DateRange,
    pub days: u32,
    pub status: LeaveRequestStatus,
    pub decision_reason: DecisionReason,
    pub decided_at: DateTime<Utc>,
    pub reviewed_by: Option<String>,
    pub closure: Option<RequestClosure>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl LeaveRequest {
    /// Holds (or is waiting on) a capacity slot.
    pub fn is_active(&self) -> bool {
        self.closure.is_none()
            && matches!(self.status, LeaveRequestStatus::Approved | LeaveRequestStatus::Pending)
    }

    pub fn is_closed(&self) -> bool {
        self.closure.is_some()
    }

    pub fn close(&self, kind: ClosureKind, at: DateTime<Utc>) -> Self {
        Self { closure: Some(RequestClosure { kind, at }), ..self.clone() }
    }

    pub fn resolve_review(
        &self,
        status: LeaveRequestStatus,
        reason: DecisionReason,
        reviewer: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            decision_reason: reason,
            decided_at: at,
            reviewed_by: Some(reviewer.to_string()),
            ..self.clone()
        }
    }
}
