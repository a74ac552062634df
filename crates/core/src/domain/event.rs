use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::employee::{DateRange, EmployeeId};
use crate::domain::request::{LeaveType, RequestId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaveEventType {
    Submitted,
    Cancelled,
    Ended,
    Reviewed,
}

impl LeaveEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Cancelled => "CANCELLED",
            Self::Ended => "ENDED",
            Self::Reviewed => "REVIEWED",
        }
    }

    /// Accepts both the short wire names and the `REQUEST_*`/`LEAVE_*` lifecycle names.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SUBMITTED" | "REQUEST_SUBMITTED" => Some(Self::Submitted),
            "CANCELLED" | "REQUEST_CANCELLED" => Some(Self::Cancelled),
            "ENDED" | "LEAVE_ENDED" => Some(Self::Ended),
            "REVIEWED" | "REQUEST_REVIEWED" => Some(Self::Reviewed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EventDecodeError {
    #[error("event payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("event is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown event type `{0}`")]
    UnknownEventType(String),
    #[error("field `{field}` has invalid value `{value}`")]
    InvalidField { field: &'static str, value: String },
    #[error("start_date {start} is after end_date {end}")]
    InvertedRange { start: NaiveDate, end: NaiveDate },
}

/// Inbound event as it appears on the stream. Every field is optional so that
/// validation can name exactly what is missing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLeaveEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(rename = "type", alias = "event_type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leave_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeaveEventKind {
    Submitted { leave_type: LeaveType, range: DateRange },
    Cancelled,
    Ended,
    Reviewed { approve: bool, reviewer: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveEvent {
    pub request_id: RequestId,
    pub employee_id: EmployeeId,
    pub issued_at: DateTime<Utc>,
    pub kind: LeaveEventKind,
}

#[derive(Serialize)]
struct CanonicalPayload<'a> {
    request_id: &'a str,
    employee_id: &'a str,
    event_type: &'static str,
    kind: &'a LeaveEventKind,
}

impl LeaveEvent {
    pub fn decode(payload: &[u8]) -> Result<Self, EventDecodeError> {
        let wire = serde_json::from_slice::<WireLeaveEvent>(payload)
            .map_err(|error| EventDecodeError::InvalidJson(error.to_string()))?;
        Self::from_wire(wire)
    }

    pub fn from_wire(wire: WireLeaveEvent) -> Result<Self, EventDecodeError> {
        let request_id = required(wire.request_id, "request_id")?;
        let employee_id = required(wire.employee_id, "employee_id")?;
        let raw_type = required(wire.event_type, "type")?;
        let event_type = LeaveEventType::parse(&raw_type)
            .ok_or(EventDecodeError::UnknownEventType(raw_type))?;
        let raw_issued_at = required(wire.issued_at, "issued_at")?;
        let issued_at = DateTime::parse_from_rfc3339(&raw_issued_at)
            .map(|value| value.with_timezone(&Utc))
            .map_err(|_| EventDecodeError::InvalidField { field: "issued_at", value: raw_issued_at })?;

        let kind = match event_type {
            LeaveEventType::Submitted => {
                let raw_leave_type = required(wire.leave_type, "leave_type")?;
                let leave_type = LeaveType::new(&raw_leave_type).ok_or(
                    EventDecodeError::InvalidField { field: "leave_type", value: raw_leave_type },
                )?;
                let start = parse_date(required(wire.start_date, "start_date")?, "start_date")?;
                let end = parse_date(required(wire.end_date, "end_date")?, "end_date")?;
                let range = DateRange::new(start, end)
                    .map_err(|_| EventDecodeError::InvertedRange { start, end })?;
                LeaveEventKind::Submitted { leave_type, range }
            }
            LeaveEventType::Cancelled => LeaveEventKind::Cancelled,
            LeaveEventType::Ended => LeaveEventKind::Ended,
            LeaveEventType::Reviewed => LeaveEventKind::Reviewed {
                approve: wire.approve.ok_or(EventDecodeError::MissingField("approve"))?,
                reviewer: required(wire.reviewer, "reviewer")?,
            },
        };

        Ok(Self { request_id: RequestId(request_id), employee_id: EmployeeId(employee_id), issued_at, kind })
    }

    pub fn to_wire(&self) -> WireLeaveEvent {
        let mut wire = WireLeaveEvent {
            request_id: Some(self.request_id.0.clone()),
            employee_id: Some(self.employee_id.0.clone()),
            event_type: Some(self.event_type().as_str().to_string()),
            issued_at: Some(self.issued_at.to_rfc3339()),
            ..WireLeaveEvent::default()
        };
        match &self.kind {
            LeaveEventKind::Submitted { leave_type, range } => {
                wire.leave_type = Some(leave_type.as_str().to_string());
                wire.start_date = Some(range.start.to_string());
                wire.end_date = Some(range.end.to_string());
            }
            LeaveEventKind::Reviewed { approve, reviewer } => {
                wire.approve = Some(*approve);
                wire.reviewer = Some(reviewer.clone());
            }
            LeaveEventKind::Cancelled | LeaveEventKind::Ended => {}
        }
        wire
    }

    pub fn event_type(&self) -> LeaveEventType {
        match self.kind {
            LeaveEventKind::Submitted { .. } => LeaveEventType::Submitted,
            LeaveEventKind::Cancelled => LeaveEventType::Cancelled,
            LeaveEventKind::Ended => LeaveEventType::Ended,
            LeaveEventKind::Reviewed { .. } => LeaveEventType::Reviewed,
        }
    }

    /// SHA-256 over the decision-relevant payload. `issued_at` is left out so a
    /// producer retry with a fresh timestamp is still recognised as the same event.
    pub fn fingerprint(&self) -> String {
        let canonical = CanonicalPayload {
            request_id: self.request_id.as_str(),
            employee_id: self.employee_id.as_str(),
            event_type: self.event_type().as_str(),
            kind: &self.kind,
        };
        let encoded = serde_json::to_string(&canonical)
            .unwrap_or_else(|error| format!("serialization_error:{error}"));
        let mut hasher = Sha256::new();
        hasher.update(encoded.as_bytes());
        format!("sha256:{:x}", hasher.finalize())
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, EventDecodeError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(EventDecodeError::MissingField(field))
}

fn parse_date(value: String, field: &'static str) -> Result<NaiveDate, EventDecodeError> {
    NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .map_err(|_| EventDecodeError::InvalidField { field, value })
}
