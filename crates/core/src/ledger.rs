use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::employee::EmployeeId;
use crate::domain::event::{LeaveEvent, LeaveEventType};
use crate::domain::outcome::OutcomeEvent;
use crate::domain::request::RequestId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub request_id: RequestId,
    pub event_type: LeaveEventType,
}

impl IdempotencyKey {
    pub fn for_event(event: &LeaveEvent) -> Self {
        Self { request_id: event.request_id.clone(), event_type: event.event_type() }
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.request_id, self.event_type.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryState {
    Reserved,
    Completed,
}

impl LedgerEntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reserved" => Some(Self::Reserved),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub key: IdempotencyKey,
    pub employee_id: EmployeeId,
    pub payload_fingerprint: String,
    pub state: LedgerEntryState,
    pub outcome: Option<OutcomeEvent>,
    pub first_seen_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdempotencyEntry {
    pub fn reserved(event: &LeaveEvent, at: DateTime<Utc>) -> Self {
        Self {
            key: IdempotencyKey::for_event(event),
            employee_id: event.employee_id.clone(),
            payload_fingerprint: event.fingerprint(),
            state: LedgerEntryState::Reserved,
            outcome: None,
            first_seen_at: at,
            completed_at: None,
            expires_at: None,
        }
    }

    pub fn completed(
        event: &LeaveEvent,
        outcome: OutcomeEvent,
        first_seen_at: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        let completed_at = outcome.decided_at;
        Self {
            key: IdempotencyKey::for_event(event),
            employee_id: event.employee_id.clone(),
            payload_fingerprint: event.fingerprint(),
            state: LedgerEntryState::Completed,
            outcome: Some(outcome),
            first_seen_at,
            completed_at: Some(completed_at),
            expires_at: Some(completed_at + retention),
        }
    }

    pub fn matches_payload(&self, event: &LeaveEvent) -> bool {
        self.payload_fingerprint == event.fingerprint()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == LedgerEntryState::Completed
            && self.expires_at.map(|expires_at| expires_at <= now).unwrap_or(false)
    }
}
