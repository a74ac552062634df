//! Contracts for the shared state store and the idempotency ledger.
//!
//! Every mutation goes through [`StateStore::commit`], a compare-and-set over
//! record versions. A record's `version` inside a [`StateCommit`] is the
//! version the caller read; the store bumps it on success.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::employee::{AvailabilityRecord, EmployeeId, QuotaRecord};
use crate::domain::outcome::OutcomeEvent;
use crate::domain::request::{LeaveRequest, RequestId};
use crate::ledger::{IdempotencyEntry, IdempotencyKey, LedgerEntryState};
use crate::policy::AdmissionSnapshot;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state store call exceeded {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("stored data could not be decoded: {0}")]
    Decode(String),
    #[error("no {kind} record for employee `{employee_id}`")]
    MissingRecord { kind: &'static str, employee_id: String },
    #[error("employee `{0}` is already onboarded")]
    AlreadyOnboarded(String),
}

impl StoreError {
    /// Missing records and undecodable rows will not heal on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Version that must still hold when the commit lands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionGuard {
    pub employee_id: EmployeeId,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateCommit {
    pub availability: Option<AvailabilityRecord>,
    pub quota: Option<QuotaRecord>,
    /// Version 0 means the request must not exist yet.
    pub request: Option<LeaveRequest>,
    /// Availability versions of every other record the decision depended on.
    pub read_set: Vec<VersionGuard>,
    /// Written in the same transaction when present.
    pub ledger_entry: Option<IdempotencyEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitStatus {
    Applied,
    Conflict { detail: String },
}

impl CommitStatus {
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::Conflict { detail: detail.into() }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_availability(
        &self,
        employee_id: &EmployeeId,
    ) -> Result<Option<AvailabilityRecord>, StoreError>;

    async fn get_quota(&self, employee_id: &EmployeeId) -> Result<Option<QuotaRecord>, StoreError>;

    async fn list_availability(&self) -> Result<Vec<AvailabilityRecord>, StoreError>;

    async fn list_quotas(&self) -> Result<Vec<QuotaRecord>, StoreError>;

    async fn find_request(&self, request_id: &RequestId)
        -> Result<Option<LeaveRequest>, StoreError>;

    async fn list_requests(&self, employee_id: &EmployeeId)
        -> Result<Vec<LeaveRequest>, StoreError>;

    /// Creates the availability and quota records of a new employee.
    async fn onboard(
        &self,
        availability: AvailabilityRecord,
        quota: QuotaRecord,
    ) -> Result<(), StoreError>;

    /// Reads the subject's records, the request, and the whole roster from one
    /// consistent point in time.
    async fn load_snapshot(
        &self,
        employee_id: &EmployeeId,
        request_id: &RequestId,
    ) -> Result<AdmissionSnapshot, StoreError>;

    async fn commit(&self, commit: StateCommit) -> Result<CommitStatus, StoreError>;
}

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyEntry>, StoreError>;

    /// Inserts a `Reserved` entry unless one already exists for the key.
    async fn reserve(&self, entry: IdempotencyEntry) -> Result<(), StoreError>;

    /// Upserts the entry as `Completed` with its outcome.
    async fn record_outcome(&self, entry: IdempotencyEntry) -> Result<(), StoreError>;

    /// Drops completed entries whose retention has lapsed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn has_seen(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        Ok(self
            .find(key)
            .await?
            .map(|entry| entry.state == LedgerEntryState::Completed)
            .unwrap_or(false))
    }

    async fn get_outcome(&self, key: &IdempotencyKey) -> Result<Option<OutcomeEvent>, StoreError> {
        Ok(self.find(key).await?.and_then(|entry| entry.outcome))
    }
}
