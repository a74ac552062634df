//! In-memory state store and idempotency ledger.
//!
//! Both contracts share one lock so a commit and its ledger entry land
//! together, matching the transactional behaviour of the SQL store. Fault
//! hooks let tests reproduce outages, lost races and the crash window between
//! a state commit and its ledger completion.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Barrier, RwLock};

use crate::domain::employee::{AvailabilityRecord, EmployeeId, QuotaRecord};
use crate::domain::request::{LeaveRequest, RequestId};
use crate::ledger::{IdempotencyEntry, IdempotencyKey, LedgerEntryState};
use crate::policy::AdmissionSnapshot;
use crate::store::{CommitStatus, IdempotencyLedger, StateCommit, StateStore, StoreError};

#[derive(Default)]
struct MemoryState {
    availability: BTreeMap<EmployeeId, AvailabilityRecord>,
    quotas: BTreeMap<EmployeeId, QuotaRecord>,
    requests: BTreeMap<RequestId, LeaveRequest>,
    ledger: HashMap<IdempotencyKey, IdempotencyEntry>,
}

#[derive(Default)]
struct Faults {
    unavailable_snapshots: u32,
    forced_conflicts: u32,
    failed_completions: u32,
    stalled_completions: u32,
    dropped_commit_entries: u32,
    snapshot_barrier: Option<(Arc<Barrier>, usize)>,
}

#[derive(Default)]
pub struct InMemoryAdmissionStore {
    state: RwLock<MemoryState>,
    faults: Mutex<Faults>,
}

impl InMemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` snapshot reads fail as if the store were down.
    pub fn fail_next_snapshots(&self, count: u32) {
        self.with_faults(|faults| faults.unavailable_snapshots = count);
    }

    /// The next `count` commits report a conflict without applying anything.
    pub fn force_conflicts(&self, count: u32) {
        self.with_faults(|faults| faults.forced_conflicts = count);
    }

    /// The next `count` ledger completions fail after the state commit landed.
    pub fn fail_next_completions(&self, count: u32) {
        self.with_faults(|faults| faults.failed_completions = count);
    }

    /// The next `count` ledger completions never return, as if the backend hung.
    pub fn stall_next_completions(&self, count: u32) {
        self.with_faults(|faults| faults.stalled_completions = count);
    }

    /// The next `count` commits apply state but lose their in-transaction ledger entry.
    pub fn drop_next_commit_entries(&self, count: u32) {
        self.with_faults(|faults| faults.dropped_commit_entries = count);
    }

    /// The next `parties` snapshot reads wait for each other before returning,
    /// so concurrent handlers all decide on the same state.
    pub fn synchronize_next_snapshots(&self, parties: usize) {
        self.with_faults(|faults| {
            faults.snapshot_barrier = Some((Arc::new(Barrier::new(parties)), parties));
        });
    }

    pub async fn ledger_entries(&self) -> Vec<IdempotencyEntry> {
        self.state.read().await.ledger.values().cloned().collect()
    }

    fn with_faults<T>(&self, apply: impl FnOnce(&mut Faults) -> T) -> T {
        match self.faults.lock() {
            Ok(mut faults) => apply(&mut faults),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }

    fn take(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            return true;
        }
        false
    }

    fn take_barrier(&self) -> Option<Arc<Barrier>> {
        self.with_faults(|faults| match faults.snapshot_barrier.take() {
            Some((barrier, remaining)) if remaining > 1 => {
                faults.snapshot_barrier = Some((barrier.clone(), remaining - 1));
                Some(barrier)
            }
            Some((barrier, _)) => Some(barrier),
            None => None,
        })
    }
}

fn check_commit(state: &MemoryState, commit: &StateCommit) -> Option<String> {
    for guard in &commit.read_set {
        let current = state.availability.get(&guard.employee_id).map(|record| record.version);
        if current != Some(guard.version) {
            return Some(format!(
                "availability of `{}` moved from version {} to {:?}",
                guard.employee_id, guard.version, current
            ));
        }
    }

    if let Some(record) = &commit.availability {
        let current = state.availability.get(&record.employee_id).map(|record| record.version);
        if current != Some(record.version) {
            return Some(format!("availability of `{}` changed", record.employee_id));
        }
    }

    if let Some(record) = &commit.quota {
        let current = state.quotas.get(&record.employee_id).map(|record| record.version);
        if current != Some(record.version) {
            return Some(format!("quota of `{}` changed", record.employee_id));
        }
    }

    if let Some(request) = &commit.request {
        let current = state.requests.get(&request.request_id).map(|request| request.version);
        let expected = (request.version > 0).then_some(request.version);
        if current != expected {
            return Some(format!("request `{}` changed", request.request_id));
        }
    }

    if let Some(entry) = &commit.ledger_entry {
        let completed = state
            .ledger
            .get(&entry.key)
            .map(|existing| existing.state == LedgerEntryState::Completed)
            .unwrap_or(false);
        if completed {
            return Some(format!("ledger entry `{}` already completed", entry.key));
        }
    }

    None
}

#[async_trait]
impl StateStore for InMemoryAdmissionStore {
    async fn get_availability(
        &self,
        employee_id: &EmployeeId,
    ) -> Result<Option<AvailabilityRecord>, StoreError> {
        Ok(self.state.read().await.availability.get(employee_id).cloned())
    }

    async fn get_quota(&self, employee_id: &EmployeeId) -> Result<Option<QuotaRecord>, StoreError> {
        Ok(self.state.read().await.quotas.get(employee_id).cloned())
    }

    async fn list_availability(&self) -> Result<Vec<AvailabilityRecord>, StoreError> {
        Ok(self.state.read().await.availability.values().cloned().collect())
    }

    async fn list_quotas(&self) -> Result<Vec<QuotaRecord>, StoreError> {
        Ok(self.state.read().await.quotas.values().cloned().collect())
    }

    async fn find_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<LeaveRequest>, StoreError> {
        Ok(self.state.read().await.requests.get(request_id).cloned())
    }

    async fn list_requests(
        &self,
        employee_id: &EmployeeId,
    ) -> Result<Vec<LeaveRequest>, StoreError> {
        let state = self.state.read().await;
        let mut requests: Vec<LeaveRequest> = state
            .requests
            .values()
            .filter(|request| &request.employee_id == employee_id)
            .cloned()
            .collect();
        requests.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        Ok(requests)
    }

    async fn onboard(
        &self,
        availability: AvailabilityRecord,
        quota: QuotaRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.availability.contains_key(&availability.employee_id) {
            return Err(StoreError::AlreadyOnboarded(availability.employee_id.0.clone()));
        }
        state.quotas.insert(quota.employee_id.clone(), QuotaRecord { version: 1, ..quota });
        state
            .availability
            .insert(availability.employee_id.clone(), AvailabilityRecord { version: 1, ..availability });
        Ok(())
    }

    async fn load_snapshot(
        &self,
        employee_id: &EmployeeId,
        request_id: &RequestId,
    ) -> Result<AdmissionSnapshot, StoreError> {
        if self.with_faults(|faults| Self::take(&mut faults.unavailable_snapshots)) {
            return Err(StoreError::Unavailable("injected snapshot outage".to_string()));
        }

        let snapshot = {
            let state = self.state.read().await;
            let availability = state.availability.get(employee_id).cloned().ok_or_else(|| {
                StoreError::MissingRecord { kind: "availability", employee_id: employee_id.0.clone() }
            })?;
            let quota = state.quotas.get(employee_id).cloned().ok_or_else(|| {
                StoreError::MissingRecord { kind: "quota", employee_id: employee_id.0.clone() }
            })?;
            AdmissionSnapshot {
                availability,
                quota,
                request: state.requests.get(request_id).cloned(),
                roster: state.availability.values().cloned().collect(),
            }
        };

        if let Some(barrier) = self.take_barrier() {
            barrier.wait().await;
        }
        Ok(snapshot)
    }

    async fn commit(&self, commit: StateCommit) -> Result<CommitStatus, StoreError> {
        if self.with_faults(|faults| Self::take(&mut faults.forced_conflicts)) {
            return Ok(CommitStatus::conflict("injected conflict"));
        }

        let mut state = self.state.write().await;
        if let Some(detail) = check_commit(&state, &commit) {
            return Ok(CommitStatus::Conflict { detail });
        }

        if let Some(record) = commit.availability {
            let version = record.version + 1;
            state.availability.insert(record.employee_id.clone(), AvailabilityRecord { version, ..record });
        }
        if let Some(record) = commit.quota {
            let version = record.version + 1;
            state.quotas.insert(record.employee_id.clone(), QuotaRecord { version, ..record });
        }
        if let Some(request) = commit.request {
            let version = request.version + 1;
            state.requests.insert(request.request_id.clone(), LeaveRequest { version, ..request });
        }
        if let Some(entry) = commit.ledger_entry {
            if !self.with_faults(|faults| Self::take(&mut faults.dropped_commit_entries)) {
                state.ledger.insert(entry.key.clone(), entry);
            }
        }

        Ok(CommitStatus::Applied)
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryAdmissionStore {
    async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyEntry>, StoreError> {
        Ok(self.state.read().await.ledger.get(key).cloned())
    }

    async fn reserve(&self, entry: IdempotencyEntry) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.ledger.entry(entry.key.clone()).or_insert(entry);
        Ok(())
    }

    async fn record_outcome(&self, entry: IdempotencyEntry) -> Result<(), StoreError> {
        if self.with_faults(|faults| Self::take(&mut faults.failed_completions)) {
            return Err(StoreError::Unavailable("injected crash before ledger completion".into()));
        }
        if self.with_faults(|faults| Self::take(&mut faults.stalled_completions)) {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.write().await;
        let first_seen_at = state
            .ledger
            .get(&entry.key)
            .map(|existing| existing.first_seen_at)
            .unwrap_or(entry.first_seen_at);
        state.ledger.insert(entry.key.clone(), IdempotencyEntry { first_seen_at, ..entry });
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let before = state.ledger.len();
        state.ledger.retain(|_, entry| !entry.is_expired(now));
        Ok((before - state.ledger.len()) as u64)
    }
}
