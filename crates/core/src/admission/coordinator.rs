use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::admission::error::AdmissionError;
use crate::admission::retry::Backoff;
use crate::config::{AdmissionConfig, LedgerMode};
use crate::domain::event::{LeaveEvent, LeaveEventKind};
use crate::domain::outcome::{Decision, DecisionReason, OutcomeEvent};
use crate::domain::request::ClosureKind;
use crate::ledger::{IdempotencyEntry, IdempotencyKey, LedgerEntryState};
use crate::policy::{AdmissionPolicy, AdmissionSnapshot, StateChange};
use crate::publisher::OutcomeFanout;
use crate::store::{CommitStatus, IdempotencyLedger, StateCommit, StateStore, StoreError, VersionGuard};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub max_commit_attempts: u32,
    pub backoff: Backoff,
    pub handle_timeout: Duration,
    pub ledger_mode: LedgerMode,
    pub ledger_retention: chrono::Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            max_commit_attempts: 5,
            backoff: Backoff::default(),
            handle_timeout: Duration::from_secs(5),
            ledger_mode: LedgerMode::Transactional,
            ledger_retention: chrono::Duration::hours(168),
        }
    }
}

impl From<&AdmissionConfig> for AdmissionSettings {
    fn from(config: &AdmissionConfig) -> Self {
        // Ten years is far beyond any redelivery window.
        let retention_hours = i64::try_from(config.ledger_retention_hours.min(87_600)).unwrap_or(87_600);
        Self {
            max_commit_attempts: config.max_commit_attempts,
            backoff: Backoff::new(config.backoff_base_ms, config.backoff_max_ms),
            handle_timeout: Duration::from_millis(config.handle_timeout_ms),
            ledger_mode: config.ledger_mode,
            ledger_retention: chrono::Duration::hours(retention_hours),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandleDisposition {
    /// Decided and committed by this call.
    Applied { attempts: u32 },
    /// A completed ledger entry already held the outcome.
    Replayed,
    /// The store already reflected the event; only the ledger entry was written.
    Reconciled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleReport {
    pub outcome: OutcomeEvent,
    pub disposition: HandleDisposition,
}

/// Drives read, decide, conditional commit, ledger and publish for one event.
///
/// In [`LedgerMode::Transactional`] the ledger entry travels inside the
/// [`StateCommit`], so `store` and `ledger` must share one backing store.
pub struct AdmissionCoordinator {
    store: Arc<dyn StateStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    policy: Arc<dyn AdmissionPolicy>,
    publisher: OutcomeFanout,
    settings: AdmissionSettings,
}

impl AdmissionCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        policy: Arc<dyn AdmissionPolicy>,
        publisher: OutcomeFanout,
        settings: AdmissionSettings,
    ) -> Self {
        Self { store, ledger, policy, publisher, settings }
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub async fn handle(&self, event: &LeaveEvent) -> Result<HandleReport, AdmissionError> {
        let key = IdempotencyKey::for_event(event);
        let report = self.admit(event, &key).await?;
        // An outbox failure keeps the event unacknowledged; redelivery replays
        // the outcome from the ledger and offers it again.
        let published = self.publisher.publish(&report.outcome).await?;
        if !published.deferred.is_empty() {
            debug!(
                event_name = "admission.outcome.deferred",
                request_id = %event.request_id,
                publishers = ?published.deferred,
                "outcome queued in the outbox for some publishers"
            );
        }
        Ok(report)
    }

    async fn admit(
        &self,
        event: &LeaveEvent,
        key: &IdempotencyKey,
    ) -> Result<HandleReport, AdmissionError> {
        let deadline = Instant::now() + self.settings.handle_timeout;
        let mut first_seen_at = Utc::now();

        match self.bounded(deadline, self.ledger.find(key)).await? {
            Some(entry) if !entry.matches_payload(event) => {
                return Err(AdmissionError::malformed(format!(
                    "`{key}` was already recorded with a different payload"
                )));
            }
            Some(entry) => {
                if entry.state == LedgerEntryState::Completed {
                    if let Some(outcome) = entry.outcome {
                        info!(
                            event_name = "admission.decision.replayed",
                            request_id = %event.request_id,
                            employee_id = %event.employee_id,
                            decision = outcome.decision.as_str(),
                            "redelivered event answered from the ledger"
                        );
                        return Ok(HandleReport { outcome, disposition: HandleDisposition::Replayed });
                    }
                }
                first_seen_at = entry.first_seen_at;
            }
            None if self.settings.ledger_mode == LedgerMode::ReserveThenComplete => {
                self.bounded(deadline, self.ledger.reserve(IdempotencyEntry::reserved(event, first_seen_at)))
                    .await?;
            }
            None => {}
        }

        let max_attempts = self.settings.max_commit_attempts.max(1);
        for attempt in 1..=max_attempts {
            let snapshot = self
                .bounded(deadline, self.store.load_snapshot(&event.employee_id, &event.request_id))
                .await?;

            if let Some(outcome) = already_applied(&snapshot, event) {
                let entry = IdempotencyEntry::completed(
                    event,
                    outcome.clone(),
                    first_seen_at,
                    self.settings.ledger_retention,
                );
                self.bounded(deadline, self.ledger.record_outcome(entry)).await?;
                info!(
                    event_name = "admission.ledger.reconciled",
                    request_id = %event.request_id,
                    employee_id = %event.employee_id,
                    decision = outcome.decision.as_str(),
                    "store already reflected the event; ledger entry written without reapplying"
                );
                return Ok(HandleReport { outcome, disposition: HandleDisposition::Reconciled });
            }

            let decided_at = Utc::now();
            let decision = self.policy.decide(&snapshot, event, decided_at)?;
            let outcome = OutcomeEvent {
                request_id: event.request_id.clone(),
                employee_id: event.employee_id.clone(),
                event_type: event.event_type(),
                decision: decision.outcome.decision,
                reason: decision.outcome.reason,
                decided_at,
            };
            let entry = IdempotencyEntry::completed(
                event,
                outcome.clone(),
                first_seen_at,
                self.settings.ledger_retention,
            );

            if decision.change.is_empty() {
                self.bounded(deadline, self.ledger.record_outcome(entry)).await?;
                self.log_committed(event, &outcome, attempt);
                return Ok(HandleReport { outcome, disposition: HandleDisposition::Applied { attempts: attempt } });
            }

            let in_transaction = self.settings.ledger_mode == LedgerMode::Transactional;
            let commit = build_commit(&snapshot, decision.change, in_transaction.then(|| entry.clone()));

            // The conditional write is never raced against the deadline.
            match self.store.commit(commit).await? {
                CommitStatus::Applied => {
                    if !in_transaction {
                        self.bounded(deadline, self.ledger.record_outcome(entry)).await?;
                    }
                    self.log_committed(event, &outcome, attempt);
                    return Ok(HandleReport { outcome, disposition: HandleDisposition::Applied { attempts: attempt } });
                }
                CommitStatus::Conflict { detail } => {
                    debug!(
                        event_name = "admission.commit.conflict",
                        request_id = %event.request_id,
                        employee_id = %event.employee_id,
                        attempt,
                        detail = %detail,
                        "conditional write lost a race, re-reading state"
                    );
                    if attempt < max_attempts {
                        let delay = self.settings.backoff.jittered(attempt - 1);
                        if Instant::now() + delay >= deadline {
                            return Err(self.timed_out());
                        }
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        warn!(
            event_name = "admission.concurrency.exhausted",
            request_id = %event.request_id,
            employee_id = %event.employee_id,
            attempts = max_attempts,
            "conditional write retry budget exhausted"
        );
        Err(AdmissionError::ConcurrencyExhausted { key: key.to_string(), attempts: max_attempts })
    }

    async fn bounded<T>(
        &self,
        deadline: Instant,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, AdmissionError> {
        match tokio::time::timeout_at(deadline, call).await {
            Ok(result) => result.map_err(AdmissionError::from),
            Err(_) => Err(self.timed_out()),
        }
    }

    fn timed_out(&self) -> AdmissionError {
        let timeout_ms = u64::try_from(self.settings.handle_timeout.as_millis()).unwrap_or(u64::MAX);
        AdmissionError::TransientStore(StoreError::Timeout { timeout_ms })
    }

    fn log_committed(&self, event: &LeaveEvent, outcome: &OutcomeEvent, attempts: u32) {
        info!(
            event_name = "admission.decision.committed",
            request_id = %event.request_id,
            employee_id = %event.employee_id,
            event_type = outcome.event_type.as_str(),
            decision = outcome.decision.as_str(),
            reason = outcome.reason.as_str(),
            attempts,
            "leave event decided"
        );
    }
}

fn build_commit(
    snapshot: &AdmissionSnapshot,
    change: StateChange,
    ledger_entry: Option<IdempotencyEntry>,
) -> StateCommit {
    let subject = &snapshot.availability.employee_id;
    let mut read_set = Vec::new();
    if change.availability.is_none() {
        read_set.push(VersionGuard {
            employee_id: subject.clone(),
            version: snapshot.availability.version,
        });
    }
    if change.claims_slot() {
        read_set.extend(
            snapshot
                .roster
                .iter()
                .filter(|record| &record.employee_id != subject)
                .map(|record| VersionGuard {
                    employee_id: record.employee_id.clone(),
                    version: record.version,
                }),
        );
    }

    StateCommit {
        availability: change.availability,
        quota: change.quota,
        request: change.request,
        read_set,
        ledger_entry,
    }
}

/// Rebuilds the outcome of an event whose effect is already in the store.
fn already_applied(snapshot: &AdmissionSnapshot, event: &LeaveEvent) -> Option<OutcomeEvent> {
    let request = snapshot.request.as_ref()?;
    if request.employee_id != event.employee_id {
        return None;
    }

    let (decision, reason, decided_at) = match &event.kind {
        LeaveEventKind::Submitted { .. } => {
            if request.reviewed_by.is_some() {
                (Decision::Deferred, DecisionReason::ReviewRequired, request.created_at)
            } else {
                (Decision::for_status(request.status), request.decision_reason, request.decided_at)
            }
        }
        LeaveEventKind::Cancelled => match request.closure {
            Some(closure) if closure.kind == ClosureKind::Cancelled => {
                (Decision::Released, DecisionReason::Cancelled, closure.at)
            }
            _ => return None,
        },
        LeaveEventKind::Ended => match request.closure {
            Some(closure) if closure.kind == ClosureKind::Ended => {
                (Decision::Released, DecisionReason::Ended, closure.at)
            }
            _ => return None,
        },
        LeaveEventKind::Reviewed { .. } => {
            request.reviewed_by.as_ref()?;
            (Decision::for_status(request.status), request.decision_reason, request.decided_at)
        }
    };

    Some(OutcomeEvent {
        request_id: event.request_id.clone(),
        employee_id: event.employee_id.clone(),
        event_type: event.event_type(),
        decision,
        reason,
        decided_at,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{NaiveDate, Utc};

    use super::{AdmissionCoordinator, AdmissionSettings, HandleDisposition};
    use crate::admission::error::AdmissionError;
    use crate::admission::retry::Backoff;
    use crate::config::LedgerMode;
    use crate::domain::employee::{AvailabilityRecord, DateRange, EmployeeId, QuotaRecord};
    use crate::domain::event::{LeaveEvent, LeaveEventKind};
    use crate::domain::outcome::{Decision, DecisionReason, OutcomeEvent};
    use crate::domain::request::{LeaveType, RequestId};
    use crate::memory::InMemoryAdmissionStore;
    use crate::policy::{AdmissionLimits, CapacityPolicy};
    use crate::outbox::InMemoryOutcomeOutbox;
    use crate::publisher::{
        InMemoryOutcomePublisher, OutcomeFanout, OutcomePublisher, PublishError, PublishRetryPolicy,
    };
    use crate::store::{IdempotencyLedger, StateStore, StoreError};

    struct RefusingPublisher;

    #[async_trait::async_trait]
    impl OutcomePublisher for RefusingPublisher {
        fn name(&self) -> &str {
            "refusing"
        }

        async fn publish(&self, _outcome: &OutcomeEvent) -> Result<(), PublishError> {
            Err(PublishError::new("refusing", "503 service unavailable"))
        }
    }

    struct Harness {
        store: Arc<InMemoryAdmissionStore>,
        published: InMemoryOutcomePublisher,
        coordinator: AdmissionCoordinator,
    }

    async fn harness(staff: usize, minimum_available: u32, mode: LedgerMode) -> Harness {
        let store = Arc::new(InMemoryAdmissionStore::new());
        for index in 0..staff {
            let employee = EmployeeId(format!("e-{index}"));
            store
                .onboard(
                    AvailabilityRecord::onboard(employee.clone(), Utc::now()),
                    QuotaRecord::onboard(employee, 20, 0, 0, Utc::now()).expect("quota"),
                )
                .await
                .expect("onboard");
        }
        let published = InMemoryOutcomePublisher::default();
        let fanout = OutcomeFanout::new(PublishRetryPolicy::default())
            .with_publisher(Arc::new(published.clone()));
        let settings = AdmissionSettings {
            max_commit_attempts: 3,
            backoff: Backoff::new(0, 0),
            handle_timeout: Duration::from_secs(5),
            ledger_mode: mode,
            ..AdmissionSettings::default()
        };
        let coordinator = AdmissionCoordinator::new(
            store.clone(),
            store.clone(),
            Arc::new(CapacityPolicy::new(
                AdmissionLimits::new(minimum_available).with_review_type("unpaid"),
            )),
            fanout,
            settings,
        );
        Harness { store, published, coordinator }
    }

    fn submit(employee: &str, request: &str, start: u32, end: u32) -> LeaveEvent {
        LeaveEvent {
            request_id: RequestId(request.into()),
            employee_id: EmployeeId(employee.into()),
            issued_at: Utc::now(),
            kind: LeaveEventKind::Submitted {
                leave_type: LeaveType::new("annual").expect("leave type"),
                range: DateRange::new(
                    NaiveDate::from_ymd_opt(2026, 9, start).expect("date"),
                    NaiveDate::from_ymd_opt(2026, 9, end).expect("date"),
                )
                .expect("range"),
            },
        }
    }

    #[tokio::test]
    async fn approval_commits_state_ledger_and_publishes() {
        let harness = harness(5, 2, LedgerMode::Transactional).await;
        let report = harness.coordinator.handle(&submit("e-1", "r-1", 7, 11)).await.expect("handle");

        assert_eq!(report.outcome.decision, Decision::Approved);
        assert_eq!(report.disposition, HandleDisposition::Applied { attempts: 1 });

        let quota = harness.store.get_quota(&EmployeeId("e-1".into())).await.expect("read").expect("quota");
        assert_eq!((quota.taken_ytd, quota.available_days), (5, 15));
        assert_eq!(harness.store.ledger_entries().await.len(), 1);
        assert_eq!(harness.published.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn redelivery_replays_the_recorded_outcome() {
        let harness = harness(5, 2, LedgerMode::Transactional).await;
        let event = submit("e-1", "r-1", 7, 11);
        let first = harness.coordinator.handle(&event).await.expect("first");
        let second = harness.coordinator.handle(&event).await.expect("second");

        assert_eq!(second.disposition, HandleDisposition::Replayed);
        assert_eq!(second.outcome, first.outcome);
        let quota = harness.store.get_quota(&EmployeeId("e-1".into())).await.expect("read").expect("quota");
        assert_eq!(quota.taken_ytd, 5);
        assert_eq!(harness.published.outcomes().len(), 2);
    }

    #[tokio::test]
    async fn reused_request_id_with_other_payload_is_malformed() {
        let harness = harness(5, 2, LedgerMode::Transactional).await;
        harness.coordinator.handle(&submit("e-1", "r-1", 7, 11)).await.expect("first");

        let error = harness.coordinator.handle(&submit("e-1", "r-1", 7, 15)).await.expect_err("reuse");
        assert_eq!(error.error_class(), "malformed_event");
    }

    #[tokio::test]
    async fn lost_races_exhaust_the_budget_without_changing_state() {
        let harness = harness(5, 2, LedgerMode::Transactional).await;
        harness.store.force_conflicts(3);

        let error = harness.coordinator.handle(&submit("e-1", "r-1", 7, 11)).await.expect_err("exhausted");
        assert!(matches!(error, AdmissionError::ConcurrencyExhausted { attempts: 3, .. }));
        let quota = harness.store.get_quota(&EmployeeId("e-1".into())).await.expect("read").expect("quota");
        assert_eq!(quota.taken_ytd, 0);
        assert!(harness.published.outcomes().is_empty());
    }

    #[tokio::test]
    async fn a_lost_race_is_retried_against_fresh_state() {
        let harness = harness(5, 2, LedgerMode::Transactional).await;
        harness.store.force_conflicts(2);

        let report = harness.coordinator.handle(&submit("e-1", "r-1", 7, 11)).await.expect("handle");
        assert_eq!(report.disposition, HandleDisposition::Applied { attempts: 3 });
    }

    #[tokio::test]
    async fn store_outage_is_transient_and_the_retry_decides() {
        let harness = harness(5, 2, LedgerMode::ReserveThenComplete).await;
        harness.store.fail_next_snapshots(1);

        let error = harness.coordinator.handle(&submit("e-1", "r-1", 7, 11)).await.expect_err("outage");
        assert_eq!(error.error_class(), "transient_store");

        let report = harness.coordinator.handle(&submit("e-1", "r-1", 7, 11)).await.expect("retry");
        assert_eq!(report.outcome.decision, Decision::Approved);
    }

    #[tokio::test]
    async fn crash_before_ledger_completion_is_reconciled_without_double_counting() {
        let harness = harness(5, 2, LedgerMode::ReserveThenComplete).await;
        let event = submit("e-1", "r-1", 7, 11);
        harness.store.fail_next_completions(1);

        let error = harness.coordinator.handle(&event).await.expect_err("crash window");
        assert_eq!(error.error_class(), "transient_store");
        let entry = harness
            .store
            .find(&crate::ledger::IdempotencyKey::for_event(&event))
            .await
            .expect("find")
            .expect("reserved entry");
        assert_eq!(entry.state, crate::ledger::LedgerEntryState::Reserved);

        let report = harness.coordinator.handle(&event).await.expect("redelivery");
        assert_eq!(report.disposition, HandleDisposition::Reconciled);
        assert_eq!(report.outcome.decision, Decision::Approved);
        assert_eq!(report.outcome.reason, DecisionReason::WithinPolicy);

        let quota = harness.store.get_quota(&EmployeeId("e-1".into())).await.expect("read").expect("quota");
        assert_eq!((quota.taken_ytd, quota.available_days), (5, 15));
        assert!(harness.store.has_seen(&crate::ledger::IdempotencyKey::for_event(&event)).await.expect("seen"));
    }

    #[tokio::test]
    async fn hung_ledger_completion_is_cut_off_at_the_handle_deadline() {
        let mut harness = harness(5, 2, LedgerMode::ReserveThenComplete).await;
        harness.coordinator.settings.handle_timeout = Duration::from_millis(50);
        let event = submit("e-1", "r-1", 7, 11);
        harness.store.stall_next_completions(1);

        let started = std::time::Instant::now();
        let error = harness.coordinator.handle(&event).await.expect_err("deadline");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(error, AdmissionError::TransientStore(StoreError::Timeout { timeout_ms: 50 })));
        assert!(harness.published.outcomes().is_empty());

        let report = harness.coordinator.handle(&event).await.expect("redelivery");
        assert_eq!(report.disposition, HandleDisposition::Reconciled);
        let quota = harness.store.get_quota(&EmployeeId("e-1".into())).await.expect("read").expect("quota");
        assert_eq!(quota.taken_ytd, 5);
    }

    #[tokio::test]
    async fn outbox_outage_leaves_the_event_for_redelivery() {
        let store = Arc::new(InMemoryAdmissionStore::new());
        let employee = EmployeeId("e-1".into());
        store
            .onboard(
                AvailabilityRecord::onboard(employee.clone(), Utc::now()),
                QuotaRecord::onboard(employee.clone(), 20, 0, 0, Utc::now()).expect("quota"),
            )
            .await
            .expect("onboard");
        let outbox = Arc::new(InMemoryOutcomeOutbox::default());
        outbox.fail_next_enqueues(1);
        let refusing = Arc::new(RefusingPublisher);
        let coordinator = AdmissionCoordinator::new(
            store.clone(),
            store.clone(),
            Arc::new(CapacityPolicy::new(AdmissionLimits::new(0))),
            OutcomeFanout::new(PublishRetryPolicy { max_retries: 1, backoff: Backoff::new(0, 0) })
                .with_outbox(outbox.clone())
                .with_publisher(refusing),
            AdmissionSettings { backoff: Backoff::new(0, 0), ..AdmissionSettings::default() },
        );
        let event = submit("e-1", "r-1", 7, 8);

        let error = coordinator.handle(&event).await.expect_err("outbox offline");
        assert_eq!(error.error_class(), "transient_store");

        let report = coordinator.handle(&event).await.expect("redelivery");
        assert_eq!(report.disposition, HandleDisposition::Replayed);
        assert_eq!(outbox.all().await.len(), 1);
        let quota = store.get_quota(&employee).await.expect("read").expect("quota");
        assert_eq!(quota.taken_ytd, 2);
    }

    #[tokio::test]
    async fn unknown_employee_is_malformed() {
        let harness = harness(2, 1, LedgerMode::Transactional).await;
        let error = harness.coordinator.handle(&submit("stranger", "r-1", 7, 8)).await.expect_err("unknown");
        assert_eq!(error.error_class(), "malformed_event");
    }

    #[tokio::test]
    async fn no_op_cancellation_is_recorded_and_replayed() {
        let harness = harness(3, 1, LedgerMode::Transactional).await;
        let cancel = LeaveEvent {
            request_id: RequestId("never-submitted".into()),
            employee_id: EmployeeId("e-0".into()),
            issued_at: Utc::now(),
            kind: LeaveEventKind::Cancelled,
        };

        let first = harness.coordinator.handle(&cancel).await.expect("first");
        assert_eq!(first.outcome.decision, Decision::NoOp);
        let second = harness.coordinator.handle(&cancel).await.expect("second");
        assert_eq!(second.disposition, HandleDisposition::Replayed);
    }
}
